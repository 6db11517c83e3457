use super::{MapEvent, ReplicatedMap, EVENT_BUFFER};
use crate::etcd::client::b64_decode;
use crate::etcd::EtcdClient;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};

const WATCH_RETRY: Duration = Duration::from_secs(5);

/// Replicated map stored under one etcd key prefix. Changes from every node
/// arrive through a prefix watch started with [`EtcdMap::start_watch`].
pub struct EtcdMap {
    client: EtcdClient,
    prefix: String,
    events: broadcast::Sender<MapEvent>,
    /// Resume point of the watch. Only the watch and `entries()` advance it;
    /// `keys()` must not, or a reconnect would skip events never relayed.
    revision: AtomicI64,
}

impl EtcdMap {
    pub fn new(client: EtcdClient, prefix: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            client,
            prefix: normalize_prefix(prefix),
            events,
            revision: AtomicI64::new(0),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Watch the prefix until `shutdown`, reconnecting from the last seen
    /// revision. Call after the initial `entries()` so no change is missed.
    pub fn start_watch(self: &Arc<Self>, shutdown: Arc<Notify>) {
        let map = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let from = map.revision.load(Ordering::Relaxed);
                info!(prefix = %map.prefix, revision = from, "etcd: watch starting");

                tokio::select! {
                    result = map.watch_once(from) => {
                        match result {
                            Ok(()) => warn!(prefix = %map.prefix, "etcd: watch stream ended, reconnecting"),
                            Err(e) => error!(prefix = %map.prefix, error = %e, "etcd: watch failed, retrying"),
                        }
                    }
                    _ = shutdown.notified() => return,
                }

                tokio::select! {
                    _ = tokio::time::sleep(WATCH_RETRY) => {}
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    /// Relay events from one watch connection until it ends.
    async fn watch_once(&self, after_revision: i64) -> Result<()> {
        let mut stream = self.client.watch_prefix(&self.prefix, after_revision).await?;

        while let Some(resp) = stream.next_response().await {
            let Some(result) = resp.result else {
                continue;
            };
            if let Some(rev) = result.header.as_ref().and_then(|h| h.revision) {
                self.revision.fetch_max(rev, Ordering::Relaxed);
            }

            for event in result.events {
                let Some(kv) = event.kv else {
                    continue;
                };
                let Ok(full_key) = b64_decode(&kv.key) else {
                    continue;
                };
                let Some(key) = full_key.strip_prefix(&self.prefix) else {
                    continue;
                };
                if key.is_empty() {
                    continue;
                }

                let map_event = match event.event_type.as_deref().unwrap_or("PUT") {
                    "PUT" => match b64_decode(&kv.value) {
                        Ok(value) => MapEvent::Put {
                            key: key.to_string(),
                            value,
                        },
                        Err(e) => {
                            warn!(key = %full_key, error = %e, "etcd: watch: undecodable value");
                            continue;
                        }
                    },
                    "DELETE" => MapEvent::Removed {
                        key: key.to_string(),
                    },
                    _ => continue,
                };
                let _ = self.events.send(map_event);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicatedMap for EtcdMap {
    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.client.put(&self.full_key(key), &value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client.delete(&self.full_key(key)).await
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        let (kvs, revision) = self.client.get_prefix(&self.prefix).await?;
        self.revision.fetch_max(revision, Ordering::Relaxed);

        let mut out: Vec<(String, String)> = kvs
            .into_iter()
            .filter_map(|(k, v)| {
                let key = k.strip_prefix(&self.prefix)?.to_string();
                (!key.is_empty()).then_some((key, v))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = self
            .client
            .keys_with_prefix(&self.prefix)
            .await?
            .into_iter()
            .filter_map(|k| {
                let key = k.strip_prefix(&self.prefix)?.to_string();
                (!key.is_empty()).then_some(key)
            })
            .collect();
        out.sort();
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<MapEvent> {
        self.events.subscribe()
    }

    fn backend(&self) -> &'static str {
        "etcd"
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}
