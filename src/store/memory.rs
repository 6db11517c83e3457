use super::{MapEvent, ReplicatedMap, EVENT_BUFFER};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Process-local replicated map. Clones share the same contents and event
/// channel, so several stores in one process behave like cluster nodes.
#[derive(Clone)]
pub struct InMemoryMap {
    inner: Arc<Inner>,
}

struct Inner {
    entries: DashMap<String, String>,
    events: broadcast::Sender<MapEvent>,
}

impl Default for InMemoryMap {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                events,
            }),
        }
    }
}

impl InMemoryMap {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplicatedMap for InMemoryMap {
    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.inner.entries.insert(key.to_string(), value.clone());
        // No subscribers is not an error.
        let _ = self.inner.events.send(MapEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.inner.entries.remove(key).is_some() {
            let _ = self.inner.events.send(MapEvent::Removed {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut out: Vec<(String, String)> = self
            .inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        out.sort();
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<MapEvent> {
        self.inner.events.subscribe()
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_contents_and_events() {
        let a = InMemoryMap::new();
        let b = a.clone();
        let mut rx = b.subscribe();

        a.put("v1", "one".into()).await.unwrap();
        assert_eq!(b.entries().await.unwrap(), vec![("v1".into(), "one".into())]);
        assert_eq!(
            rx.recv().await.unwrap(),
            MapEvent::Put {
                key: "v1".into(),
                value: "one".into()
            }
        );

        a.remove("v1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), MapEvent::Removed { key: "v1".into() });
        assert!(b.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removing_absent_key_emits_nothing() {
        let m = InMemoryMap::new();
        let mut rx = m.subscribe();
        m.remove("ghost").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_entries_sorted() {
        let m = InMemoryMap::new();
        m.put("v2", "b".into()).await.unwrap();
        m.put("v1", "a".into()).await.unwrap();
        let keys: Vec<String> = m.entries().await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["v1", "v2"]);
        assert_eq!(m.keys().await.unwrap(), keys);
    }
}
