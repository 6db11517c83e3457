use super::{MapEvent, ReplicatedMap, COMMIT_KEY};
use crate::config::{ErrorsConfig, MappingsConfig};
use crate::mapping::{load_directory, load_error_file, MappingSnapshot, VersionDefinition};
use crate::plugin::PluginRegistry;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, info, warn};

/// Where the local mapping configuration comes from.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub directory: PathBuf,
    pub optional: bool,
    pub error_file: Option<PathBuf>,
    pub default_version: Option<String>,
    pub settle: Duration,
}

impl StoreSettings {
    pub fn from_config(mappings: &MappingsConfig, errors: &ErrorsConfig) -> Self {
        Self {
            directory: mappings.directory.clone(),
            optional: mappings.optional,
            error_file: errors.file.clone(),
            default_version: mappings.default_version.clone(),
            settle: Duration::from_millis(mappings.settle_ms),
        }
    }
}

/// Outcome of a successful reload.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub generation: u64,
    pub versions: usize,
    pub endpoints: usize,
    pub elapsed_ms: u64,
}

/// Raw replicated contents: version → definition JSON, status → body, and
/// the commit marker of the publish they belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Mirror {
    mappings: BTreeMap<String, String>,
    errors: BTreeMap<String, String>,
    /// `None` while a publish is in progress.
    commit: Option<String>,
}

impl Mirror {
    fn from_local(defs: &[VersionDefinition], errors: &BTreeMap<u16, String>, commit: String) -> Result<Self> {
        let mut mappings = BTreeMap::new();
        for def in defs {
            mappings.insert(def.version.clone(), serde_json::to_string(def)?);
        }
        Ok(Self {
            mappings,
            errors: errors.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            commit: Some(commit),
        })
    }

    fn from_entries(mappings: Vec<(String, String)>, errors: Vec<(String, String)>) -> Self {
        let mut mirror = Self::default();
        for (key, value) in mappings {
            mirror.apply(MapKind::Mappings, MapEvent::Put { key, value });
        }
        for (key, value) in errors {
            mirror.apply(MapKind::Errors, MapEvent::Put { key, value });
        }
        mirror
    }

    fn same_contents(&self, other: &Mirror) -> bool {
        self.mappings == other.mappings && self.errors == other.errors
    }

    fn apply(&mut self, which: MapKind, event: MapEvent) {
        if matches!(which, MapKind::Mappings) && event.key() == COMMIT_KEY {
            self.commit = match event {
                MapEvent::Put { value, .. } => Some(value),
                MapEvent::Removed { .. } => None,
            };
            return;
        }
        let table = match which {
            MapKind::Mappings => &mut self.mappings,
            MapKind::Errors => &mut self.errors,
        };
        match event {
            MapEvent::Put { key, value } => {
                table.insert(key, value);
            }
            MapEvent::Removed { key } => {
                table.remove(&key);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MapKind {
    Mappings,
    Errors,
}

impl MapKind {
    fn label(&self) -> &'static str {
        match self {
            MapKind::Mappings => "mappings",
            MapKind::Errors => "errors",
        }
    }
}

/// Versioned mapping configuration, replicated across gateway nodes.
///
/// Readers take the current [`MappingSnapshot`] with [`ConfigStore::snapshot`].
/// A reload parses the local directory, swaps the snapshot on this node and
/// then republishes every version into the replicated map. Other nodes apply
/// the resulting events to a local mirror and swap once the burst settles
/// and the publisher's commit marker is back in place.
pub struct ConfigStore {
    mappings: Arc<dyn ReplicatedMap>,
    errors: Arc<dyn ReplicatedMap>,
    plugins: Arc<PluginRegistry>,
    settings: StoreSettings,
    snapshot: ArcSwap<MappingSnapshot>,
    /// Contents as seen through replication events.
    mirror: Mutex<Mirror>,
    /// Contents the current snapshot was compiled from.
    applied: Mutex<Mirror>,
    /// Serializes reloads, and holds off the listener while this node publishes.
    reload_mu: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    installed: watch::Sender<u64>,
}

impl ConfigStore {
    pub fn new(
        mappings: Arc<dyn ReplicatedMap>,
        errors: Arc<dyn ReplicatedMap>,
        plugins: Arc<PluginRegistry>,
        settings: StoreSettings,
    ) -> Self {
        let empty = MappingSnapshot::empty(settings.default_version.clone());
        Self {
            mappings,
            errors,
            plugins,
            settings,
            snapshot: ArcSwap::from_pointee(empty),
            mirror: Mutex::new(Mirror::default()),
            applied: Mutex::new(Mirror::default()),
            reload_mu: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            installed: watch::Sender::new(0),
        }
    }

    /// The generation serving requests right now.
    pub fn snapshot(&self) -> Arc<MappingSnapshot> {
        self.snapshot.load_full()
    }

    /// Generation of every snapshot installed from now on, whether by a local
    /// reload or by replication.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.installed.subscribe()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn backend(&self) -> &'static str {
        self.mappings.backend()
    }

    /// Parse the mapping directory and the global error file.
    pub fn load_local(&self) -> Result<(Vec<VersionDefinition>, BTreeMap<u16, String>)> {
        let defs = load_directory(&self.settings.directory)?;
        let errors = match &self.settings.error_file {
            Some(path) => load_error_file(path)?,
            None => BTreeMap::new(),
        };
        Ok((defs, errors))
    }

    fn compile(&self, defs: &[VersionDefinition], errors: &BTreeMap<u16, String>) -> Result<MappingSnapshot> {
        let generation = self.generation.load(Ordering::Relaxed) + 1;
        let snap = MappingSnapshot::compile(
            defs,
            errors,
            &self.plugins,
            self.settings.default_version.clone(),
            generation,
        )?;
        self.generation.store(generation, Ordering::Relaxed);
        Ok(snap)
    }

    fn install(&self, snap: MappingSnapshot, source: Mirror, origin: &'static str) -> u64 {
        let generation = snap.generation;
        let versions = snap.versions.len();
        let endpoints = snap.endpoint_count();
        self.snapshot.store(Arc::new(snap));
        if let Ok(mut applied) = self.applied.lock() {
            *applied = source;
        }
        metrics::gauge!("portico_mapping_generation").set(generation as f64);
        metrics::gauge!("portico_mapping_endpoints").set(endpoints as f64);
        info!(generation, versions, endpoints, origin, "store: snapshot installed");
        self.installed.send_replace(generation);
        generation
    }

    /// Reload from the local directory and publish to the cluster. On any
    /// error the current snapshot keeps serving.
    pub async fn reload(&self) -> Result<ReloadReport> {
        let _guard = self.reload_mu.lock().await;
        let start = Instant::now();

        let result = self.reload_locked().await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("portico_config_reloads_total", "source" => "local", "result" => outcome)
            .increment(1);

        let (generation, versions, endpoints) = result?;
        Ok(ReloadReport {
            generation,
            versions,
            endpoints,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn reload_locked(&self) -> Result<(u64, usize, usize)> {
        let (defs, errors) = self.load_local()?;
        let snap = self.compile(&defs, &errors)?;
        let versions = snap.versions.len();
        let endpoints = snap.endpoint_count();
        let source = Mirror::from_local(&defs, &errors, commit_token(snap.generation))?;

        let generation = self.install(snap, source.clone(), "reload");
        self.publish_mirror(&source).await.context("publishing mappings")?;
        Ok((generation, versions, endpoints))
    }

    /// Reload for the periodic timer: a missing optional directory is skipped.
    pub async fn reload_scheduled(&self) -> Result<Option<ReloadReport>> {
        if self.settings.optional && !self.settings.directory.exists() {
            info!(
                directory = %self.settings.directory.display(),
                "store: optional mapping directory missing, reload skipped"
            );
            return Ok(None);
        }
        self.reload().await.map(Some)
    }

    /// Publish already-merged definitions to every node, this one included,
    /// without touching the local directory. This node swaps through its
    /// listener like any other.
    pub async fn publish(&self, defs: &[VersionDefinition], errors: &BTreeMap<u16, String>) -> Result<()> {
        let source = Mirror::from_local(defs, errors, commit_token(self.generation.load(Ordering::Relaxed)))?;
        let _guard = self.reload_mu.lock().await;
        self.publish_mirror(&source).await
    }

    /// Replace the replicated contents: remove every existing key one at a
    /// time, then put the new entries. The commit marker goes first and comes
    /// back last; followers do not install while it is missing.
    async fn publish_mirror(&self, source: &Mirror) -> Result<()> {
        self.mappings.remove(COMMIT_KEY).await?;
        replace_all(self.mappings.as_ref(), &source.mappings).await?;
        replace_all(self.errors.as_ref(), &source.errors).await?;
        if let Some(commit) = &source.commit {
            self.mappings.put(COMMIT_KEY, commit.clone()).await?;
        }
        info!(
            versions = source.mappings.len(),
            errors = source.errors.len(),
            backend = self.mappings.backend(),
            "store: published"
        );
        Ok(())
    }

    /// Rebuild the mirror from the replicated maps and install it. Used when
    /// a node joins and when the listener falls behind.
    pub async fn sync_from_store(&self) -> Result<bool> {
        let fresh = Mirror::from_entries(self.mappings.entries().await?, self.errors.entries().await?);
        if let Ok(mut mirror) = self.mirror.lock() {
            *mirror = fresh;
        }
        Ok(self.apply_mirror("sync"))
    }

    /// Compile and install a committed mirror if its contents differ from
    /// what is serving. Returns whether a new snapshot was installed.
    fn apply_mirror(&self, origin: &'static str) -> bool {
        let Ok(mirror) = self.mirror.lock().map(|m| m.clone()) else {
            return false;
        };
        if mirror.commit.is_none() {
            debug!(origin, "store: publish in progress, keeping current snapshot");
            return false;
        }
        {
            let Ok(mut applied) = self.applied.lock() else {
                return false;
            };
            if applied.same_contents(&mirror) {
                applied.commit = mirror.commit.clone();
                return false;
            }
        }

        match self.compile_mirror(&mirror) {
            Ok(snap) => {
                self.install(snap, mirror, origin);
                metrics::counter!("portico_config_reloads_total", "source" => "replication", "result" => "success")
                    .increment(1);
                true
            }
            Err(e) => {
                error!(error = %e, origin, "store: replicated configuration rejected, keeping current snapshot");
                metrics::counter!("portico_config_reloads_total", "source" => "replication", "result" => "error")
                    .increment(1);
                false
            }
        }
    }

    fn compile_mirror(&self, mirror: &Mirror) -> Result<MappingSnapshot> {
        let mut defs = Vec::with_capacity(mirror.mappings.len());
        for (version, json) in &mirror.mappings {
            let def: VersionDefinition = serde_json::from_str(json)
                .with_context(|| format!("decoding replicated version '{}'", version))?;
            defs.push(def);
        }
        let mut errors = BTreeMap::new();
        for (code, body) in &mirror.errors {
            let status: u16 = code
                .parse()
                .with_context(|| format!("replicated error override key '{}'", code))?;
            errors.insert(status, body.clone());
        }
        self.compile(&defs, &errors)
    }

    /// Follow both replicated maps until `shutdown`. Subscribes before
    /// returning, so call it before [`ConfigStore::sync_from_store`].
    pub fn start_listener(self: &Arc<Self>, shutdown: Arc<Notify>) {
        let mut mappings_rx = self.mappings.subscribe();
        let mut errors_rx = self.errors.subscribe();
        let store = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                // Wait for the first event of a burst.
                let first = tokio::select! {
                    ev = mappings_rx.recv() => (MapKind::Mappings, ev),
                    ev = errors_rx.recv() => (MapKind::Errors, ev),
                    _ = shutdown.notified() => return,
                };
                let mut resync = match store.absorb(first) {
                    Absorbed::Applied => false,
                    Absorbed::Lagged => true,
                    Absorbed::Closed => return,
                };

                // Keep absorbing until the maps stay quiet for the settle window.
                loop {
                    let next = tokio::select! {
                        ev = mappings_rx.recv() => (MapKind::Mappings, ev),
                        ev = errors_rx.recv() => (MapKind::Errors, ev),
                        _ = tokio::time::sleep(store.settings.settle) => break,
                        _ = shutdown.notified() => return,
                    };
                    match store.absorb(next) {
                        Absorbed::Applied => {}
                        Absorbed::Lagged => resync = true,
                        Absorbed::Closed => return,
                    }
                }

                // Wait out a local publish in progress.
                let _guard = store.reload_mu.lock().await;
                loop {
                    let pending = match mappings_rx.try_recv() {
                        Ok(ev) => (MapKind::Mappings, Ok(ev)),
                        Err(broadcast::error::TryRecvError::Lagged(n)) => (MapKind::Mappings, Err(RecvError::Lagged(n))),
                        Err(_) => match errors_rx.try_recv() {
                            Ok(ev) => (MapKind::Errors, Ok(ev)),
                            Err(broadcast::error::TryRecvError::Lagged(n)) => (MapKind::Errors, Err(RecvError::Lagged(n))),
                            Err(_) => break,
                        },
                    };
                    if let Absorbed::Lagged = store.absorb(pending) {
                        resync = true;
                    }
                }

                if resync {
                    warn!("store: listener fell behind, resynchronising");
                    if let Err(e) = store.sync_from_store().await {
                        error!(error = %e, "store: resync failed");
                    }
                } else {
                    store.apply_mirror("replication");
                }
            }
        });
    }

    fn absorb(&self, (which, event): (MapKind, Result<MapEvent, RecvError>)) -> Absorbed {
        match event {
            Ok(ev) => {
                metrics::counter!(
                    "portico_store_events_total",
                    "map" => which.label(),
                    "kind" => ev.kind(),
                )
                .increment(1);
                tracing::debug!(map = which.label(), key = ev.key(), kind = ev.kind(), "store: event");
                if let Ok(mut mirror) = self.mirror.lock() {
                    mirror.apply(which, ev);
                }
                Absorbed::Applied
            }
            Err(RecvError::Lagged(n)) => {
                warn!(map = which.label(), skipped = n, "store: listener lagged");
                Absorbed::Lagged
            }
            Err(RecvError::Closed) => Absorbed::Closed,
        }
    }
}

enum Absorbed {
    Applied,
    Lagged,
    Closed,
}

/// Marker value unique to one publish.
fn commit_token(generation: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{}", generation, nanos)
}

async fn replace_all(map: &dyn ReplicatedMap, entries: &BTreeMap<String, String>) -> Result<()> {
    for key in map.keys().await? {
        map.remove(&key).await?;
    }
    for (key, value) in entries {
        map.put(key, value.clone()).await?;
    }
    Ok(())
}
