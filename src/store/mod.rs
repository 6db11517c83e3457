//! Replicated key/value maps and the mapping configuration store built on them.

pub mod config_store;
pub mod etcd;
pub mod memory;

pub use config_store::{ConfigStore, ReloadReport, StoreSettings};
pub use etcd::EtcdMap;
pub use memory::InMemoryMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// A change observed on a replicated map, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent {
    Put { key: String, value: String },
    Removed { key: String },
}

impl MapEvent {
    pub fn key(&self) -> &str {
        match self {
            MapEvent::Put { key, .. } | MapEvent::Removed { key } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MapEvent::Put { .. } => "put",
            MapEvent::Removed { .. } => "removed",
        }
    }
}

/// String map shared by every gateway node. Every node sees every change,
/// including its own, through [`ReplicatedMap::subscribe`].
#[async_trait]
pub trait ReplicatedMap: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Current contents, sorted by key. Implementations that resume a change
    /// feed from the last listing treat this as a resync point.
    async fn entries(&self) -> Result<Vec<(String, String)>>;

    /// Current keys, sorted. Never moves a change feed's resume point, so a
    /// writer can list what to remove without hiding events from followers.
    async fn keys(&self) -> Result<Vec<String>>;

    fn subscribe(&self) -> broadcast::Receiver<MapEvent>;

    /// Human-readable backend name for logs and the admin API.
    fn backend(&self) -> &'static str;
}

/// Key the publisher writes after a complete publish and removes before the
/// next one starts. Version names cannot contain `/`, so it never collides.
pub const COMMIT_KEY: &str = "meta/commit";

/// Capacity of the per-map event channel. A listener that falls further
/// behind than this resynchronises from `entries()`.
pub(crate) const EVENT_BUFFER: usize = 4096;
