use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
pub(crate) fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub mappings: MappingsConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub errors: ErrorsConfig,

    /// Replicated store the mapping tables are published to.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub store: StoreConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub auth: AuthConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rate_limit: RateLimitConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backend: BackendConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingsConfig {
    /// Directory holding one mapping unit per file (`.toml` / `.json`).
    #[serde(default = "default_mappings_dir")]
    pub directory: PathBuf,

    /// When true a missing directory is skipped, at startup and on scheduled
    /// reloads, instead of being reported as an error. `POST /reload` still
    /// reports it.
    #[serde(default)]
    pub optional: bool,

    /// Version used for request paths that do not start with a loaded
    /// version segment.
    #[serde(default)]
    pub default_version: Option<String>,

    /// Periodic reload from `directory`. Disabled when unset.
    #[serde(default)]
    pub reload_interval_secs: Option<u64>,

    /// Whether this node parses `directory` and publishes at startup.
    /// Nodes with `false` only follow the replicated store.
    #[serde(default = "default_true")]
    pub publish_on_start: bool,

    /// Quiet period used to coalesce bursts of replication events
    /// into a single snapshot swap.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for MappingsConfig {
    fn default() -> Self {
        Self {
            directory: default_mappings_dir(),
            optional: false,
            default_version: None,
            reload_interval_secs: None,
            publish_on_start: true,
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_mappings_dir() -> PathBuf {
    PathBuf::from("mappings")
}

fn default_settle_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorsConfig {
    /// Global error override file (status code → literal body).
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub etcd: EtcdConfig,
}

impl StoreConfig {
    /// An empty endpoint list selects the in-process replicated map.
    pub fn is_distributed(&self) -> bool {
        !self.etcd.endpoints.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default = "default_etcd_mappings_prefix")]
    pub mappings_prefix: String,

    #[serde(default = "default_etcd_errors_prefix")]
    pub errors_prefix: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            mappings_prefix: default_etcd_mappings_prefix(),
            errors_prefix: default_etcd_errors_prefix(),
            username: None,
            password: None,
        }
    }
}

fn default_etcd_mappings_prefix() -> String {
    "/portico/mappings".to_string()
}

fn default_etcd_errors_prefix() -> String {
    "/portico/errors".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token validation endpoint, called as `GET {validate_url}?token=...`.
    #[serde(default)]
    pub validate_url: Option<String>,

    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            validate_url: None,
            timeout_ms: default_auth_timeout_ms(),
        }
    }
}

fn default_auth_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// All client counters are dropped every `reset_interval_secs`.
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_rejected_code")]
    pub rejected_code: u16,

    /// Client-limit lookup endpoint, called as `GET {limits_url}/{client_id}`.
    #[serde(default)]
    pub limits_url: Option<String>,

    /// Static per-client limits; consulted before `limits_url`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub clients: BTreeMap<String, ClientLimitConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            reset_interval_secs: default_reset_interval(),
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
            rejected_code: default_rejected_code(),
            limits_url: None,
            clients: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLimitConfig {
    pub requests: i64,
    #[serde(default = "default_reset_interval")]
    pub window_secs: u64,
}

fn default_reset_interval() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_rejected_code() -> u16 {
    429
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for the whole exchange: connect, write, response head and body.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default = "default_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_pool_size")]
    pub pool_max_idle_per_host: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            pool_idle_timeout_secs: default_idle_timeout(),
            pool_max_idle_per_host: default_pool_size(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    32
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Lifecycle hook class identifiers to enable, in invocation order.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub hooks: Vec<String>,
}
