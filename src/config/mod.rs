pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            mappings_dir = %config.mappings.directory.display(),
            distributed = config.store.is_distributed(),
            static_client_limits = config.rate_limit.clients.len(),
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Apply environment variable overrides for connection/infra settings.
    /// Endpoint mappings are managed through the mapping directory and the
    /// replicated store, never through environment variables.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORTICO_MAPPINGS_DIR") {
            self.mappings.directory = v.into();
        }
        if let Ok(v) = std::env::var("PORTICO_DEFAULT_VERSION") {
            self.mappings.default_version = Some(v);
        }
        if let Ok(v) = std::env::var("PORTICO_RELOAD_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.mappings.reload_interval_secs = Some(n);
            }
        }
        if let Ok(v) = std::env::var("PORTICO_PUBLISH_ON_START") {
            self.mappings.publish_on_start = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("PORTICO_ERRORS_FILE") {
            self.errors.file = Some(v.into());
        }

        // etcd
        if let Ok(v) = std::env::var("PORTICO_ETCD_ENDPOINTS") {
            self.store.etcd.endpoints = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("PORTICO_ETCD_MAPPINGS_PREFIX") {
            self.store.etcd.mappings_prefix = v;
        }
        if let Ok(v) = std::env::var("PORTICO_ETCD_ERRORS_PREFIX") {
            self.store.etcd.errors_prefix = v;
        }
        if let Ok(v) = std::env::var("PORTICO_ETCD_USERNAME") {
            self.store.etcd.username = Some(v);
        }
        if let Ok(v) = std::env::var("PORTICO_ETCD_PASSWORD") {
            self.store.etcd.password = Some(v);
        }

        // collaborators
        if let Ok(v) = std::env::var("PORTICO_AUTH_VALIDATE_URL") {
            self.auth.validate_url = Some(v);
        }
        if let Ok(v) = std::env::var("PORTICO_LIMITS_URL") {
            self.rate_limit.limits_url = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mappings.directory.as_os_str().is_empty() {
            anyhow::bail!("mappings.directory must not be empty");
        }
        if self.mappings.reload_interval_secs == Some(0) {
            anyhow::bail!("mappings.reload_interval_secs must be greater than 0");
        }
        if self.rate_limit.reset_interval_secs == 0 {
            anyhow::bail!("rate_limit.reset_interval_secs must be greater than 0");
        }
        if http::StatusCode::from_u16(self.rate_limit.rejected_code).is_err() {
            anyhow::bail!(
                "rate_limit.rejected_code {} is not a valid HTTP status",
                self.rate_limit.rejected_code
            );
        }
        for (client, limit) in &self.rate_limit.clients {
            if limit.requests < 0 {
                anyhow::bail!("rate_limit.clients.{}: requests must not be negative", client);
            }
        }
        if self.backend.connect_timeout_ms == 0 || self.backend.response_timeout_ms == 0 {
            anyhow::bail!("backend timeouts must be greater than 0");
        }
        if let Some(ref url) = self.auth.validate_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("auth.validate_url must be an http(s) URL, got '{}'", url);
            }
        }
        if let Some(ref url) = self.rate_limit.limits_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("rate_limit.limits_url must be an http(s) URL, got '{}'", url);
            }
        }
        Ok(())
    }
}
