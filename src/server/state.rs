use crate::auth::{IntrospectionValidator, RejectAllValidator, TokenValidator};
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::plugin::{LifecycleHook, PluginRegistry};
use crate::ratelimit::{source_from_config, RateLimiter};
use crate::store::{ConfigStore, ReplicatedMap, StoreSettings};
use crate::upstream::BackendPool;
use anyhow::{Context, Result};
use http::StatusCode;
use std::sync::Arc;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Every service is built once here and shared by `Arc`; nothing in the
/// crate reaches for a process-wide singleton except the metrics recorder.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<ConfigStore>,
    pub backends: BackendPool,
    pub limiter: Arc<RateLimiter>,
    pub validator: Arc<dyn TokenValidator>,
    pub hooks: Arc<[Arc<dyn LifecycleHook>]>,
    pub metrics: Option<Metrics>,
    pub node_id: Arc<str>,
    rejected_code: StatusCode,
}

impl GatewayState {
    /// Build every service from `config`. `mappings` and `errors` are the
    /// replicated maps backing the config store; `plugins` must already hold
    /// any classes registered by the embedding binary.
    pub fn build(
        config: GatewayConfig,
        mappings: Arc<dyn ReplicatedMap>,
        errors: Arc<dyn ReplicatedMap>,
        plugins: PluginRegistry,
    ) -> Result<Self> {
        let rejected_code = StatusCode::from_u16(config.rate_limit.rejected_code)
            .context("rate_limit.rejected_code")?;

        let validator: Arc<dyn TokenValidator> = match config.auth.validate_url.as_deref() {
            Some(url) => Arc::new(IntrospectionValidator::new(url, config.auth.timeout_ms)?),
            None => {
                info!("auth: no validate_url configured, authenticated endpoints will reject every token");
                Arc::new(RejectAllValidator)
            }
        };

        let limiter = Arc::new(RateLimiter::new(
            &config.rate_limit,
            source_from_config(&config.rate_limit)?,
        ));
        let hooks: Arc<[Arc<dyn LifecycleHook>]> = plugins.build_hooks(&config.plugins.hooks)?.into();

        let settings = StoreSettings::from_config(&config.mappings, &config.errors);
        let store = Arc::new(ConfigStore::new(mappings, errors, Arc::new(plugins), settings));
        let backends = BackendPool::new(config.backend.clone());

        let node_id: Arc<str> = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
            .into();

        info!(
            node_id = %node_id,
            store = store.backend(),
            hooks = hooks.len(),
            "server: state built"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            backends,
            limiter,
            validator,
            hooks,
            metrics: None,
            node_id,
            rejected_code,
        })
    }

    /// Attach the Prometheus handle rendered by the admin listener.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn rejected_code(&self) -> StatusCode {
        self.rejected_code
    }
}
