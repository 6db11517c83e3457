//! Typed registry of request actions, response filters and lifecycle hooks.
//!
//! Mapping units name plugins by class identifier. Every identifier is
//! resolved to a factory when the mapping snapshot is compiled, so an
//! unknown class fails the load instead of a request. A fresh instance is
//! created for each invocation.

pub mod builtin;

use crate::auth::AuthContext;
use crate::upstream::{BackendRequest, BackendResponse};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// What an action or filter can report besides success.
#[derive(Debug)]
pub enum PluginError {
    /// Stop the pipeline and answer with this response.
    Respond(BackendResponse),
    /// Stop the pipeline; answered with a 500.
    Failed(String),
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::Respond(r) => write!(f, "plugin responded with {}", r.status),
            PluginError::Failed(msg) => write!(f, "plugin failed: {}", msg),
        }
    }
}

/// Read-only request facts available to actions.
pub struct ActionContext<'a> {
    pub version: &'a str,
    pub auth: &'a AuthContext,
    /// Variables captured from the external path.
    pub variables: &'a [(String, String)],
}

/// Rewrites the backend request before it is sent. `req.uri` holds the
/// resolved internal URI.
pub trait Action: Send {
    fn execute(&mut self, req: &mut BackendRequest, ctx: &ActionContext<'_>) -> Result<(), PluginError>;
}

/// Rewrites a successful (status < 300) backend response.
pub trait Filter: Send {
    fn execute(&mut self, resp: &mut BackendResponse) -> Result<(), PluginError>;
}

/// Facts handed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct HookEvent<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub version: &'a str,
    pub internal_uri: &'a str,
}

/// Observes the dispatch. Errors are logged and never affect the request.
pub trait LifecycleHook: Send + Sync {
    fn pre_send(&self, _event: &HookEvent<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_receive(&self, _event: &HookEvent<'_>, _status: u16) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_exception(&self, _event: &HookEvent<'_>, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type ActionFactory = Arc<dyn Fn() -> Box<dyn Action> + Send + Sync>;
pub type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;
pub type HookFactory = Arc<dyn Fn() -> Arc<dyn LifecycleHook> + Send + Sync>;

/// Reference to a plugin from an endpoint: an explicit class, or a name
/// looked up in the version's name → class table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

impl PluginRef {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            class: None,
        }
    }

    /// Explicit class wins over the name table.
    pub fn class_id<'a>(&'a self, table: &'a BTreeMap<String, String>) -> anyhow::Result<&'a str> {
        if let Some(class) = self.class.as_deref() {
            return Ok(class);
        }
        match self.name.as_deref() {
            Some(name) => table
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| anyhow::anyhow!("plugin name '{}' is not declared", name)),
            None => anyhow::bail!("plugin reference has neither name nor class"),
        }
    }
}

/// A resolved action: the class id and the factory producing instances.
#[derive(Clone)]
pub struct ResolvedAction {
    pub class: Arc<str>,
    factory: ActionFactory,
}

impl ResolvedAction {
    pub fn instantiate(&self) -> Box<dyn Action> {
        (self.factory)()
    }
}

impl fmt::Debug for ResolvedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAction").field("class", &self.class).finish()
    }
}

#[derive(Clone)]
pub struct ResolvedFilter {
    pub class: Arc<str>,
    factory: FilterFactory,
}

impl ResolvedFilter {
    pub fn instantiate(&self) -> Box<dyn Filter> {
        (self.factory)()
    }
}

impl fmt::Debug for ResolvedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFilter").field("class", &self.class).finish()
    }
}

/// Class identifier → factory. Populated before startup and then shared
/// read-only through `Arc`.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    actions: HashMap<String, ActionFactory>,
    filters: HashMap<String, FilterFactory>,
    hooks: HashMap<String, HookFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the plugins shipped in [`builtin`].
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        builtin::register(&mut reg);
        reg
    }

    pub fn register_action<F>(&mut self, class: &str, factory: F)
    where
        F: Fn() -> Box<dyn Action> + Send + Sync + 'static,
    {
        self.actions.insert(class.to_string(), Arc::new(factory));
    }

    pub fn register_filter<F>(&mut self, class: &str, factory: F)
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync + 'static,
    {
        self.filters.insert(class.to_string(), Arc::new(factory));
    }

    pub fn register_hook<F>(&mut self, class: &str, factory: F)
    where
        F: Fn() -> Arc<dyn LifecycleHook> + Send + Sync + 'static,
    {
        self.hooks.insert(class.to_string(), Arc::new(factory));
    }

    pub fn resolve_action(
        &self,
        r: &PluginRef,
        table: &BTreeMap<String, String>,
    ) -> anyhow::Result<ResolvedAction> {
        let class = r.class_id(table)?;
        let factory = self
            .actions
            .get(class)
            .ok_or_else(|| anyhow::anyhow!("unknown action class '{}'", class))?;
        Ok(ResolvedAction {
            class: Arc::from(class),
            factory: factory.clone(),
        })
    }

    pub fn resolve_filter(
        &self,
        r: &PluginRef,
        table: &BTreeMap<String, String>,
    ) -> anyhow::Result<ResolvedFilter> {
        let class = r.class_id(table)?;
        let factory = self
            .filters
            .get(class)
            .ok_or_else(|| anyhow::anyhow!("unknown filter class '{}'", class))?;
        Ok(ResolvedFilter {
            class: Arc::from(class),
            factory: factory.clone(),
        })
    }

    /// Instantiate the configured hooks, in order. Unknown classes fail.
    pub fn build_hooks(&self, classes: &[String]) -> anyhow::Result<Vec<Arc<dyn LifecycleHook>>> {
        classes
            .iter()
            .map(|class| {
                self.hooks
                    .get(class)
                    .map(|f| f())
                    .ok_or_else(|| anyhow::anyhow!("unknown hook class '{}'", class))
            })
            .collect()
    }
}
