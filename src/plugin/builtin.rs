use super::{Action, ActionContext, Filter, HookEvent, LifecycleHook, PluginError, PluginRegistry};
use crate::upstream::{BackendRequest, BackendResponse};
use http::header::{HeaderName, AUTHORIZATION, CACHE_CONTROL, SERVER};
use http::HeaderValue;
use std::sync::Arc;

pub const REPLACE_CUSTOMER_ID: &str = "portico.action.ReplaceCustomerId";
pub const FORWARD_IDENTITY: &str = "portico.action.ForwardIdentity";
pub const STRIP_AUTHORIZATION: &str = "portico.action.StripAuthorization";
pub const HIDE_SERVER_HEADERS: &str = "portico.filter.HideServerHeaders";
pub const NO_STORE: &str = "portico.filter.NoStore";
pub const LOG_HOOK: &str = "portico.hook.Log";

const CUSTOMER_ID_PLACEHOLDER: &str = "{customerId}";

pub fn register(reg: &mut PluginRegistry) {
    reg.register_action(REPLACE_CUSTOMER_ID, || Box::new(ReplaceCustomerId));
    reg.register_action(FORWARD_IDENTITY, || Box::new(ForwardIdentity));
    reg.register_action(STRIP_AUTHORIZATION, || Box::new(StripAuthorization));
    reg.register_filter(HIDE_SERVER_HEADERS, || Box::new(HideServerHeaders));
    reg.register_filter(NO_STORE, || Box::new(NoStore));
    reg.register_hook(LOG_HOOK, || Arc::new(LogHook));
}

/// Substitutes `{customerId}` in the internal URI with the token's subject.
pub struct ReplaceCustomerId;

impl Action for ReplaceCustomerId {
    fn execute(&mut self, req: &mut BackendRequest, ctx: &ActionContext<'_>) -> Result<(), PluginError> {
        if !req.uri.contains(CUSTOMER_ID_PLACEHOLDER) {
            return Ok(());
        }
        let subject = ctx
            .auth
            .subject_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PluginError::Failed("no subject id for {customerId}".to_string()))?;
        let encoded = urlencoding::encode(subject);
        req.uri = req.uri.replace(CUSTOMER_ID_PLACEHOLDER, &encoded);
        Ok(())
    }
}

/// Passes the authenticated identity to the backend as headers.
pub struct ForwardIdentity;

static SUBJECT_HEADER: HeaderName = HeaderName::from_static("x-portico-subject-id");
static CLIENT_HEADER: HeaderName = HeaderName::from_static("x-portico-client-id");

impl Action for ForwardIdentity {
    fn execute(&mut self, req: &mut BackendRequest, ctx: &ActionContext<'_>) -> Result<(), PluginError> {
        req.headers.remove(&SUBJECT_HEADER);
        req.headers.remove(&CLIENT_HEADER);
        if let Some(subject) = ctx.auth.subject_id.as_deref() {
            let v = HeaderValue::from_str(subject).map_err(|e| PluginError::Failed(e.to_string()))?;
            req.headers.insert(SUBJECT_HEADER.clone(), v);
        }
        if let Some(client) = ctx.auth.client_id.as_deref() {
            let v = HeaderValue::from_str(client).map_err(|e| PluginError::Failed(e.to_string()))?;
            req.headers.insert(CLIENT_HEADER.clone(), v);
        }
        Ok(())
    }
}

/// Keeps the caller's bearer token away from the backend.
pub struct StripAuthorization;

impl Action for StripAuthorization {
    fn execute(&mut self, req: &mut BackendRequest, _ctx: &ActionContext<'_>) -> Result<(), PluginError> {
        req.headers.remove(AUTHORIZATION);
        Ok(())
    }
}

pub struct HideServerHeaders;

impl Filter for HideServerHeaders {
    fn execute(&mut self, resp: &mut BackendResponse) -> Result<(), PluginError> {
        resp.headers.remove(SERVER);
        resp.headers.remove("x-powered-by");
        Ok(())
    }
}

pub struct NoStore;

impl Filter for NoStore {
    fn execute(&mut self, resp: &mut BackendResponse) -> Result<(), PluginError> {
        resp.headers
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        Ok(())
    }
}

pub struct LogHook;

impl LifecycleHook for LogHook {
    fn pre_send(&self, event: &HookEvent<'_>) -> anyhow::Result<()> {
        tracing::debug!(
            method = event.method,
            path = event.path,
            version = event.version,
            internal = event.internal_uri,
            "hook: pre_send"
        );
        Ok(())
    }

    fn post_receive(&self, event: &HookEvent<'_>, status: u16) -> anyhow::Result<()> {
        tracing::debug!(path = event.path, status, "hook: post_receive");
        Ok(())
    }

    fn on_exception(&self, event: &HookEvent<'_>, error: &str) -> anyhow::Result<()> {
        tracing::debug!(path = event.path, error, "hook: on_exception");
        Ok(())
    }
}
