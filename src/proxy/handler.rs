use crate::auth::{authorize, AuthContext, AuthError};
use crate::error::GatewayError;
use crate::mapping::{MappingSnapshot, ResolvedEndpoint, VersionTable};
use crate::plugin::{ActionContext, HookEvent, LifecycleHook, PluginError};
use crate::proxy::context::{BoxBody, RequestContext};
use crate::ratelimit::Admission;
use crate::server::GatewayState;
use crate::upstream::{BackendRequest, BackendResponse};
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, HOST, RETRY_AFTER};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// A client request with its body fully read.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: SocketAddr,
}

/// Hyper entry point. The body is read here, then the dispatch runs in its
/// own task: if the client disconnects, the dispatch still completes and its
/// response is dropped.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    let inbound = InboundRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
        peer_addr,
    };

    let task = tokio::spawn(async move { dispatch(inbound, &state).await });
    let resp = match task.await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "proxy: dispatch task failed");
            let err = GatewayError::Internal(e.to_string());
            BackendResponse::error(err.status(), err.reason())
        }
    };
    Ok(resp.into_hyper())
}

/// Run one request through the dispatcher and produce exactly one response.
///
/// Phases, each of which may end the request early:
///
/// 1. MATCH    select the version and the first matching endpoint
/// 2. AUTH     token validation for endpoints declaring an auth type
/// 3. RATE     per-client admission
/// 4. ACTIONS  request plugins in declaration order
/// 5. BACKEND  forward over the pooled client, with lifecycle hooks
/// 6. FILTERS  response plugins, successful responses only
/// 7. REMAP    error-body overrides for status >= 300
/// 8. LOG      metrics and the access line
pub async fn dispatch(inbound: InboundRequest, state: &GatewayState) -> BackendResponse {
    let client_ip = client_ip(&inbound.headers, inbound.peer_addr);
    let mut ctx = RequestContext::new(inbound.method.to_string(), inbound.path.clone(), client_ip);

    // One snapshot for the whole request, even if a reload lands meanwhile.
    let snapshot = state.store.snapshot();
    ctx.generation = snapshot.generation;

    let mut version: Option<Arc<VersionTable>> = None;
    let mut resp = match run_phases(&inbound, state, &snapshot, &mut ctx, &mut version).await {
        Ok(resp) => resp,
        Err(e) => error_response(&e, state, &mut ctx),
    };

    remap_error_body(&mut resp, &snapshot, version.as_deref());
    ctx.finalize(resp.status.as_u16());
    resp
}

async fn run_phases(
    inbound: &InboundRequest,
    state: &GatewayState,
    snapshot: &MappingSnapshot,
    ctx: &mut RequestContext,
    version_out: &mut Option<Arc<VersionTable>>,
) -> Result<BackendResponse, GatewayError> {
    let (version, resolved) = phase_match(inbound, snapshot, ctx, version_out)?;
    let auth = phase_auth(inbound, state, &resolved).await?;
    phase_rate(state, ctx, &auth).await?;

    let mut backend_req = build_backend_request(inbound, &resolved);
    if let Some(resp) = phase_actions(&mut backend_req, &resolved, &version, &auth)? {
        ctx.outcome = "plugin_response";
        return Ok(resp);
    }

    let mut resp = phase_backend(backend_req, state, &resolved, &version, ctx).await?;
    phase_filters(&mut resp, &resolved)?;
    Ok(resp)
}

fn phase_match(
    inbound: &InboundRequest,
    snapshot: &MappingSnapshot,
    ctx: &mut RequestContext,
    version_out: &mut Option<Arc<VersionTable>>,
) -> Result<(Arc<VersionTable>, ResolvedEndpoint), GatewayError> {
    let decoded = urlencoding::decode(&inbound.path).map_err(|_| GatewayError::NoRouteMatch)?;
    let Some((version, rest)) = snapshot.select_version(&decoded) else {
        debug!("proxy: no version selected, path={}", inbound.path);
        return Err(GatewayError::NoRouteMatch);
    };
    ctx.version = version.version.clone();
    *version_out = Some(version.clone());

    let Some(resolved) = version.lookup(inbound.method.as_str(), rest, inbound.query.as_deref()) else {
        debug!(
            "proxy: no endpoint matched, version={}, method={}, path={}",
            version.version, inbound.method, rest
        );
        return Err(GatewayError::NoRouteMatch);
    };

    ctx.endpoint = resolved.rule.key.to_string();
    ctx.destination = resolved.rule.destination.to_string();
    Ok((version, resolved))
}

async fn phase_auth(
    inbound: &InboundRequest,
    state: &GatewayState,
    resolved: &ResolvedEndpoint,
) -> Result<AuthContext, GatewayError> {
    let Some(auth_type) = resolved.rule.auth_type else {
        return Ok(AuthContext::anonymous());
    };

    match authorize(
        state.validator.as_ref(),
        &inbound.headers,
        auth_type,
        resolved.rule.scope.as_deref(),
    )
    .await
    {
        Ok(auth) => Ok(auth),
        Err(AuthError::Rejected(failure)) => {
            metrics::counter!("portico_auth_rejected_total", "reason" => failure.reason()).increment(1);
            Err(GatewayError::Unauthorized(failure))
        }
        Err(AuthError::Unavailable(msg)) => {
            warn!(error = %msg, "auth: token validation unavailable");
            Err(GatewayError::AuthUnavailable(msg))
        }
    }
}

/// Clients are keyed by the token's client id, or the caller address when
/// the endpoint is anonymous.
async fn phase_rate(
    state: &GatewayState,
    ctx: &mut RequestContext,
    auth: &AuthContext,
) -> Result<(), GatewayError> {
    let client_key = match auth.client_id.as_deref().filter(|c| !c.is_empty()) {
        Some(id) => id.to_string(),
        None => ctx.client_ip.to_string(),
    };
    ctx.client_id = Some(client_key.clone());

    match state.limiter.admit(&client_key).await {
        Admission::Rejected => Err(GatewayError::RateLimited(state.rejected_code())),
        Admission::Admitted | Admission::Unlimited => Ok(()),
    }
}

fn phase_actions(
    req: &mut BackendRequest,
    resolved: &ResolvedEndpoint,
    version: &VersionTable,
    auth: &AuthContext,
) -> Result<Option<BackendResponse>, GatewayError> {
    let action_ctx = ActionContext {
        version: &version.version,
        auth,
        variables: &resolved.variables,
    };
    for action in &resolved.rule.actions {
        let mut instance = action.instantiate();
        match instance.execute(req, &action_ctx) {
            Ok(()) => {}
            Err(PluginError::Respond(resp)) => {
                debug!("plugin: action responded, class={}, status={}", action.class, resp.status);
                return Ok(Some(resp));
            }
            Err(PluginError::Failed(msg)) => {
                warn!("plugin: action failed, class={}, error={}", action.class, msg);
                return Err(GatewayError::Plugin(msg));
            }
        }
    }
    Ok(None)
}

async fn phase_backend(
    req: BackendRequest,
    state: &GatewayState,
    resolved: &ResolvedEndpoint,
    version: &VersionTable,
    ctx: &mut RequestContext,
) -> Result<BackendResponse, GatewayError> {
    let internal_uri = req.uri.clone();
    let method = ctx.method.clone();
    let path = ctx.path.clone();
    let event = HookEvent {
        method: &method,
        path: &path,
        version: &version.version,
        internal_uri: &internal_uri,
    };

    run_hooks(&state.hooks, "pre_send", |h| h.pre_send(&event));

    let started = Instant::now();
    let result = state.backends.send(req, &resolved.rule.destination).await;
    ctx.backend_elapsed = Some(started.elapsed());

    match result {
        Ok(resp) => {
            let status = resp.status.as_u16();
            run_hooks(&state.hooks, "post_receive", |h| h.post_receive(&event, status));
            Ok(resp)
        }
        Err(e) => {
            let msg = e.to_string();
            warn!(
                "proxy: backend failed, endpoint={}, backend={}, kind={}, error={}",
                ctx.endpoint,
                ctx.destination,
                e.kind(),
                msg
            );
            run_hooks(&state.hooks, "on_exception", |h| h.on_exception(&event, &msg));
            Err(GatewayError::Backend(e))
        }
    }
}

fn phase_filters(resp: &mut BackendResponse, resolved: &ResolvedEndpoint) -> Result<(), GatewayError> {
    if resp.status.as_u16() >= 300 {
        return Ok(());
    }
    for filter in &resolved.rule.filters {
        let mut instance = filter.instantiate();
        match instance.execute(resp) {
            Ok(()) => {}
            Err(PluginError::Respond(replacement)) => {
                debug!("plugin: filter responded, class={}", filter.class);
                *resp = replacement;
                return Ok(());
            }
            Err(PluginError::Failed(msg)) => {
                warn!("plugin: filter failed, class={}, error={}", filter.class, msg);
                return Err(GatewayError::Plugin(msg));
            }
        }
    }
    Ok(())
}

/// Hooks never influence the request; their errors are only logged.
fn run_hooks<F>(hooks: &[Arc<dyn LifecycleHook>], stage: &'static str, mut call: F)
where
    F: FnMut(&dyn LifecycleHook) -> anyhow::Result<()>,
{
    for hook in hooks {
        if let Err(e) = call(hook.as_ref()) {
            warn!(stage, error = %e, "plugin: lifecycle hook failed");
            metrics::counter!("portico_hook_errors_total", "stage" => stage).increment(1);
        }
    }
}

fn error_response(err: &GatewayError, state: &GatewayState, ctx: &mut RequestContext) -> BackendResponse {
    ctx.outcome = err.reason();
    let mut resp = BackendResponse::error(err.status(), err.reason());
    if matches!(err, GatewayError::RateLimited(_)) {
        let mut buf = itoa::Buffer::new();
        if let Ok(v) = HeaderValue::from_str(buf.format(state.limiter.seconds_until_reset())) {
            resp.headers.insert(RETRY_AFTER, v);
        }
    }
    resp
}

/// Replace the body of a status >= 300 response when an override exists,
/// version level first, then global.
fn remap_error_body(resp: &mut BackendResponse, snapshot: &MappingSnapshot, version: Option<&VersionTable>) {
    let status = resp.status.as_u16();
    if status < 300 {
        return;
    }
    if let Some(body) = snapshot.error_override(version, status) {
        resp.body = Bytes::copy_from_slice(body.as_bytes());
        resp.headers.remove(CONTENT_LENGTH);
        resp.headers.remove(CONTENT_ENCODING);
    }
}

fn build_backend_request(inbound: &InboundRequest, resolved: &ResolvedEndpoint) -> BackendRequest {
    let mut headers = inbound.headers.clone();
    let original_host = inbound
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    inject_forwarded_headers(&mut headers, inbound.peer_addr, &original_host);

    BackendRequest {
        method: inbound.method.clone(),
        uri: resolved.internal_uri.clone(),
        headers,
        body: inbound.body.clone(),
    }
}

/// Left-most `X-Forwarded-For` entry when present, otherwise the TCP peer.
fn client_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip())
}

fn inject_forwarded_headers(headers: &mut HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
