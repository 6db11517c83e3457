use super::GatewayState;
use crate::proxy::context::{full_body, BoxBody};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;
use std::collections::BTreeMap;

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxBody> {
    let body = serde_json::to_string_pretty(&value).unwrap_or_default();
    respond(status, "application/json", body)
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let resp = match (req.method(), req.uri().path()) {
        (_, "/health" | "/healthz") => json_response(StatusCode::OK, json!({"status": "ok"})),

        (_, "/ready" | "/readyz") => ready(&state),

        (_, "/metrics") => match &state.metrics {
            Some(m) => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                m.render(),
            ),
            None => json_response(StatusCode::NOT_FOUND, json!({"error": "metrics disabled"})),
        },

        (_, "/mappings") => mappings(&state),

        (&Method::POST, "/reload") => match state.store.reload().await {
            Ok(report) => {
                tracing::info!(
                    generation = report.generation,
                    elapsed_ms = report.elapsed_ms,
                    "admin: reload completed"
                );
                json_response(StatusCode::OK, json!(report))
            }
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "admin: reload failed");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": format!("{:#}", e)}),
                )
            }
        },
        (_, "/reload") => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"error": "method not allowed"}),
        ),

        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "not found"})),
    };
    Ok(resp)
}

/// Ready once a snapshot has been installed, or straight away when the
/// mapping directory is optional.
fn ready(state: &GatewayState) -> Response<BoxBody> {
    let snap = state.store.snapshot();
    let loaded = snap.generation > 0 || state.store.settings().optional;
    let status = if loaded { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    json_response(
        status,
        json!({
            "status": if loaded { "ready" } else { "loading" },
            "node_id": &*state.node_id,
            "store": state.store.backend(),
            "generation": snap.generation,
            "versions": snap.versions.keys().collect::<Vec<_>>(),
            "endpoints": snap.endpoint_count(),
            "loaded_at": humantime::format_rfc3339_seconds(snap.created_at).to_string(),
        }),
    )
}

fn mappings(state: &GatewayState) -> Response<BoxBody> {
    let snap = state.store.snapshot();
    let versions: Vec<serde_json::Value> = snap
        .versions
        .values()
        .map(|v| {
            let errors: BTreeMap<u16, &str> = v.errors.iter().map(|(k, b)| (*k, b.as_str())).collect();
            json!({
                "version": v.version,
                "errors": errors,
                "endpoints": v.rules.iter().map(|r| {
                    json!({
                        "method": r.key.method,
                        "external": r.key.external,
                        "pattern": r.pattern.source(),
                        "internal": r.internal,
                        "backend": r.destination.to_string(),
                        "auth_type": r.auth_type.map(|a| a.as_str()),
                        "scope": r.scope,
                        "actions": r.actions.iter().map(|a| &*a.class).collect::<Vec<_>>(),
                        "filters": r.filters.iter().map(|f| &*f.class).collect::<Vec<_>>(),
                    })
                }).collect::<Vec<_>>(),
            })
        })
        .collect();

    json_response(
        StatusCode::OK,
        json!({
            "generation": snap.generation,
            "default_version": snap.default_version,
            "versions": versions,
        }),
    )
}
