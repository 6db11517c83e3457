use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Facts collected while a request moves through the dispatcher, reported
/// once in metrics and the access log.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub generation: u64,
    pub version: String,
    pub endpoint: String,
    pub destination: String,
    pub client_id: Option<String>,
    pub backend_elapsed: Option<Duration>,
    /// Short label for the step that ended the request early, if any.
    pub outcome: &'static str,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_ip: IpAddr) -> Self {
        Self {
            method,
            path,
            client_ip,
            start: Instant::now(),
            generation: 0,
            version: String::new(),
            endpoint: String::new(),
            destination: String::new(),
            client_id: None,
            backend_elapsed: None,
            outcome: "ok",
        }
    }

    pub fn finalize(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);
        let version = if self.version.is_empty() {
            "_none".to_string()
        } else {
            self.version.clone()
        };

        metrics::counter!(
            "portico_http_requests_total",
            "version" => version.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "outcome" => self.outcome,
        )
        .increment(1);

        metrics::histogram!(
            "portico_http_request_duration_seconds",
            "version" => version,
        )
        .record(self.start.elapsed().as_secs_f64());

        let backend_ms = self.backend_elapsed.map(|d| d.as_millis()).unwrap_or(0);
        tracing::info!(
            client_ip = %self.client_ip,
            client_id = self.client_id.as_deref().unwrap_or(""),
            method = %self.method,
            path = %self.path,
            status,
            version = %self.version,
            endpoint = %self.endpoint,
            backend = %self.destination,
            generation = self.generation,
            outcome = self.outcome,
            latency_ms = %self.start.elapsed().as_millis(),
            backend_ms = %backend_ms,
            "access"
        );
    }
}
