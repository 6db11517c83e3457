use crate::config::BackendConfig;
use crate::proxy::context::{empty_body, full_body, BoxBody};
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Pool key: one client (and one idle-connection pool) per destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl Destination {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// The request forwarded to a backend. `uri` is the internal path and query.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A fully buffered backend response, also used for every synthesized response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// `{"error":"<reason>"}` with a JSON content type.
    pub fn error(status: StatusCode, reason: &str) -> Self {
        let body = serde_json::json!({ "error": reason }).to_string();
        let mut resp = Self::new(status, body);
        resp.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp
    }

    /// Convert for writing downstream. The length header is recomputed from
    /// the buffered body.
    pub fn into_hyper(mut self) -> hyper::Response<BoxBody> {
        self.headers.remove(http::header::CONTENT_LENGTH);
        let body = if self.body.is_empty() {
            empty_body()
        } else {
            full_body(self.body)
        };
        let mut resp = hyper::Response::new(body);
        *resp.status_mut() = self.status;
        *resp.headers_mut() = self.headers;
        resp
    }
}

#[derive(Debug)]
pub enum BackendError {
    /// Could not establish a connection (refused, DNS, connect timeout).
    Connect(String),
    /// No complete response within the response timeout.
    Timeout,
    /// The connection failed after it was established.
    Reset(String),
    /// The request could not be built (bad internal URI or header).
    InvalidRequest(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Connect(e) => write!(f, "backend connect failed: {}", e),
            BackendError::Timeout => write!(f, "backend response timed out"),
            BackendError::Reset(e) => write!(f, "backend connection reset: {}", e),
            BackendError::InvalidRequest(e) => write!(f, "invalid backend request: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

impl BackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Connect(_) => "connect",
            BackendError::Timeout => "timeout",
            BackendError::Reset(_) => "reset",
            BackendError::InvalidRequest(_) => "invalid_request",
        }
    }
}

struct DestinationPool {
    client: HttpClient,
    in_flight: AtomicUsize,
}

/// Decrements the destination's in-flight count when the exchange ends,
/// whichever way it ends.
struct InFlightGuard {
    pool: Arc<DestinationPool>,
}

impl InFlightGuard {
    fn acquire(pool: Arc<DestinationPool>) -> Self {
        pool.in_flight.fetch_add(1, Ordering::Relaxed);
        Self { pool }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.pool.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pooled per-destination HTTP/1.1 clients. Cheap to clone.
///
/// Each exchange checks a connection out of the destination's pool for
/// exactly one request/response. hyper only returns a connection to the idle
/// pool after a complete response, so a connection that failed mid-exchange
/// is dropped rather than reused.
#[derive(Clone)]
pub struct BackendPool {
    pools: Arc<DashMap<Destination, Arc<DestinationPool>>>,
    config: Arc<BackendConfig>,
}

impl BackendPool {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    fn checkout(&self, dest: &Destination) -> Arc<DestinationPool> {
        if let Some(p) = self.pools.get(dest) {
            return p.value().clone();
        }
        self.pools
            .entry(dest.clone())
            .or_insert_with(|| {
                tracing::debug!(destination = %dest, "upstream: creating connection pool");
                Arc::new(DestinationPool {
                    client: build_backend_client(&self.config),
                    in_flight: AtomicUsize::new(0),
                })
            })
            .value()
            .clone()
    }

    /// Forward `req` to `dest` and buffer the whole response.
    pub async fn send(
        &self,
        req: BackendRequest,
        dest: &Destination,
    ) -> Result<BackendResponse, BackendError> {
        let pool = self.checkout(dest);
        let _guard = InFlightGuard::acquire(pool.clone());
        let start = Instant::now();

        let upstream_req = build_upstream_request(req, dest)?;
        let timeout = Duration::from_millis(self.config.response_timeout_ms);

        let exchange = async {
            let resp = pool.client.request(upstream_req).await.map_err(|e| {
                if e.is_connect() {
                    BackendError::Connect(e.to_string())
                } else {
                    BackendError::Reset(e.to_string())
                }
            })?;
            let (parts, body) = resp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| BackendError::Reset(e.to_string()))?
                .to_bytes();
            let mut headers = parts.headers;
            remove_hop_headers(&mut headers);
            Ok(BackendResponse {
                status: parts.status,
                headers,
                body,
            })
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(r) => r,
            Err(_) => Err(BackendError::Timeout),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(
            "portico_backend_requests_total",
            "destination" => dest.authority(),
            "outcome" => outcome,
        )
        .increment(1);
        metrics::histogram!(
            "portico_backend_request_duration_seconds",
            "destination" => dest.authority(),
        )
        .record(start.elapsed().as_secs_f64());

        result
    }

    /// Exchanges currently checked out against `dest`.
    pub fn in_flight(&self, dest: &Destination) -> usize {
        self.pools
            .get(dest)
            .map(|p| p.value().in_flight.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn destination_count(&self) -> usize {
        self.pools.len()
    }
}

fn build_upstream_request(
    req: BackendRequest,
    dest: &Destination,
) -> Result<Request<BoxBody>, BackendError> {
    let path = if req.uri.starts_with('/') {
        req.uri
    } else {
        format!("/{}", req.uri)
    };
    let uri = format!("{}{}", dest, path);

    let mut headers = req.headers;
    remove_hop_headers(&mut headers);
    let host = HeaderValue::from_str(&dest.authority())
        .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
    headers.insert(HOST, host);

    let body = if req.body.is_empty() {
        empty_body()
    } else {
        full_body(req.body)
    };

    let mut builder = Request::builder().method(req.method).uri(uri);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(body)
        .map_err(|e| BackendError::InvalidRequest(e.to_string()))
}

pub(crate) fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Build the hyper client for one destination.
///
/// HTTP/1.1 only: a pooled connection carries one exchange at a time.
/// `https` destinations are verified against the webpki roots.
fn build_backend_client(cfg: &BackendConfig) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(cfg.pool_idle_timeout_secs)));
    http.set_connect_timeout(Some(Duration::from_millis(cfg.connect_timeout_ms)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(cfg.pool_idle_timeout_secs))
        .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
        .build(https)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> BackendConfig {
        BackendConfig {
            connect_timeout_ms: 500,
            response_timeout_ms: 300,
            pool_idle_timeout_secs: 5,
            pool_max_idle_per_host: 4,
        }
    }

    fn get(uri: &str) -> BackendRequest {
        BackendRequest {
            method: Method::GET,
            uri: uri.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connect_error() {
        let pool = BackendPool::new(test_config());
        let dest = Destination::new("http", "127.0.0.1", closed_port().await);

        let start = Instant::now();
        let err = pool.send(get("/x"), &dest).await.unwrap_err();
        assert!(matches!(err, BackendError::Connect(_)), "got {err}");
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert_eq!(pool.in_flight(&dest), 0);
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let pool = BackendPool::new(test_config());
        let dest = Destination::new("http", "127.0.0.1", port);
        let err = pool.send(get("/slow"), &dest).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout));
        assert_eq!(pool.in_flight(&dest), 0);
    }

    #[tokio::test]
    async fn test_reset_mid_response_is_reset_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            // Promise 100 bytes, deliver 5, hang up.
            let _ = sock
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nhello")
                .await;
            drop(sock);
        });

        let pool = BackendPool::new(test_config());
        let dest = Destination::new("http", "127.0.0.1", port);
        let err = pool.send(get("/partial"), &dest).await.unwrap_err();
        assert!(matches!(err, BackendError::Reset(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_successful_exchange_is_buffered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("GET /customer/1223?x=1 HTTP/1.1"));
            let _ = sock
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await;
        });

        let pool = BackendPool::new(test_config());
        let dest = Destination::new("http", "127.0.0.1", port);
        let resp = pool.send(get("/customer/1223?x=1"), &dest).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"ok");
        assert!(resp.headers.get(CONNECTION).is_none());
        assert_eq!(pool.destination_count(), 1);
    }

    #[test]
    fn test_error_response_body() {
        let resp = BackendResponse::error(StatusCode::NOT_FOUND, "no_route");
        assert_eq!(&resp.body[..], br#"{"error":"no_route"}"#);
        assert_eq!(resp.headers.get("content-type").unwrap(), "application/json");
    }
}
