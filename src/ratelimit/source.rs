use crate::config::RateLimitConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-client allowance. `window_secs` is reported to clients; counters are
/// reset globally by the limiter's reset task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLimit {
    pub requests: i64,
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

fn default_window() -> u64 {
    60
}

/// Client-limit collaborator. `Ok(None)` means the client is unlimited.
#[async_trait]
pub trait ClientLimitSource: Send + Sync {
    async fn fetch(&self, client_id: &str) -> Result<Option<ClientLimit>>;
}

/// Limits from the gateway config file.
#[derive(Debug, Default)]
pub struct StaticLimitSource {
    limits: HashMap<String, ClientLimit>,
}

impl StaticLimitSource {
    pub fn new(limits: HashMap<String, ClientLimit>) -> Self {
        Self { limits }
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

#[async_trait]
impl ClientLimitSource for StaticLimitSource {
    async fn fetch(&self, client_id: &str) -> Result<Option<ClientLimit>> {
        Ok(self.limits.get(client_id).copied())
    }
}

/// Limits served by `GET {base_url}/{client_id}`: 200 with a JSON
/// [`ClientLimit`], 404 for unlimited clients.
pub struct HttpLimitSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLimitSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ClientLimitSource for HttpLimitSource {
    async fn fetch(&self, client_id: &str) -> Result<Option<ClientLimit>> {
        let url = format!("{}/{}", self.base_url, urlencoding::encode(client_id));
        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json().await?)),
            s => anyhow::bail!("client limit lookup for '{}' returned {}", client_id, s),
        }
    }
}

/// Static table first, then the HTTP source when configured.
pub struct LayeredLimitSource {
    fixed: StaticLimitSource,
    remote: Option<HttpLimitSource>,
}

#[async_trait]
impl ClientLimitSource for LayeredLimitSource {
    async fn fetch(&self, client_id: &str) -> Result<Option<ClientLimit>> {
        if let Some(limit) = self.fixed.fetch(client_id).await? {
            return Ok(Some(limit));
        }
        match &self.remote {
            Some(remote) => remote.fetch(client_id).await,
            None => Ok(None),
        }
    }
}

pub fn source_from_config(cfg: &RateLimitConfig) -> Result<Arc<dyn ClientLimitSource>> {
    let fixed = StaticLimitSource::new(
        cfg.clients
            .iter()
            .map(|(id, l)| {
                (
                    id.clone(),
                    ClientLimit {
                        requests: l.requests,
                        window_secs: l.window_secs,
                    },
                )
            })
            .collect(),
    );
    let remote = match cfg.limits_url.as_deref() {
        Some(url) => Some(HttpLimitSource::new(url)?),
        None => None,
    };
    Ok(Arc::new(LayeredLimitSource { fixed, remote }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientLimitConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limits/app-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"requests": 5, "window_secs": 60})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limits/free"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limits/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let src = HttpLimitSource::new(&format!("{}/limits/", server.uri())).unwrap();
        assert_eq!(
            src.fetch("app-1").await.unwrap(),
            Some(ClientLimit {
                requests: 5,
                window_secs: 60
            })
        );
        assert_eq!(src.fetch("free").await.unwrap(), None);
        assert!(src.fetch("broken").await.is_err());
    }

    #[tokio::test]
    async fn test_static_table_takes_precedence() {
        let mut cfg = RateLimitConfig::default();
        cfg.clients.insert(
            "app-1".into(),
            ClientLimitConfig {
                requests: 3,
                window_secs: 10,
            },
        );
        let src = source_from_config(&cfg).unwrap();
        assert_eq!(src.fetch("app-1").await.unwrap().map(|l| l.requests), Some(3));
        assert_eq!(src.fetch("other").await.unwrap(), None);
    }
}
