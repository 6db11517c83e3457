use base64::Engine;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::error;

use crate::config::EtcdConfig;

/// Deserialize an i64 that may come as a JSON number or a JSON string (etcd v3.6+ gRPC-Gateway v2).
fn deserialize_i64_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum I64OrString {
        Num(i64),
        Str(String),
    }

    Option::<I64OrString>::deserialize(deserializer).and_then(|opt| match opt {
        None => Ok(None),
        Some(I64OrString::Num(n)) => Ok(Some(n)),
        Some(I64OrString::Str(s)) => s.parse::<i64>().map(Some).map_err(de::Error::custom),
    })
}

/// etcd v3 client over the HTTP/JSON gateway (`/v3/kv/*`, `/v3/watch`,
/// `/v3/auth/authenticate`). Keys and values travel base64-encoded.
///
/// Cheap to clone: `reqwest::Client` is reference counted.
#[derive(Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Serialize)]
struct AuthRequest {
    name: String,
    password: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Serialize)]
pub struct RangeRequest {
    pub key: String,
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_only: Option<bool>,
}

#[derive(Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
pub struct ResponseHeader {
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    pub revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "deserialize_i64_or_string")]
    pub mod_revision: Option<i64>,
}

#[derive(Serialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Serialize)]
pub struct DeleteRangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
}

#[derive(Serialize)]
pub struct WatchCreateRequest {
    pub create_request: WatchCreate,
}

#[derive(Serialize)]
pub struct WatchCreate {
    pub key: String,
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct WatchResponse {
    #[serde(default)]
    pub result: Option<WatchResult>,
}

#[derive(Deserialize)]
pub struct WatchResult {
    #[serde(default)]
    pub events: Vec<WatchEvent>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    pub kv: Option<KeyValue>,
}

pub fn b64_encode(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

pub fn b64_decode(s: &str) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
    Ok(String::from_utf8(bytes)?)
}

/// Base64 `range_end` covering every key that starts with `prefix`.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut end = prefix.as_bytes().to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return base64::engine::general_purpose::STANDARD.encode(&end);
        }
    }
    String::new()
}

impl EtcdClient {
    /// Connect to the first reachable endpoint, authenticating when
    /// credentials are configured.
    pub async fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        if cfg.endpoints.is_empty() {
            anyhow::bail!("etcd: no endpoints configured");
        }

        let http = reqwest::Client::new();
        let mut last_error: Option<anyhow::Error> = None;

        for endpoint in &cfg.endpoints {
            let base_url = endpoint.trim_end_matches('/').to_string();

            let auth_token = if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
                match http
                    .post(format!("{}/v3/auth/authenticate", base_url))
                    .json(&AuthRequest {
                        name: user.clone(),
                        password: pass.clone(),
                    })
                    .send()
                    .await
                {
                    Ok(resp) => {
                        let auth: AuthResponse = resp.json().await?;
                        auth.token
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %base_url, error = %e, "etcd: auth failed, trying next endpoint");
                        last_error = Some(e.into());
                        continue;
                    }
                }
            } else {
                match http
                    .post(format!("{}/v3/kv/range", base_url))
                    .json(&RangeRequest {
                        key: b64_encode("/"),
                        range_end: String::new(),
                        keys_only: Some(true),
                    })
                    .send()
                    .await
                {
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(endpoint = %base_url, error = %e, "etcd: endpoint unreachable, trying next");
                        last_error = Some(e.into());
                        continue;
                    }
                }
            };

            tracing::info!(endpoint = %base_url, "etcd: connected");
            return Ok(Self {
                http,
                base_url,
                auth_token,
            });
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("etcd: all endpoints failed")))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).json(body);
        if let Some(ref token) = self.auth_token {
            req = req.header("Authorization", token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("etcd {} failed: {} - {}", path, status, body);
        }
        Ok(resp)
    }

    pub async fn range(&self, req: &RangeRequest) -> anyhow::Result<RangeResponse> {
        Ok(self.post_json("/v3/kv/range", req).await?.json().await?)
    }

    /// Every key/value under `prefix` (decoded) and the store revision.
    pub async fn get_prefix(&self, prefix: &str) -> anyhow::Result<(Vec<(String, String)>, i64)> {
        let resp = self
            .range(&RangeRequest {
                key: b64_encode(prefix),
                range_end: prefix_range_end(prefix),
                keys_only: None,
            })
            .await?;
        let revision = resp.header.as_ref().and_then(|h| h.revision).unwrap_or(0);

        let mut out = Vec::with_capacity(resp.kvs.len());
        for kv in &resp.kvs {
            let (Ok(key), Ok(value)) = (b64_decode(&kv.key), b64_decode(&kv.value)) else {
                tracing::warn!(prefix, "etcd: skipping undecodable key/value");
                continue;
            };
            out.push((key, value));
        }
        Ok((out, revision))
    }

    /// Keys under `prefix`, without values or the store revision.
    pub async fn keys_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let resp = self
            .range(&RangeRequest {
                key: b64_encode(prefix),
                range_end: prefix_range_end(prefix),
                keys_only: Some(true),
            })
            .await?;
        Ok(resp
            .kvs
            .iter()
            .filter_map(|kv| b64_decode(&kv.key).ok())
            .collect())
    }

    pub async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.post_json(
            "/v3/kv/put",
            &PutRequest {
                key: b64_encode(key),
                value: b64_encode(value),
            },
        )
        .await?;
        Ok(())
    }

    /// Delete a single key.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.post_json(
            "/v3/kv/deleterange",
            &DeleteRangeRequest {
                key: b64_encode(key),
                range_end: String::new(),
            },
        )
        .await?;
        Ok(())
    }

    /// Open a watch over every key under `prefix`, starting after
    /// `after_revision` when it is positive.
    pub async fn watch_prefix(&self, prefix: &str, after_revision: i64) -> anyhow::Result<WatchStream> {
        let req = WatchCreateRequest {
            create_request: WatchCreate {
                key: b64_encode(prefix),
                range_end: prefix_range_end(prefix),
                start_revision: if after_revision > 0 {
                    Some(after_revision + 1)
                } else {
                    None
                },
            },
        };
        let resp = self.post_json("/v3/watch", &req).await?;
        Ok(WatchStream {
            stream: Box::pin(resp.bytes_stream()),
            buf: BytesMut::with_capacity(4096),
        })
    }
}

/// A streaming watch connection; the gateway emits one JSON document per line.
pub struct WatchStream {
    stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buf: BytesMut,
}

impl WatchStream {
    /// Next parsed response; `None` when the stream ends or fails.
    pub async fn next_response(&mut self) -> Option<WatchResponse> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line_bytes = self.buf.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WatchResponse>(&line) {
                    Ok(resp) => return Some(resp),
                    Err(e) => {
                        error!(error = %e, line = %line, "etcd: watch response parse failed");
                        continue;
                    }
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    error!(error = %e, "etcd: watch stream error");
                    return None;
                }
                None => {
                    if !self.buf.is_empty() {
                        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
                        self.buf.clear();
                        if !line.is_empty() {
                            if let Ok(resp) = serde_json::from_str::<WatchResponse>(&line) {
                                return Some(resp);
                            }
                        }
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_end_increments_last_byte() {
        let end = prefix_range_end("/portico/mappings/");
        assert_eq!(b64_decode(&end).unwrap(), "/portico/mappings0");
    }

    #[test]
    fn test_b64_round_trip() {
        assert_eq!(b64_decode(&b64_encode("v1")).unwrap(), "v1");
    }

    #[test]
    fn test_revision_as_string_or_number() {
        let h: ResponseHeader = serde_json::from_str(r#"{"revision":"42"}"#).unwrap();
        assert_eq!(h.revision, Some(42));
        let h: ResponseHeader = serde_json::from_str(r#"{"revision":7}"#).unwrap();
        assert_eq!(h.revision, Some(7));
    }

    #[test]
    fn test_delete_request_omits_empty_range_end() {
        let body = serde_json::to_string(&DeleteRangeRequest {
            key: b64_encode("k"),
            range_end: String::new(),
        })
        .unwrap();
        assert!(!body.contains("range_end"));
    }
}
