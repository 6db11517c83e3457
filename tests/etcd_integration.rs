//! Integration tests for the etcd client and the etcd-backed replicated map.
//!
//! These tests require Docker (via testcontainers) and fail at container
//! startup in environments without it.
//!
//! Run with: `cargo test --test etcd_integration`

use portico_gateway::config::{EtcdConfig, GatewayConfig};
use portico_gateway::etcd::EtcdClient;
use portico_gateway::plugin::PluginRegistry;
use portico_gateway::server::GatewayState;
use portico_gateway::store::{EtcdMap, MapEvent, ReplicatedMap};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::Notify;

async fn start_etcd() -> (EtcdConfig, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("quay.io/coreos/etcd", "v3.5.17")
        .with_exposed_port(2379_u16.tcp())
        .with_env_var("ETCD_ADVERTISE_CLIENT_URLS", "http://0.0.0.0:2379")
        .with_env_var("ETCD_LISTEN_CLIENT_URLS", "http://0.0.0.0:2379")
        .start()
        .await
        .expect("failed to start etcd container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(2379).await.expect("get port");
    let endpoint = format!("http://{}:{}", host, port);

    let http = reqwest::Client::new();
    for _ in 0..30 {
        if let Ok(resp) = http
            .post(format!("{}/v3/maintenance/status", endpoint))
            .json(&serde_json::json!({}))
            .send()
            .await
        {
            if resp.status().is_success() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let cfg = EtcdConfig {
        endpoints: vec![endpoint],
        ..EtcdConfig::default()
    };
    (cfg, container)
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_client_put_prefix_delete() {
    let (cfg, _container) = start_etcd().await;
    let client = EtcdClient::connect(&cfg).await.expect("connect");

    client.put("/t/a", "1").await.expect("put a");
    client.put("/t/b", "2").await.expect("put b");
    client.put("/other", "3").await.expect("put other");

    let (kvs, revision) = client.get_prefix("/t/").await.expect("get prefix");
    assert!(revision > 0);
    let mut keys: Vec<_> = kvs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    keys.sort();
    assert_eq!(keys, vec![("/t/a", "1"), ("/t/b", "2")]);

    client.delete("/t/a").await.expect("delete");
    let (kvs, _) = client.get_prefix("/t/").await.expect("get prefix");
    assert_eq!(kvs.len(), 1);
}

#[tokio::test]
async fn test_etcd_map_watch_relays_events() {
    let (cfg, _container) = start_etcd().await;
    let writer = EtcdMap::new(EtcdClient::connect(&cfg).await.unwrap(), "/portico/test");
    let reader = Arc::new(EtcdMap::new(
        EtcdClient::connect(&cfg).await.unwrap(),
        "/portico/test",
    ));

    writer.put("v1", "first".to_string()).await.unwrap();
    assert_eq!(
        reader.entries().await.unwrap(),
        vec![("v1".to_string(), "first".to_string())]
    );

    let mut rx = reader.subscribe();
    let shutdown = Arc::new(Notify::new());
    reader.start_watch(shutdown.clone());
    tokio::time::sleep(Duration::from_millis(300)).await;

    writer.put("v2", "second".to_string()).await.unwrap();
    writer.remove("v1").await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event in time")
        .unwrap();
    assert_eq!(
        first,
        MapEvent::Put {
            key: "v2".to_string(),
            value: "second".to_string()
        }
    );
    let second = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event in time")
        .unwrap();
    assert_eq!(second, MapEvent::Removed { key: "v1".to_string() });

    shutdown.notify_waiters();
}

#[tokio::test]
async fn test_key_listing_does_not_skip_watch_events() {
    let (cfg, _container) = start_etcd().await;
    let writer = EtcdMap::new(EtcdClient::connect(&cfg).await.unwrap(), "/portico/resume");
    let reader = Arc::new(EtcdMap::new(
        EtcdClient::connect(&cfg).await.unwrap(),
        "/portico/resume",
    ));

    writer.put("v1", "first".to_string()).await.unwrap();
    reader.entries().await.unwrap();
    let mut rx = reader.subscribe();

    // changed after the listing the watch resumes from
    writer.put("v2", "second".to_string()).await.unwrap();
    assert_eq!(reader.keys().await.unwrap(), vec!["v1".to_string(), "v2".to_string()]);

    let shutdown = Arc::new(Notify::new());
    reader.start_watch(shutdown.clone());

    let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event in time")
        .unwrap();
    assert_eq!(
        event,
        MapEvent::Put {
            key: "v2".to_string(),
            value: "second".to_string()
        }
    );

    shutdown.notify_waiters();
}

async fn node(etcd: &EtcdConfig, mappings_dir: &std::path::Path, shutdown: &Arc<Notify>) -> GatewayState {
    let client = EtcdClient::connect(etcd).await.unwrap();
    let mappings = Arc::new(EtcdMap::new(client.clone(), &etcd.mappings_prefix));
    let errors = Arc::new(EtcdMap::new(client, &etcd.errors_prefix));

    let mut config = GatewayConfig::default();
    config.store.etcd = etcd.clone();
    config.mappings.directory = mappings_dir.to_path_buf();
    config.mappings.default_version = Some("v1".to_string());

    let shared: (Arc<dyn ReplicatedMap>, Arc<dyn ReplicatedMap>) = (mappings.clone(), errors.clone());
    let state = GatewayState::build(config, shared.0, shared.1, PluginRegistry::with_builtins()).unwrap();
    state.store.start_listener(shutdown.clone());
    state.store.sync_from_store().await.unwrap();
    mappings.start_watch(shutdown.clone());
    errors.start_watch(shutdown.clone());
    state
}

#[tokio::test]
async fn test_publish_replicates_to_other_node() {
    let (etcd, _container) = start_etcd().await;
    let shutdown = Arc::new(Notify::new());

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("v1.toml"),
        r#"
version = "v1"
backend = { host = "127.0.0.1", port = 9001 }

[errors]
404 = '{"message":"missing"}'

[[endpoints]]
external = "/me"
internal = "/customer/{customerId}"

[[endpoints]]
external = "/payments/{id}"
internal = "/payments/{id}"
var_name = "id"
var_expression = '\d*'
"#,
    )
    .unwrap();

    let publisher = node(&etcd, dir.path(), &shutdown).await;
    let follower = node(&etcd, dir.path(), &shutdown).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let report = publisher.store.reload().await.unwrap();
    assert_eq!(report.endpoints, 2);

    wait_until("follower snapshot", || follower.store.snapshot().endpoint_count() == 2).await;
    let snap = follower.store.snapshot();
    let v1 = snap.versions.get("v1").unwrap();
    let hit = v1.lookup("GET", "/payments/42", None).unwrap();
    assert_eq!(hit.internal_uri, "/payments/42");
    assert_eq!(snap.error_override(Some(v1.as_ref()), 404), Some(r#"{"message":"missing"}"#));

    // a node joining later picks the mappings up from the store
    let late = node(&etcd, dir.path(), &shutdown).await;
    assert_eq!(late.store.snapshot().endpoint_count(), 2);

    shutdown.notify_waiters();
}
