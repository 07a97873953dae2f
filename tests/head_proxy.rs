//! Head ↔ node integration: real node servers on ephemeral ports, a head
//! proxy signing for each, and one node that is not listening at all.

mod common;

use std::time::Duration;

use ed25519_dalek::SigningKey;
use reqwest::{StatusCode, Url};
use secrecy::SecretString;

use common::{FakeRunner, Script, dead_url, node_config, serve_node};
use webai::config::HeadNode;
use webai::error::ProxyError;
use webai::proxy::HeadProxy;
use webai::tasks::TaskCreate;
use webai::trust::AssertionSigner;
use webai::trust::keys;

fn head_node(id: &str, url: &str) -> HeadNode {
    HeadNode {
        id: id.to_string(),
        name: format!("Node {id}"),
        url: Url::parse(url).unwrap(),
    }
}

fn signer(key: &SigningKey) -> AssertionSigner {
    AssertionSigner::new(key.clone(), "node", Duration::from_secs(120))
}

struct Cluster {
    _dirs: Vec<tempfile::TempDir>,
    key: SigningKey,
    url_a: String,
    url_b: String,
    proxy: HeadProxy,
}

/// Nodes `a` and `b` trust the head's key; node `c` is unreachable.
async fn cluster() -> Cluster {
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let pem = keys::public_key_pem(&key.verifying_key()).unwrap();

    let mut dirs = Vec::new();
    let mut urls = Vec::new();
    for id in ["a", "b"] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = node_config(dir.path());
        config.node_id = id.to_string();
        config.trust.trusted_keys = vec![pem.clone()];
        let (url, _orchestrator) = serve_node(config, FakeRunner::new(Script::Hold)).await;
        urls.push(url);
        dirs.push(dir);
    }
    let url_c = dead_url().await;

    let nodes = vec![
        head_node("a", &urls[0]),
        head_node("b", &urls[1]),
        head_node("c", &url_c),
    ];
    let proxy = HeadProxy::new(nodes, signer(&key), None, Duration::from_secs(2)).unwrap();
    Cluster {
        _dirs: dirs,
        key,
        url_a: urls[0].clone(),
        url_b: urls[1].clone(),
        proxy,
    }
}

#[tokio::test]
async fn listing_survives_an_unreachable_node() {
    let cluster = cluster().await;
    let created = cluster
        .proxy
        .create_task(Some("a"), &TaskCreate::new("On node a", "Run this on the first node"))
        .await
        .unwrap();
    assert_eq!(created.record.node_id, "a");

    let listing = cluster.proxy.list_tasks().await;
    assert_eq!(listing.tasks.len(), 1);
    assert_eq!(listing.tasks[0].id, created.record.id);
    assert_eq!(listing.tasks[0].node_id, "a");
    assert_eq!(listing.errors.len(), 1);
    assert_eq!(listing.errors[0].node_id, "c");

    let detail = cluster
        .proxy
        .get_task(Some("a"), &created.record.id)
        .await
        .unwrap();
    assert_eq!(detail.record.id, created.record.id);

    let missing = cluster.proxy.get_task(Some("b"), &created.record.id).await;
    assert!(
        matches!(missing, Err(ProxyError::Upstream { status: 404, .. })),
        "{missing:?}"
    );

    cluster
        .proxy
        .delete_task(Some("a"), &created.record.id)
        .await
        .unwrap();
    assert!(cluster.proxy.list_tasks().await.tasks.is_empty());
}

#[tokio::test]
async fn routing_requires_node_when_ambiguous() {
    let cluster = cluster().await;
    let err = cluster.proxy.get_task(None, "anything").await.unwrap_err();
    assert!(matches!(err, ProxyError::NodeRequired), "{err}");

    let err = cluster.proxy.run_now(Some("zzz"), "anything").await.unwrap_err();
    assert!(matches!(err, ProxyError::UnknownNode { .. }), "{err}");

    let err = cluster.proxy.run_now(Some("c"), "anything").await.unwrap_err();
    assert!(matches!(err, ProxyError::Unreachable { .. }), "{err}");
}

#[tokio::test]
async fn node_status_probe() {
    let cluster = cluster().await;
    let listing = cluster.proxy.list_nodes().await;
    assert_eq!(listing.nodes.len(), 3);
    let by_id = |id: &str| listing.nodes.iter().find(|n| n.node.id == id).unwrap();
    assert!(by_id("a").reachable);
    assert!(by_id("a").ready);
    assert!(by_id("b").reachable);
    assert!(!by_id("c").reachable);
    assert!(!by_id("c").issues.is_empty());
    assert!(listing.public_key.starts_with("-----BEGIN PUBLIC KEY-----"));
    assert!(!listing.enrollment_configured);
}

#[tokio::test]
async fn assertion_for_one_node_is_rejected_by_another() {
    let cluster = cluster().await;
    let client = reqwest::Client::new();
    let for_a = signer(&cluster.key).sign_for_node("a").unwrap();

    let ok = client
        .get(format!("{}/api/tasks", cluster.url_a))
        .bearer_auth(&for_a)
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let replayed = client
        .get(format!("{}/api/tasks", cluster.url_b))
        .bearer_auth(&for_a)
        .send()
        .await
        .unwrap();
    assert_eq!(replayed.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = replayed.json().await.unwrap();
    assert_eq!(body["detail"], "Invalid assertion");

    let anonymous = client
        .get(format!("{}/api/tasks", cluster.url_b))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn head_enrolls_itself_on_a_fresh_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path());
    config.node_id = "fresh".to_string();
    config.trust.enroll_token = Some(SecretString::from("join-me"));
    let (url, _orchestrator) = serve_node(config, FakeRunner::new(Script::Hold)).await;

    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let proxy = HeadProxy::new(
        vec![head_node("fresh", &url)],
        signer(&key),
        Some(SecretString::from("join-me")),
        Duration::from_secs(2),
    )
    .unwrap();

    let before = proxy.list_tasks().await;
    assert_eq!(before.errors.len(), 1);
    assert!(matches!(
        proxy.get_task(None, "x").await,
        Err(ProxyError::Unauthorized { .. })
    ));

    let installed = proxy.install_head_key("fresh").await.unwrap();
    assert_eq!(installed.status, "installed");
    assert_eq!(installed.fingerprint, keys::fingerprint(&key.verifying_key()));

    let after = proxy.list_tasks().await;
    assert!(after.errors.is_empty(), "{:?}", after.errors);

    // The secret is single-use.
    let again = proxy.install_head_key("fresh").await.unwrap_err();
    assert!(
        matches!(again, ProxyError::Upstream { status: 403, .. }),
        "{again:?}"
    );

    let defaults = proxy.config_defaults().await.unwrap();
    assert_eq!(defaults.node_id.as_deref(), Some("fresh"));
    assert!(defaults.supported_models.contains(&defaults.model));
}
