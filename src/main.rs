use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::net::TcpListener;
use tracing::{info, warn};

use webai::api::{head_router, node_router};
use webai::config::{HeadConfig, NodeConfig};
use webai::logging;
use webai::orchestrator::Orchestrator;
use webai::proxy::HeadProxy;
use webai::runner::CommandRunner;
use webai::trust::NodeTrust;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let role = std::env::var("WEBAI_ROLE")
        .map(|r| r.trim().to_lowercase())
        .unwrap_or_else(|_| "node".to_string());
    let log_dir = std::env::var("WEBAI_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from);
    let _log_guard = logging::init(log_dir.as_deref(), &format!("webai-{role}.log"));

    eprintln!("webai v{} ({role})", env!("CARGO_PKG_VERSION"));

    match role.as_str() {
        "node" => run_node().await,
        "head" => run_head().await,
        other => bail!("Unknown WEBAI_ROLE {other:?}; expected \"node\" or \"head\""),
    }
}

async fn run_node() -> anyhow::Result<()> {
    let config = NodeConfig::from_env().context("Failed to load node configuration")?;
    config
        .ensure_directories()
        .context("Failed to create data directories")?;

    let trust = Arc::new(NodeTrust::from_config(&config));
    if trust.auth_required() && !trust.has_keys() {
        warn!(
            node_id = %trust.node_id(),
            "No trusted head keys yet; API calls are refused until a head enrolls"
        );
    }

    let runner = Arc::new(CommandRunner::new(config.runner.clone()));
    let addr = format!("{}:{}", config.host, config.port);
    let orchestrator = Orchestrator::from_config(config, runner);
    for issue in orchestrator.readiness() {
        warn!(issue = %issue, "Node is not ready to run tasks");
    }
    orchestrator
        .startup()
        .await
        .context("Failed to recover persisted tasks")?;

    let app = node_router(Arc::clone(&orchestrator), trust);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, node_id = %orchestrator.config().node_id, "Node listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Node server failed")?;

    orchestrator.shutdown().await;
    info!("Node stopped");
    Ok(())
}

async fn run_head() -> anyhow::Result<()> {
    let config = HeadConfig::from_env().context("Failed to load head configuration")?;
    std::fs::create_dir_all(&config.key_dir)
        .with_context(|| format!("Failed to create {}", config.key_dir.display()))?;
    let proxy = Arc::new(HeadProxy::from_config(&config).context("Failed to start head")?);
    for node in proxy.nodes() {
        info!(node_id = %node.id, url = %node.url, "Node configured");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, nodes = proxy.nodes().len(), "Head listening");

    axum::serve(listener, head_router(proxy))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Head server failed")?;
    info!("Head stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
