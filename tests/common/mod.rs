//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use webai::api::node_router;
use webai::config::NodeConfig;
use webai::error::RunnerError;
use webai::orchestrator::Orchestrator;
use webai::runner::{
    AgentOutput, AgentRunner, BrowserRequest, BrowserSnapshot, RunHistory, RunHooks, RunRequest,
};
use webai::trust::NodeTrust;

/// Maximum time any wait is allowed before the test is considered hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What the fake runner does on each run.
#[derive(Debug, Clone)]
pub enum Script {
    /// Report `n` steps, then finish.
    Steps(u32),
    /// Stay running until cancelled.
    Hold,
    /// One step, then ask a human and finish with their answer.
    Ask(String),
    /// Fail straight away.
    Fail(String),
}

/// Scripted stand-in for the browser agent.
pub struct FakeRunner {
    script: Script,
    runs: AtomicUsize,
    answers: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl FakeRunner {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            runs: AtomicUsize::new(0),
            answers: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> Vec<String> {
        self.answers.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

fn snapshot(n: u32) -> BrowserSnapshot {
    BrowserSnapshot {
        url: Some(format!("https://example.com/page/{n}")),
        title: Some(format!("Page {n}")),
        ..Default::default()
    }
}

fn message(text: &str) -> AgentOutput {
    AgentOutput::Message {
        text: text.to_string(),
    }
}

#[async_trait]
impl AgentRunner for FakeRunner {
    async fn run(
        &self,
        request: RunRequest,
        hooks: Arc<dyn RunHooks>,
        cancel: CancellationToken,
    ) -> Result<RunHistory, RunnerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());

        match &self.script {
            Script::Steps(n) => {
                for i in 1..=*n {
                    if cancel.is_cancelled() {
                        return Ok(RunHistory::default());
                    }
                    hooks.on_step(snapshot(i), message("working"), i).await;
                }
                let history = RunHistory {
                    final_result: Some("all done".to_string()),
                    errors: vec![],
                    duration_secs: Some(0.5),
                };
                hooks.on_done(&history).await;
                Ok(history)
            }
            Script::Hold => {
                cancel.cancelled().await;
                Ok(RunHistory::default())
            }
            Script::Ask(question) => {
                hooks.on_step(snapshot(1), message("stuck"), 1).await;
                let answer = tokio::select! {
                    _ = cancel.cancelled() => return Ok(RunHistory::default()),
                    answer = hooks.on_assistance_needed(question.clone()) => answer,
                };
                self.answers.lock().unwrap().push(answer.clone());
                let history = RunHistory {
                    final_result: Some(answer),
                    errors: vec![],
                    duration_secs: None,
                };
                hooks.on_done(&history).await;
                Ok(history)
            }
            Script::Fail(reason) => Err(RunnerError::Failed(reason.clone())),
        }
    }

    async fn open_browser(&self, _request: BrowserRequest) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn close_browser(&self, _task_id: &str) -> Result<(), RunnerError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn readiness(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Node config rooted in `dir` with fast timers.
pub fn node_config(dir: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::with_data_dir(dir);
    config.schedule_check_interval = Duration::from_millis(50);
    config.cancel_grace = Duration::from_secs(1);
    config
}

/// Poll `check` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let outcome = tokio::time::timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for {what}");
}

/// Serve a node on an ephemeral port. Returns its base URL.
pub async fn serve_node(
    config: NodeConfig,
    runner: Arc<dyn AgentRunner>,
) -> (String, Arc<Orchestrator>) {
    let trust = Arc::new(NodeTrust::from_config(&config));
    let orchestrator = Orchestrator::from_config(config, runner);
    orchestrator.startup().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let app = node_router(Arc::clone(&orchestrator), trust);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{addr}"), orchestrator)
}

/// A local URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}
