//! CommandRunner: drives an external agent process over JSON lines.
//!
//! One child process per run. The orchestrator side writes [`RunnerCommand`]
//! lines to the child's stdin and reads [`RunnerEvent`] lines from its
//! stdout. A child whose browser should stay open is parked per task until
//! `close_browser` is called.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AgentOutput, AgentRunner, BrowserRequest, BrowserSnapshot, RunHistory, RunHooks, RunRequest};
use crate::config::RunnerConfig;
use crate::error::RunnerError;

/// How long a child gets to exit after `stop`/`close_browser` before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lines written to the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerCommand {
    Start {
        request: RunRequest,
        headless: bool,
        window_width: u32,
        window_height: u32,
    },
    OpenBrowser {
        request: BrowserRequest,
        headless: bool,
        window_width: u32,
        window_height: u32,
    },
    AssistanceResponse {
        text: String,
    },
    Stop,
    CloseBrowser,
}

/// Lines read from the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    Step {
        #[serde(default)]
        state: BrowserSnapshot,
        output: AgentOutput,
        ordinal: u32,
    },
    Assistance {
        question: String,
    },
    Done {
        #[serde(default)]
        history: RunHistory,
    },
    Error {
        message: String,
    },
}

/// A live child process with its command pipe.
struct Session {
    child: Child,
    stdin: ChildStdin,
}

impl Session {
    async fn send(&mut self, command: &RunnerCommand) -> Result<(), RunnerError> {
        send_line(&mut self.stdin, command).await
    }

    /// Ask the child to finish, then kill it if it lingers.
    async fn shutdown(mut self, farewell: RunnerCommand) {
        if let Err(e) = self.send(&farewell).await {
            debug!(error = %e, "Runner child did not accept shutdown command");
        }
        drop(self.stdin);
        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Runner child exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed waiting for runner child"),
            Err(_) => {
                warn!("Runner child ignored shutdown, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill runner child");
                }
            }
        }
    }
}

/// Runner backed by an external executable.
pub struct CommandRunner {
    config: RunnerConfig,
    /// Children kept alive after a run so the browser stays open.
    parked: Mutex<HashMap<String, Session>>,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            parked: Mutex::new(HashMap::new()),
        }
    }

    fn spawn(&self, task_id: &str) -> Result<(Session, tokio::process::ChildStdout), RunnerError> {
        let program = self.config.command.as_deref().ok_or_else(|| {
            RunnerError::Unavailable("no runner command configured".to_string())
        })?;

        let mut cmd = Command::new(program);
        cmd.args(&self.config.args)
            .env("WEBAI_TASK_ID", task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.config.disable_telemetry {
            cmd.env("ANONYMIZED_TELEMETRY", "false");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{program}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Spawn("failed to capture runner stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn("failed to capture runner stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, "runner stderr: {}", line);
                }
            });
        }

        Ok((Session { child, stdin }, stdout))
    }

    async fn take_parked(&self, task_id: &str) -> Option<Session> {
        self.parked.lock().await.remove(task_id)
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn run(
        &self,
        request: RunRequest,
        hooks: Arc<dyn RunHooks>,
        cancel: CancellationToken,
    ) -> Result<RunHistory, RunnerError> {
        // A parked browser from an earlier run is replaced by the new run's own.
        if let Some(previous) = self.take_parked(&request.task_id).await {
            previous.shutdown(RunnerCommand::CloseBrowser).await;
        }

        let task_id = request.task_id.clone();
        let keep_open = request.keep_browser_open;
        let (mut session, stdout) = self.spawn(&task_id)?;
        session
            .send(&RunnerCommand::Start {
                request,
                headless: self.config.headless,
                window_width: self.config.window_width,
                window_height: self.config.window_height,
            })
            .await?;
        info!(task_id = %task_id, "Runner child started");

        let mut lines = BufReader::new(stdout).lines();
        let outcome = loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    session.shutdown(RunnerCommand::Stop).await;
                    return Err(RunnerError::Failed("run cancelled".to_string()));
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break Err(RunnerError::Protocol(
                    "runner exited before reporting completion".to_string(),
                ));
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event = match serde_json::from_str::<RunnerEvent>(line) {
                Ok(event) => event,
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "Ignoring non-event runner output: {}", line);
                    continue;
                }
            };

            match event {
                RunnerEvent::Step {
                    state,
                    output,
                    ordinal,
                } => hooks.on_step(state, output, ordinal).await,
                RunnerEvent::Assistance { question } => {
                    let answer = tokio::select! {
                        _ = cancel.cancelled() => {
                            session.shutdown(RunnerCommand::Stop).await;
                            return Err(RunnerError::Failed("run cancelled".to_string()));
                        }
                        answer = hooks.on_assistance_needed(question) => answer,
                    };
                    session
                        .send(&RunnerCommand::AssistanceResponse { text: answer })
                        .await?;
                }
                RunnerEvent::Done { history } => {
                    hooks.on_done(&history).await;
                    break Ok(history);
                }
                RunnerEvent::Error { message } => break Err(RunnerError::Failed(message)),
            }
        };

        match &outcome {
            Ok(history) if keep_open && !history.has_errors() => {
                self.parked.lock().await.insert(task_id.clone(), session);
                debug!(task_id = %task_id, "Runner child parked with browser open");
            }
            _ => session.shutdown(RunnerCommand::CloseBrowser).await,
        }
        outcome
    }

    async fn open_browser(&self, request: BrowserRequest) -> Result<(), RunnerError> {
        let mut parked = self.parked.lock().await;
        if parked.contains_key(&request.task_id) {
            return Ok(());
        }
        let task_id = request.task_id.clone();
        let (mut session, stdout) = self.spawn(&task_id)?;
        let drain_id = task_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_id = %drain_id, "browser session output: {}", line);
            }
        });
        session
            .send(&RunnerCommand::OpenBrowser {
                request,
                headless: self.config.headless,
                window_width: self.config.window_width,
                window_height: self.config.window_height,
            })
            .await?;
        parked.insert(task_id.clone(), session);
        info!(task_id = %task_id, "Browser session opened");
        Ok(())
    }

    async fn close_browser(&self, task_id: &str) -> Result<(), RunnerError> {
        if let Some(session) = self.take_parked(task_id).await {
            session.shutdown(RunnerCommand::CloseBrowser).await;
            info!(task_id = %task_id, "Browser session closed");
        }
        Ok(())
    }

    fn readiness(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.config.command.is_none() {
            issues.push("No agent runner command configured (set WEBAI_RUNNER_COMMAND).".to_string());
        }
        issues
    }
}

async fn send_line(stdin: &mut ChildStdin, command: &RunnerCommand) -> Result<(), RunnerError> {
    let mut line =
        serde_json::to_string(command).map_err(|e| RunnerError::Protocol(e.to_string()))?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        steps: StdMutex<Vec<u32>>,
        questions: StdMutex<Vec<String>>,
        done: StdMutex<bool>,
    }

    #[async_trait]
    impl RunHooks for Recorder {
        async fn on_step(&self, _state: BrowserSnapshot, _output: AgentOutput, ordinal: u32) {
            self.steps.lock().unwrap().push(ordinal);
        }

        async fn on_done(&self, _history: &RunHistory) {
            *self.done.lock().unwrap() = true;
        }

        async fn on_assistance_needed(&self, question: String) -> String {
            self.questions.lock().unwrap().push(question);
            "done".to_string()
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            task_id: "t1".to_string(),
            prompt: "Primary goal:\nOpen the page".to_string(),
            model: "gpt-5-mini".to_string(),
            temperature: None,
            reasoning_effort: None,
            max_steps: 5,
            max_actions_per_step: 3,
            max_input_tokens: 1000,
            use_vision: false,
            browser_data_dir: PathBuf::from("/tmp/b"),
            downloads_dir: PathBuf::from("/tmp/d"),
            recordings_dir: None,
            traces_dir: None,
            start_url: None,
            keep_browser_open: false,
            disable_telemetry: true,
        }
    }

    fn script_runner(script: &str) -> CommandRunner {
        CommandRunner::new(RunnerConfig {
            command: Some("sh".to_string()),
            args: vec!["-c".to_string(), script.to_string()],
            ..RunnerConfig::default()
        })
    }

    #[test]
    fn readiness_reports_missing_command() {
        let runner = CommandRunner::new(RunnerConfig::default());
        assert_eq!(runner.readiness().len(), 1);
        assert!(script_runner("true").readiness().is_empty());
    }

    #[test]
    fn command_lines_are_tagged() {
        let json = serde_json::to_value(RunnerCommand::AssistanceResponse {
            text: "done".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "assistance_response");
        let event: RunnerEvent =
            serde_json::from_str(r#"{"type":"done","history":{"final_result":"ok"}}"#).unwrap();
        assert!(matches!(event, RunnerEvent::Done { history } if history.final_result.as_deref() == Some("ok")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_child_to_completion_with_assistance() {
        let script = r#"
read start
echo '{"type":"step","output":{"kind":"message","text":"hi"},"ordinal":1}'
echo '{"type":"assistance","question":"Click the button"}'
read reply
echo '{"type":"done","history":{"final_result":"finished"}}'
"#;
        let runner = script_runner(script);
        let hooks = Arc::new(Recorder::default());
        let history = runner
            .run(request(), hooks.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(history.final_result.as_deref(), Some("finished"));
        assert_eq!(*hooks.steps.lock().unwrap(), vec![1]);
        assert_eq!(*hooks.questions.lock().unwrap(), vec!["Click the button".to_string()]);
        assert!(*hooks.done.lock().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_a_protocol_error() {
        let runner = script_runner("read start; exit 0");
        let err = runner
            .run(request(), Arc::new(Recorder::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Protocol(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_the_child() {
        let runner = script_runner("read start; sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(request(), Arc::new(Recorder::default()), cancel),
        )
        .await
        .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_command_is_unavailable() {
        let runner = CommandRunner::new(RunnerConfig::default());
        let err = runner
            .run(request(), Arc::new(Recorder::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Unavailable(_)));
    }
}
