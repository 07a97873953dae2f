//! Head proxy: routes task calls to nodes and merges their listings.
//!
//! Every outbound call carries a fresh assertion bound to the destination
//! node, so a token captured from one node is useless against another.

use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use futures::future::join_all;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::api::types::{
    AggregatedTasks, AssistRequest, ConfigDefaults, ContinueRequest, HeadKeyRequest,
    HeadKeyResponse, NodeFailure, NodeInfo, NodeListing, NodeStatus, ScheduleRequest,
};
use crate::config::{HeadConfig, HeadNode};
use crate::error::{Error, ProxyError};
use crate::tasks::{TaskCreate, TaskDetail, TaskSummary};
use crate::trust::AssertionSigner;
use crate::trust::keys;

pub struct HeadProxy {
    nodes: Vec<HeadNode>,
    signer: AssertionSigner,
    public_key_pem: String,
    enroll_token: Option<SecretString>,
    client: Client,
}

impl HeadProxy {
    pub fn new(
        nodes: Vec<HeadNode>,
        signer: AssertionSigner,
        enroll_token: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let public_key_pem = keys::public_key_pem(&signer.verifying_key())?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProxyError::Client(e.to_string()))?;
        Ok(Self {
            nodes,
            signer,
            public_key_pem,
            enroll_token,
            client,
        })
    }

    /// Load (or create) the head keypair and build the proxy.
    pub fn from_config(config: &HeadConfig) -> Result<Self, Error> {
        if config.nodes.is_empty() {
            return Err(crate::error::ConfigError::MissingRequired {
                key: "HEAD_NODES".to_string(),
                hint: "Configure at least one node.".to_string(),
            }
            .into());
        }
        let key = keys::ensure_keypair(&config.private_key_path, &config.public_key_path)?;
        let signer = AssertionSigner::new(key, config.token_audience.clone(), config.token_ttl);
        Ok(Self::new(
            config.nodes.clone(),
            signer,
            config.enroll_token.clone(),
            config.request_timeout,
        )?)
    }

    pub fn nodes(&self) -> &[HeadNode] {
        &self.nodes
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Pick the node a single-task call goes to.
    ///
    /// Without an explicit id the call is only routable when exactly one
    /// node is configured.
    pub fn select_node(&self, node_id: Option<&str>) -> Result<&HeadNode, ProxyError> {
        match node_id.filter(|id| !id.is_empty()) {
            Some(id) => self
                .nodes
                .iter()
                .find(|n| n.id == id)
                .ok_or_else(|| ProxyError::UnknownNode {
                    node_id: id.to_string(),
                }),
            None => match self.nodes.as_slice() {
                [only] => Ok(only),
                _ => Err(ProxyError::NodeRequired),
            },
        }
    }

    fn default_node(&self) -> Result<&HeadNode, ProxyError> {
        self.nodes.first().ok_or(ProxyError::NodeRequired)
    }

    // ── Aggregate calls ─────────────────────────────────────────────────

    /// List tasks on every node concurrently. A failing node shows up in
    /// `errors` and never hides the others' tasks.
    pub async fn list_tasks(&self) -> AggregatedTasks {
        let results = join_all(self.nodes.iter().map(|node| async move {
            let fetched: Result<Vec<TaskSummary>, ProxyError> =
                self.fetch(node, Method::GET, "/api/tasks", None::<&()>).await;
            (node, fetched)
        }))
        .await;

        let mut merged = AggregatedTasks::default();
        for (node, fetched) in results {
            match fetched {
                Ok(tasks) => merged.tasks.extend(tasks.into_iter().map(|mut task| {
                    task.node_id = node.id.clone();
                    task
                })),
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Node listing failed");
                    merged.errors.push(NodeFailure {
                        node_id: node.id.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }
        merged.tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        merged
    }

    /// Probe every node's status concurrently.
    pub async fn list_nodes(&self) -> NodeListing {
        let nodes = join_all(self.nodes.iter().map(|node| async move {
            let info: Result<NodeInfo, ProxyError> =
                self.fetch(node, Method::GET, "/api/node/info", None::<&()>).await;
            match info {
                Ok(info) => NodeStatus {
                    node: node.clone(),
                    reachable: true,
                    ready: info.ready,
                    issues: info.issues,
                    enrollment: info.enrollment_open,
                },
                Err(e) => {
                    debug!(node_id = %node.id, error = %e, "Node probe failed");
                    NodeStatus {
                        node: node.clone(),
                        reachable: false,
                        ready: false,
                        issues: vec![e.to_string()],
                        enrollment: false,
                    }
                }
            }
        }))
        .await;

        NodeListing {
            nodes,
            public_key: self.public_key_pem.clone(),
            enrollment_configured: self.enroll_token.is_some(),
        }
    }

    /// Form defaults from the first configured node.
    pub async fn config_defaults(&self) -> Result<ConfigDefaults, ProxyError> {
        let node = self.default_node()?;
        let mut defaults: ConfigDefaults = self
            .fetch(node, Method::GET, "/api/config/defaults", None::<&()>)
            .await?;
        defaults.node_id = Some(node.id.clone());
        defaults.node_name = Some(node.name.clone());
        Ok(defaults)
    }

    /// Enroll this head's public key on `node_id` with the shared secret.
    pub async fn install_head_key(&self, node_id: &str) -> Result<HeadKeyResponse, ProxyError> {
        let node = self.select_node(Some(node_id))?;
        let Some(secret) = self.enroll_token.as_ref() else {
            return Err(ProxyError::EnrollmentNotConfigured);
        };
        let body = HeadKeyRequest {
            public_key: self.public_key_pem.clone(),
            token: secret.expose_secret().to_string(),
        };
        let installed: HeadKeyResponse = self
            .fetch(node, Method::POST, "/api/admin/head-key", Some(&body))
            .await?;
        info!(node_id = %node.id, fingerprint = %installed.fingerprint, "Head key installed");
        Ok(installed)
    }

    // ── Routed calls ────────────────────────────────────────────────────

    pub async fn create_task(&self, node_id: Option<&str>, task: &TaskCreate) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        self.detail(node, Method::POST, "/api/tasks".to_string(), Some(task))
            .await
    }

    pub async fn get_task(&self, node_id: Option<&str>, task_id: &str) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        self.detail(node, Method::GET, task_path(task_id, "")?, None::<&()>)
            .await
    }

    pub async fn submit_assistance(
        &self,
        node_id: Option<&str>,
        task_id: &str,
        body: &AssistRequest,
    ) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        self.detail(node, Method::POST, task_path(task_id, "/assist")?, Some(body))
            .await
    }

    pub async fn continue_task(
        &self,
        node_id: Option<&str>,
        task_id: &str,
        body: &ContinueRequest,
    ) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        self.detail(node, Method::POST, task_path(task_id, "/continue")?, Some(body))
            .await
    }

    pub async fn run_now(&self, node_id: Option<&str>, task_id: &str) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        self.detail(node, Method::POST, task_path(task_id, "/run-now")?, None::<&()>)
            .await
    }

    pub async fn reschedule(
        &self,
        node_id: Option<&str>,
        task_id: &str,
        scheduled_for: DateTime<FixedOffset>,
    ) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        let body = ScheduleRequest { scheduled_for };
        self.detail(node, Method::POST, task_path(task_id, "/schedule")?, Some(&body))
            .await
    }

    pub async fn close_browser(&self, node_id: Option<&str>, task_id: &str) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        self.detail(node, Method::POST, task_path(task_id, "/close-browser")?, None::<&()>)
            .await
    }

    pub async fn open_browser(&self, node_id: Option<&str>, task_id: &str) -> Result<TaskDetail, ProxyError> {
        let node = self.select_node(node_id)?;
        self.detail(node, Method::POST, task_path(task_id, "/open-browser")?, None::<&()>)
            .await
    }

    pub async fn delete_task(&self, node_id: Option<&str>, task_id: &str) -> Result<(), ProxyError> {
        let node = self.select_node(node_id)?;
        self.call(node, Method::DELETE, &task_path(task_id, "")?, None::<&()>)
            .await?;
        Ok(())
    }

    // ── Transport ───────────────────────────────────────────────────────

    /// A routed call whose answer is a task detail, rewritten for the head.
    async fn detail<B: Serialize + ?Sized>(
        &self,
        node: &HeadNode,
        method: Method,
        path: String,
        body: Option<&B>,
    ) -> Result<TaskDetail, ProxyError> {
        let detail: TaskDetail = self.fetch(node, method, &path, body).await?;
        Ok(attach_node(node, detail))
    }

    async fn fetch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        node: &HeadNode,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ProxyError> {
        let response = self.call(node, method, path, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProxyError::InvalidResponse {
                node_id: node.id.clone(),
                reason: e.to_string(),
            })
    }

    /// Send one request to `node` with a fresh assertion.
    async fn call<B: Serialize + ?Sized>(
        &self,
        node: &HeadNode,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ProxyError> {
        let assertion = self.signer.sign_for_node(&node.id)?;
        let url = node.endpoint(path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(assertion);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| ProxyError::Unreachable {
            node_id: node.id.clone(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        debug!(node_id = %node.id, %method, path, status = status.as_u16(), "Node call");
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // 403 from the enrollment endpoint is a bad secret, not a bad assertion.
            if path != "/api/admin/head-key" {
                return Err(ProxyError::Unauthorized {
                    node_id: node.id.clone(),
                    status: status.as_u16(),
                });
            }
        }
        let text = response.text().await.unwrap_or_default();
        Err(ProxyError::Upstream {
            node_id: node.id.clone(),
            status: status.as_u16(),
            detail: error_detail(&text),
        })
    }
}

/// Node path for a task action. The id is one encoded path segment, so it
/// can never reach a different route.
fn task_path(task_id: &str, action: &str) -> Result<String, ProxyError> {
    if task_id.is_empty() || task_id == "." || task_id == ".." {
        return Err(ProxyError::InvalidTaskId(task_id.to_string()));
    }
    Ok(format!("/api/tasks/{}{action}", urlencoding::encode(task_id)))
}

/// Pull `detail` out of a node's error body, falling back to the raw text.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| match v.get("detail") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Tag a detail with the node it came from and make its assist link absolute.
fn attach_node(node: &HeadNode, mut detail: TaskDetail) -> TaskDetail {
    detail.record.node_id = node.id.clone();
    if let Some(url) = detail.assist_launch_url.take() {
        detail.assist_launch_url = Some(if url.starts_with("http://") || url.starts_with("https://") {
            url
        } else {
            node.endpoint(&url)
        });
    }
    detail
}
