//! Node HTTP surface: task CRUD, lifecycle controls, assistance, enrollment.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::error::ApiJson;
use super::types::{
    AssistQuery, AssistRequest, ConfigDefaults, ContinueRequest, HeadKeyRequest, HeadKeyResponse,
    NodeInfo, ScheduleRequest,
};
use crate::error::{Error, TrustError};
use crate::orchestrator::Orchestrator;
use crate::tasks::{TaskCreate, TaskDetail, TaskSummary};
use crate::trust::NodeTrust;

/// Shared state for node handlers.
#[derive(Clone)]
pub struct NodeState {
    pub orchestrator: Arc<Orchestrator>,
    pub trust: Arc<NodeTrust>,
}

/// Build the node router.
///
/// Every `/api/*` route except enrollment sits behind the assertion check.
pub fn node_router(orchestrator: Arc<Orchestrator>, trust: Arc<NodeTrust>) -> Router {
    let state = NodeState {
        orchestrator,
        trust,
    };

    let protected = Router::new()
        .route("/api/node/info", get(node_info))
        .route("/api/config/defaults", get(config_defaults))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(task_detail).delete(delete_task))
        .route("/api/tasks/{id}/assist", post(submit_assistance))
        .route("/api/tasks/{id}/continue", post(continue_task))
        .route("/api/tasks/{id}/schedule", post(reschedule_task))
        .route("/api/tasks/{id}/run-now", post(run_now))
        .route("/api/tasks/{id}/close-browser", post(close_browser))
        .route("/api/tasks/{id}/open-browser", post(open_browser))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_assertion,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/tasks/{id}/assist", get(assist_page))
        .route("/api/admin/head-key", post(install_head_key))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Auth ────────────────────────────────────────────────────────────────

async fn require_assertion(
    State(state): State<NodeState>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    if !state.trust.auth_required() {
        return Ok(next.run(request).await);
    }
    let token = bearer_token(&request).map(str::to_owned);
    let verified = match token {
        Some(token) => state.trust.verify(&token).await,
        None => Err(TrustError::Missing),
    };
    match verified {
        Ok(claims) => {
            debug!(node_id = %claims.node_id, path = %request.uri().path(), "Assertion accepted");
            Ok(next.run(request).await)
        }
        Err(e) => {
            match &e {
                TrustError::Rejected { reason } => {
                    warn!(reason = %reason, path = %request.uri().path(), "Assertion rejected")
                }
                other => debug!(error = %other, path = %request.uri().path(), "Unauthenticated request"),
            }
            Err(e.into())
        }
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ── Health / info ───────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "webai-node"
    }))
}

async fn node_info(State(state): State<NodeState>) -> Json<NodeInfo> {
    let issues = state.orchestrator.readiness();
    Json(NodeInfo {
        node_id: state.trust.node_id().to_string(),
        ready: issues.is_empty(),
        issues,
        has_keys: state.trust.has_keys(),
        enrollment_open: state.trust.enrollment_open().await,
    })
}

async fn config_defaults(State(state): State<NodeState>) -> Json<ConfigDefaults> {
    Json(ConfigDefaults::for_node(state.orchestrator.config()))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn list_tasks(State(state): State<NodeState>) -> Json<Vec<TaskSummary>> {
    Json(state.orchestrator.list().await)
}

async fn create_task(
    State(state): State<NodeState>,
    ApiJson(payload): ApiJson<TaskCreate>,
) -> Result<(StatusCode, Json<TaskDetail>), Error> {
    let detail = state.orchestrator.create(payload).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn task_detail(
    State(state): State<NodeState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(state.orchestrator.get_detail(&id).await?))
}

async fn delete_task(
    State(state): State<NodeState>,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    state.orchestrator.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_assistance(
    State(state): State<NodeState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<AssistRequest>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .orchestrator
            .submit_assistance(&id, &body.message)
            .await?,
    ))
}

async fn continue_task(
    State(state): State<NodeState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ContinueRequest>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .orchestrator
            .continue_task(&id, &body.instructions)
            .await?,
    ))
}

async fn reschedule_task(
    State(state): State<NodeState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ScheduleRequest>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .orchestrator
            .reschedule(&id, body.scheduled_for)
            .await?,
    ))
}

async fn run_now(
    State(state): State<NodeState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(state.orchestrator.run_now(&id).await?))
}

async fn close_browser(
    State(state): State<NodeState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(state.orchestrator.close_browser(&id).await?))
}

async fn open_browser(
    State(state): State<NodeState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(state.orchestrator.open_browser(&id).await?))
}

/// Redirect page into the relay viewer for a task waiting on a human.
async fn assist_page(
    State(state): State<NodeState>,
    Path(id): Path<String>,
    Query(query): Query<AssistQuery>,
) -> Result<Html<String>, Error> {
    let target = state.orchestrator.assist_target(&id, &query.token).await?;
    Ok(Html(format!(
        "<html>\n  <head>\n    <title>Assist task {id}</title>\n    \
         <meta http-equiv=\"refresh\" content=\"0; url={target}\">\n  </head>\n  <body>\n    \
         <p>Redirecting to the remote browser session...</p>\n    \
         <p>If you are not redirected, <a href=\"{target}\">click here</a>.</p>\n  </body>\n</html>\n"
    )))
}

// ── Enrollment ──────────────────────────────────────────────────────────

async fn install_head_key(
    State(state): State<NodeState>,
    ApiJson(body): ApiJson<HeadKeyRequest>,
) -> Result<Json<HeadKeyResponse>, Error> {
    let fingerprint = state
        .trust
        .install_key(&body.token, &body.public_key)
        .await?;
    Ok(Json(HeadKeyResponse {
        status: "installed".to_string(),
        fingerprint,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use ed25519_dalek::SigningKey;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use super::*;
    use crate::config::NodeConfig;
    use crate::error::RunnerError;
    use crate::runner::{AgentRunner, BrowserRequest, RunHistory, RunHooks, RunRequest};
    use crate::trust::AssertionSigner;
    use crate::trust::keys;

    struct IdleRunner;

    #[async_trait::async_trait]
    impl AgentRunner for IdleRunner {
        async fn run(
            &self,
            _request: RunRequest,
            _hooks: Arc<dyn RunHooks>,
            cancel: tokio_util::sync::CancellationToken,
        ) -> Result<RunHistory, RunnerError> {
            cancel.cancelled().await;
            Ok(RunHistory::default())
        }

        async fn open_browser(&self, _request: BrowserRequest) -> Result<(), RunnerError> {
            Ok(())
        }

        async fn close_browser(&self, _task_id: &str) -> Result<(), RunnerError> {
            Ok(())
        }

        fn readiness(&self) -> Vec<String> {
            Vec::new()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        router: Router,
        signer: AssertionSigner,
    }

    fn fixture(enroll: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::with_data_dir(dir.path());
        config.node_id = "node-a".to_string();
        config.trust.enroll_token = enroll.map(SecretString::from);
        let trust = Arc::new(NodeTrust::from_config(&config));
        let orchestrator = Orchestrator::from_config(config, Arc::new(IdleRunner));
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        Fixture {
            router: node_router(orchestrator, trust),
            signer: AssertionSigner::new(key, "node", Duration::from_secs(120)),
            _dir: dir,
        }
    }

    fn get(uri: &str, bearer: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let fx = fixture(None);
        let response = fx.router.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_requires_assertion() {
        let fx = fixture(None);
        let response = fx.router.oneshot(get("/api/tasks", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn enrollment_then_signed_listing() {
        let fx = fixture(Some("s3cret"));
        let pem = keys::public_key_pem(&fx.signer.verifying_key()).unwrap();

        let wrong = HttpRequest::builder()
            .method("POST")
            .uri("/api/admin/head-key")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"public_key": pem, "token": "nope"}).to_string(),
            ))
            .unwrap();
        let response = fx.router.clone().oneshot(wrong).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let enroll = HttpRequest::builder()
            .method("POST")
            .uri("/api/admin/head-key")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"public_key": pem, "token": "s3cret"}).to_string(),
            ))
            .unwrap();
        let response = fx.router.clone().oneshot(enroll).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "installed");

        let token = fx.signer.sign_for_node("node-a").unwrap();
        let response = fx
            .router
            .clone()
            .oneshot(get("/api/tasks", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));

        let foreign = fx.signer.sign_for_node("node-b").unwrap();
        let response = fx
            .router
            .oneshot(get("/api/node/info", Some(&foreign)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn assist_page_rejects_unknown_token() {
        let fx = fixture(None);
        let response = fx
            .router
            .oneshot(get("/tasks/missing/assist?token=abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
