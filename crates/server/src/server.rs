//! Inbound HTTP surface (spec.md §6): the channel subscription handshake,
//! the channel message ingestion endpoint, a workflow-scoped trigger
//! endpoint, and its validate-only dry-run variant, bootstrapped the way the
//! teacher's `api-gateway::server` builds and layers its router.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common::types::{IncomingMessage, JsonValue, TriggerType};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use uuid::Uuid;
use workflow_engine::channel::{self, BufferFlushHandler, ChannelIngestion, IngestOutcome};
use workflow_engine::dispatcher::TriggerDispatcher;
use workflow_engine::repos::{ChannelBufferConfigRegistry, WorkflowRepository};
use workflow_engine::WorkflowExecutor;

/// Per-channel credentials the inbound webhook path needs: the HMAC secret
/// that signs inbound message bodies, and the verify token a provider's
/// one-time subscription handshake (spec.md §6's `GET` endpoint) presents.
/// Channel registry CRUD itself is a non-goal (spec.md §1); this is the
/// minimal lookup the two webhook handlers below consult.
#[derive(Clone, Debug)]
pub struct ChannelCredentials {
    pub secret: String,
    pub verify_token: String,
}

/// Dispatches a coalesced buffer through [`TriggerDispatcher`] once its
/// window lapses, the counterpart to the immediate/flushed-at-capacity path
/// `channel_webhook` takes inline.
pub struct DispatchOnFlush {
    dispatcher: Arc<TriggerDispatcher>,
}

impl DispatchOnFlush {
    pub fn new(dispatcher: Arc<TriggerDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait::async_trait]
impl BufferFlushHandler for DispatchOnFlush {
    async fn on_flush(&self, buffer: common::types::MessageBuffer) {
        let tenant_id = buffer.tenant_id;
        let message = buffer.coalesce();
        let payload = serde_json::to_value(&message).unwrap_or(JsonValue::Null);
        let mut event_filters = HashMap::new();
        event_filters.insert("channel_ids".to_string(), json!([buffer.channel_id]));
        let _ = self
            .dispatcher
            .dispatch(tenant_id, TriggerType::ChannelWebhook, event_filters, payload)
            .await;
    }
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<TriggerDispatcher>,
    pub channel_ingestion: Arc<ChannelIngestion>,
    pub buffer_configs: Arc<ChannelBufferConfigRegistry>,
    /// Per-channel credentials. Channel registry CRUD is out of scope
    /// (spec.md §1); this is the minimal wiring the two webhook handlers need.
    pub channel_credentials: Arc<RwLock<HashMap<String, ChannelCredentials>>>,
    pub workflow_repo: Arc<dyn WorkflowRepository>,
    pub executor: Arc<WorkflowExecutor>,
}

pub fn create_server(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/:provider/:tenant_id/:channel_id", get(channel_verify).post(channel_webhook))
        .route("/webhooks/trigger/:tenant_id/:workflow_id", post(trigger_workflow))
        .route("/webhooks/trigger/:tenant_id/:workflow_id/test", post(trigger_workflow_test))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Provider subscription handshake (spec.md §6): a provider verifies
/// ownership of the endpoint by presenting `hub.mode=subscribe` and
/// `hub.verify_token`, and expects `hub.challenge` echoed back verbatim iff
/// the token matches the channel's registered `verify_token`.
async fn channel_verify(
    State(state): State<AppState>,
    Path((_provider, _tenant_id, channel_id)): Path<(String, Uuid, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(credentials) = state.channel_credentials.read().await.get(&channel_id).cloned() else {
        return (StatusCode::NOT_FOUND, "channel not found".to_string()).into_response();
    };
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params.get("hub.verify_token").map(String::as_str).unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    if mode == "subscribe" && token == credentials.verify_token {
        (StatusCode::OK, challenge).into_response()
    } else {
        (StatusCode::FORBIDDEN, "verification token mismatch".to_string()).into_response()
    }
}

/// Channel provider webhook: verifies the signature, folds the message
/// into its sender's buffer, and dispatches a `ChannelWebhook` trigger once
/// the message (or coalesced buffer) is ready.
///
/// Always replies `200` (spec.md §6) so the provider doesn't interpret a
/// rejection as a delivery failure and retry the same event; every failure
/// mode here (unknown channel, bad signature, malformed body) is logged and
/// silently dropped instead of surfaced to the caller.
async fn channel_webhook(
    State(state): State<AppState>,
    Path((_provider, tenant_id, channel_id)): Path<(String, Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let credentials = state.channel_credentials.read().await.get(&channel_id).cloned();
    let Some(credentials) = credentials else {
        tracing::warn!(%channel_id, "inbound webhook for unknown channel");
        return (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response();
    };

    let signature = headers.get("x-signature").and_then(|v| v.to_str().ok()).unwrap_or("");
    if let Err(e) = channel::verify_signature(credentials.secret.as_bytes(), &body, signature) {
        tracing::warn!(%channel_id, error = %e, "inbound webhook signature rejected");
        return (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response();
    }

    let message: IncomingMessage = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(%channel_id, error = %e, "inbound webhook payload malformed");
            return (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response();
        }
    };

    let config = state.buffer_configs.get(&channel_id).await;
    match state.channel_ingestion.ingest(tenant_id, message, &config).await {
        IngestOutcome::Immediate(buffer) | IngestOutcome::Flushed(buffer) => {
            let message = buffer.coalesce();
            let payload = serde_json::to_value(&message).unwrap_or(JsonValue::Null);
            let mut event_filters = HashMap::new();
            event_filters.insert("channel_ids".to_string(), json!([buffer.channel_id.clone()]));
            let _ = state
                .dispatcher
                .dispatch(tenant_id, TriggerType::ChannelWebhook, event_filters, payload)
                .await;
            (StatusCode::OK, Json(json!({ "status": "dispatched" }))).into_response()
        }
        IngestOutcome::Buffering => (StatusCode::OK, Json(json!({ "status": "buffering" }))).into_response(),
    }
}

/// Workflow-scoped webhook trigger (spec.md §6): launches one named
/// workflow with the posted payload as a detached task and replies `200`
/// once the run has started, the same launch-detached-from-request-scope
/// contract §4.F gives the trigger dispatcher's own fan-out.
async fn trigger_workflow(
    State(state): State<AppState>,
    Path((tenant_id, workflow_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<JsonValue>,
) -> impl IntoResponse {
    match state.workflow_repo.find_by_id(tenant_id, workflow_id).await {
        Ok(Some(workflow)) => {
            let executor = state.executor.clone();
            tokio::spawn(async move {
                let result = executor.execute(&workflow, payload).await;
                if !result.success {
                    tracing::warn!(workflow_id = %workflow.id, error = ?result.error, "webhook-triggered run ended in failure");
                }
            });
            (StatusCode::OK, Json(json!({ "status": "dispatched" }))).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "workflow not found" }))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

/// Dry-run variant of [`trigger_workflow`]: validates the workflow graph
/// only (spec.md §6's "test" path) without walking a single node, so callers
/// can check a workflow is well-formed with no side effects.
async fn trigger_workflow_test(
    State(state): State<AppState>,
    Path((tenant_id, workflow_id)): Path<(Uuid, Uuid)>,
) -> impl IntoResponse {
    match state.workflow_repo.find_by_id(tenant_id, workflow_id).await {
        Ok(Some(workflow)) => {
            let result = state.executor.validate_workflow(&workflow);
            (StatusCode::OK, Json(json!({ "valid": result.errors.is_empty(), "errors": result.errors, "warnings": result.warnings }))).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "workflow not found" }))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use workflow_engine::repos::{InMemoryContinuationRepository, InMemoryWorkflowRepository};

    struct StubProvider;
    #[async_trait::async_trait]
    impl ai_service::AiProvider for StubProvider {
        async fn complete(&self, _request: ai_service::AgentRequest) -> Result<ai_service::AgentResponse, ai_service::AgentError> {
            unreachable!("not exercised by these tests")
        }
    }

    fn test_state() -> AppState {
        let workflow_repo: Arc<dyn WorkflowRepository> = Arc::new(InMemoryWorkflowRepository::new());
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(StubProvider),
            None,
            Arc::new(workflow_engine::nodes::NullChannelManager),
            Arc::new(InMemoryContinuationRepository::new()),
            2,
            60,
            86_400,
        ));
        AppState {
            dispatcher: Arc::new(TriggerDispatcher::new(executor.clone(), workflow_repo.clone())),
            channel_ingestion: Arc::new(ChannelIngestion::new(Arc::new(workflow_engine::repos::MokaBufferStore::new()))),
            buffer_configs: Arc::new(ChannelBufferConfigRegistry::new()),
            channel_credentials: Arc::new(RwLock::new(HashMap::new())),
            workflow_repo,
            executor,
        }
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let app = create_server(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_unknown_workflow_is_not_found() {
        let app = create_server(test_state());
        let uri = format!("/webhooks/trigger/{}/{}", Uuid::new_v4(), Uuid::new_v4());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_test_unknown_workflow_is_not_found() {
        let app = create_server(test_state());
        let uri = format!("/webhooks/trigger/{}/{}/test", Uuid::new_v4(), Uuid::new_v4());
        let response = app
            .oneshot(Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn channel_webhook_without_registered_credentials_replies_ok_and_drops() {
        // spec.md §6: the inbound channel webhook always replies 200, even
        // when the event is silently dropped, so providers don't retry it.
        let app = create_server(test_state());
        let uri = format!("/webhooks/generic/{}/unknown", Uuid::new_v4());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn channel_verify_without_registered_credentials_is_not_found() {
        let app = create_server(test_state());
        let uri = format!(
            "/webhooks/generic/{}/unknown?hub.mode=subscribe&hub.verify_token=x&hub.challenge=y",
            Uuid::new_v4()
        );
        let response = app
            .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
