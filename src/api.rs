//! REST API server for the financial agent workflow
//!
//! Exposes the workflow orchestrator over HTTP.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::models::{Goals, ProposalType};
use crate::orchestrator::{RespondRequest, WorkflowOrchestrator};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaycheckRequest {
    pub user_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverspendRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardRequest {
    pub user_id: String,
    pub income: Decimal,
    #[serde(default)]
    pub goals: Option<Goals>,
}

#[derive(Debug, Deserialize)]
pub struct ProposalFilter {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            retryable: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            retryable: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn from_error(e: &WorkflowError) -> Self {
        Self {
            retryable: Some(e.is_retryable()),
            ..Self::error(e.to_string())
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

/// HTTP status for a workflow error.
pub fn status_for(e: &WorkflowError) -> StatusCode {
    match e {
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::InvalidTransition { .. } | WorkflowError::DuplicateProposal(_) => {
            StatusCode::CONFLICT
        }
        WorkflowError::UnknownProposalType(_) | WorkflowError::ProposalMismatch(_) => {
            StatusCode::BAD_REQUEST
        }
        WorkflowError::PreconditionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond_with<T: Serialize>(outcome: crate::Result<T>) -> ApiResult {
    match outcome {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => {
            let status = status_for(&e);
            warn!(status = status.as_u16(), error = %e, "Request failed");
            (status, Json(ApiResponse::from_error(&e)))
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<WorkflowOrchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Workflow Endpoints
/// =============================

async fn paycheck(State(state): State<ApiState>, Json(req): Json<PaycheckRequest>) -> ApiResult {
    info!(user_id = %req.user_id, amount = %req.amount, "POST /workflow/paycheck");
    respond_with(state.orchestrator.paycheck(&req.user_id, req.amount).await)
}

async fn overspend(State(state): State<ApiState>, Json(req): Json<OverspendRequest>) -> ApiResult {
    info!(user_id = %req.user_id, "POST /workflow/overspend");
    respond_with(state.orchestrator.overspend(&req.user_id).await)
}

async fn onboard(State(state): State<ApiState>, Json(req): Json<OnboardRequest>) -> ApiResult {
    info!(user_id = %req.user_id, income = %req.income, "POST /workflow/onboard");
    respond_with(
        state
            .orchestrator
            .onboard(&req.user_id, req.income, req.goals)
            .await,
    )
}

async fn respond_to_proposal(
    State(state): State<ApiState>,
    Json(req): Json<RespondRequest>,
) -> ApiResult {
    info!(
        proposal_id = %req.proposal_id,
        user_id = %req.user_id,
        kind = %req.kind,
        approved = req.approved,
        "POST /proposal/respond"
    );
    respond_with(state.orchestrator.respond(req).await)
}

/// =============================
/// Read Endpoints
/// =============================

async fn get_proposal(State(state): State<ApiState>, Path(proposal_id): Path<Uuid>) -> ApiResult {
    respond_with(state.orchestrator.get_proposal(proposal_id).await)
}

async fn list_proposals(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(filter): Query<ProposalFilter>,
) -> ApiResult {
    let kind = match filter.kind.as_deref().map(str::parse::<ProposalType>).transpose() {
        Ok(kind) => kind,
        Err(e) => return respond_with::<()>(Err(e)),
    };
    respond_with(state.orchestrator.list_proposals(&user_id, kind).await)
}

async fn cycle_state(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    respond_with(state.orchestrator.cycle_state(&user_id).await)
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<WorkflowOrchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/workflow/paycheck", post(paycheck))
        .route("/workflow/overspend", post(overspend))
        .route("/workflow/onboard", post(onboard))
        .route("/proposal/respond", post(respond_to_proposal))
        .route("/proposals/:proposal_id", get(get_proposal))
        .route("/users/:user_id/proposals", get(list_proposals))
        .route("/users/:user_id/cycle", get(cycle_state))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<WorkflowOrchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{AgentPolicies, WorkflowSettings};
    use crate::state::InMemoryRecordStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        let orchestrator = WorkflowOrchestrator::new(
            Arc::new(InMemoryRecordStore::new()),
            AgentPolicies::rules(),
            WorkflowSettings::default(),
        );
        create_router(Arc::new(orchestrator))
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&router(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_onboard_then_read_back() {
        let router = router();
        let (status, body) = call(
            &router,
            "POST",
            "/workflow/onboard",
            Some(json!({"userId": "u1", "income": 5000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["stage"], "budget_proposed");
        let proposal_id = body["data"]["proposalId"].as_str().unwrap().to_string();

        let (status, body) = call(&router, "GET", &format!("/proposals/{}", proposal_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["type"], "budget");

        let (_, body) = call(&router, "GET", "/users/u1/cycle", None).await;
        assert_eq!(body["data"]["state"], "awaiting_budget_decision");

        let (_, body) = call(&router, "GET", "/users/u1/proposals?type=budget", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let router = router();

        let (status, body) = call(
            &router,
            "POST",
            "/proposal/respond",
            Some(json!({
                "proposalId": Uuid::new_v4(),
                "userId": "u1",
                "type": "savings",
                "approved": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            &router,
            "POST",
            "/proposal/respond",
            Some(json!({
                "proposalId": Uuid::new_v4(),
                "userId": "u1",
                "type": "budget",
                "approved": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &router,
            "POST",
            "/workflow/paycheck",
            Some(json!({"userId": "u1", "amount": -5})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&WorkflowError::DuplicateProposal("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&WorkflowError::AgentTimeout(10)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&WorkflowError::StoreError("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
