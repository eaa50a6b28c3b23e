//! HTTP route handlers for the API.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use homecare_common::{
    HomecareError, Memory, MemoryCategory, MemoryPatch, MemorySearchResult, PatientSummary,
};
use homecare_memory::CandidateFailure;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "homecare-memory",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ErrorResponse {
    pub fn status_for(error: &HomecareError) -> StatusCode {
        match error {
            HomecareError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HomecareError::NotFound { .. } => StatusCode::NOT_FOUND,
            HomecareError::Extraction(_) | HomecareError::Embedding(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<HomecareError> for ErrorResponse {
    fn from(e: HomecareError) -> Self {
        let status = Self::status_for(&e);
        if status.is_server_error() {
            error!(code = e.code(), error = %e, "Request failed");
        }
        Self {
            error: e.to_string(),
            code: e.code(),
            status,
        }
    }
}

impl From<JsonRejection> for ErrorResponse {
    fn from(rejection: JsonRejection) -> Self {
        HomecareError::Validation(rejection.body_text()).into()
    }
}

impl From<PathRejection> for ErrorResponse {
    fn from(rejection: PathRejection) -> Self {
        HomecareError::Validation(rejection.body_text()).into()
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Ingest request body.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub patient_id: String,
    pub conversation: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub memories_created: usize,
    pub memories_updated: usize,
    pub memory_ids: Vec<Uuid>,
    pub failures: Vec<CandidateFailure>,
}

/// Extract and store memories from a conversation.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), ErrorResponse> {
    let Json(request) = payload?;
    info!(
        patient_id = %request.patient_id,
        utterances = request.conversation.len(),
        "Received conversation"
    );

    let report = state
        .coordinator
        .ingest(&request.patient_id, &request.conversation)
        .await?;

    if !report.failures.is_empty() {
        warn!(
            patient_id = %request.patient_id,
            failed = report.failures.len(),
            "Some candidate facts were not stored"
        );
    }

    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            memories_created: report.created,
            memories_updated: report.updated,
            memory_ids: report.memory_ids,
            failures: report.failures,
        }),
    ))
}

/// Search request body.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub patient_id: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub category_filter: Option<MemoryCategory>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<MemorySearchResult>,
    pub total: usize,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ErrorResponse> {
    let Json(request) = payload?;
    let limit = request
        .limit
        .unwrap_or(state.coordinator.config().default_search_limit);

    let results = state
        .coordinator
        .search(
            &request.patient_id,
            &request.query,
            limit,
            request.category_filter,
        )
        .await?;

    Ok(Json(SearchResponse {
        total: results.len(),
        results,
    }))
}

pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Memory>, ErrorResponse> {
    let Path(id) = id?;
    Ok(Json(state.coordinator.get(id).await?))
}

pub async fn update_memory(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<MemoryPatch>, JsonRejection>,
) -> Result<Json<Memory>, ErrorResponse> {
    let Path(id) = id?;
    let Json(patch) = payload?;
    Ok(Json(state.coordinator.update(id, patch).await?))
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, ErrorResponse> {
    let Path(id) = id?;
    state.coordinator.soft_delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn patient_summary(
    State(state): State<Arc<AppState>>,
    Path(patient_id): Path<String>,
) -> Result<Json<PatientSummary>, ErrorResponse> {
    Ok(Json(state.coordinator.summary(&patient_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            service: "homecare-memory",
            version: "0.1.0",
            uptime_seconds: 100,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("uptime_seconds"));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (HomecareError::Validation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (HomecareError::not_found("abc"), StatusCode::NOT_FOUND),
            (HomecareError::Extraction("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (HomecareError::Embedding("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (HomecareError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (HomecareError::VectorIndex("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ErrorResponse::status_for(&error), status, "{error}");
        }
    }

    #[test]
    fn test_error_body_has_code_only() {
        let response = ErrorResponse::from(HomecareError::not_found("abc"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_search_request_defaults() {
        let request: SearchRequest =
            serde_json::from_str(r#"{"patient_id": "P1", "query": "allergies"}"#).unwrap();
        assert!(request.limit.is_none());
        assert!(request.category_filter.is_none());

        let request: SearchRequest = serde_json::from_str(
            r#"{"patient_id": "P1", "query": "x", "limit": 5, "category_filter": "medical_history"}"#,
        )
        .unwrap();
        assert_eq!(request.limit, Some(5));
        assert_eq!(request.category_filter, Some(MemoryCategory::MedicalHistory));
    }
}
