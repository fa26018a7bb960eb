use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::NamespaceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::{LogView, ProtocolError};

pub type AppState = Arc<LogView>;

pub const DEFAULT_READ_COUNT: usize = 1_000;

/// Query string of a log read
#[derive(Debug, Deserialize)]
pub struct ReadParams {
    #[serde(default)]
    pub offset: u64,
    pub count: Option<usize>,
    pub not_seen_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "log request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "log request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// GET /namespaces
pub async fn list_namespaces(State(view): State<AppState>) -> Response {
    match view.namespaces() {
        Ok(namespaces) => {
            debug!(count = namespaces.len(), "listed namespaces");
            Json(namespaces).into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// GET /namespaces/{ns}/log
pub async fn read_log(
    State(view): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<ReadParams>,
) -> Response {
    let namespace = NamespaceId::new(namespace);
    let count = params.count.unwrap_or(DEFAULT_READ_COUNT);
    debug!(
        namespace = %namespace,
        offset = params.offset,
        count,
        not_seen_at = params.not_seen_at.as_deref().unwrap_or("-"),
        "remote log read"
    );

    match view
        .read(namespace, params.offset, count, params.not_seen_at)
        .await
    {
        Ok(batch) => (StatusCode::OK, Json(batch)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Health check endpoint
pub async fn health_check() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "blobkeep transaction log"
    }))
    .into_response()
}
