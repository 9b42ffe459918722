//! Reply envelope shared by every verb.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleetgrid_tasks::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// `{ "status": "OK" | "ERROR", "data": …, "error": "…", "kind": "…" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl RpcReply {
    pub fn ok(data: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    pub fn error(e: &TaskError) -> Self {
        Self {
            status: ReplyStatus::Error,
            data: None,
            error: Some(e.to_string()),
            kind: Some(e.kind().to_string()),
        }
    }

    pub fn from_result(result: TaskResult<Value>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::error(&e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    fn http_status(&self) -> StatusCode {
        match self.kind.as_deref() {
            None => StatusCode::OK,
            Some("validation") => StatusCode::BAD_REQUEST,
            Some("permission_denied") => StatusCode::FORBIDDEN,
            Some("not_found") => StatusCode::NOT_FOUND,
            Some("capacity_exhausted") | Some("conflict") => StatusCode::CONFLICT,
            Some("connection") => StatusCode::BAD_GATEWAY,
            Some("maintenance_mode") => StatusCode::SERVICE_UNAVAILABLE,
            Some("not_supported") => StatusCode::NOT_IMPLEMENTED,
            Some("pending") => StatusCode::ACCEPTED,
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RpcReply {
    fn into_response(self) -> Response {
        (self.http_status(), Json(self)).into_response()
    }
}

/// Argument of every `<Verb>Result` poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultArg {
    #[serde(default)]
    pub id: String,
}
