//! HTTPエラーレスポンス
//!
//! すべてのエラーは `{"error": <message>}` のJSONで返す。5xxはerrorレベルでログに残す。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// `image`フィールドが無い
    #[error("No image provided")]
    MissingImage,
    /// metrics.jsonが無い
    #[error("Metrics file not found")]
    MetricsNotFound,
    /// アップロードの受信に失敗（サイズ超過など）
    #[error("{message}")]
    Upload { status: StatusCode, message: String },
    /// デコード・推論・ファイル読み込みの失敗
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingImage => StatusCode::BAD_REQUEST,
            ApiError::MetricsNotFound => StatusCode::NOT_FOUND,
            ApiError::Upload { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{} {}", status, self);
        }
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
