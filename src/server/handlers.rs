//! ルートハンドラ

use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use serde_json::{json, Value};

use crate::server::{error::ApiError, AppState};
use crate::types::Prediction;

/// アップロード画像のフィールド名
pub const IMAGE_FIELD: &str = "image";

/// GET / : 稼働状況とエンドポイント一覧
pub async fn home() -> Json<Value> {
    Json(json!({
        "status": "API is running",
        "endpoints": {
            "/predict": "POST - Detect emotion from image",
            "/metrics": "GET - Get model metrics"
        }
    }))
}

/// POST /predict : multipartの`image`フィールドを分類する
pub async fn predict(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    // multipartでないリクエストも「画像なし」として扱う
    let Ok(multipart) = multipart else {
        return Err(ApiError::MissingImage);
    };
    let bytes = read_image_field(multipart)
        .await?
        .ok_or(ApiError::MissingImage)?;

    let classifier = Arc::clone(&state.classifier);
    let result = tokio::task::spawn_blocking(move || classifier.classify_bytes(&bytes))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let prediction = result?;
    tracing::info!(
        "予測結果: {} ({:.3})",
        prediction.emotion,
        prediction.confidence
    );
    Ok(Json(prediction))
}

async fn read_image_field(mut multipart: Multipart) -> Result<Option<Bytes>, ApiError> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!("multipartの解析に失敗しました: {}", e);
                return Ok(None);
            }
        };

        // ファイルとして送られたパートのみ（同名のテキストフィールドは無視）
        if field.name() == Some(IMAGE_FIELD) && field.file_name().is_some() {
            let bytes = field.bytes().await.map_err(|e| ApiError::Upload {
                status: e.status(),
                message: e.body_text(),
            })?;
            return Ok(Some(bytes));
        }
    }
}

/// GET /metrics : 学習履歴を毎回ファイルから読み直して返す
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let content = match tokio::fs::read_to_string(&state.metrics_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ApiError::MetricsNotFound),
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };

    let value: Value =
        serde_json::from_str(&content).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(value))
}
