//! 感情認識HTTPサーバー

pub mod error;
pub mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::ml::{resolve_device_type, EmotionClassifier, InferenceEngine};
use crate::model::{AppConfig, DeviceType};

pub use error::ApiError;

/// ハンドラ間で共有する状態
pub struct AppState {
    pub classifier: Arc<dyn EmotionClassifier>,
    pub metrics_path: PathBuf,
}

/// ルーターを構築
pub fn build_router(state: AppState, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(handlers::home))
        .route("/predict", post(handlers::predict))
        .route("/metrics", get(handlers::metrics))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

/// 設定に従ってモデルを読み込む
///
/// モデルファイルが無い・壊れている場合はエラー（サーバーは起動しない）。
pub fn load_classifier(config: &AppConfig) -> Result<Arc<dyn EmotionClassifier>> {
    let model_path = &config.model.model_path;
    if !model_path.exists() {
        anyhow::bail!("Model file not found at {}", model_path.display());
    }

    tracing::info!("モデルを読み込み中: {}", model_path.display());
    let device_type = resolve_device_type(config.device_type);
    let classifier: Arc<dyn EmotionClassifier> = match device_type {
        DeviceType::Wgpu => {
            use burn_wgpu::{Wgpu, WgpuDevice};
            Arc::new(InferenceEngine::<Wgpu>::load(model_path, WgpuDevice::default())?)
        }
        DeviceType::Cpu => {
            use burn_ndarray::{NdArray, NdArrayDevice};
            Arc::new(InferenceEngine::<NdArray>::load(model_path, NdArrayDevice::Cpu)?)
        }
    };
    tracing::info!("✓ モデル読み込み完了 ({})", device_type);

    Ok(classifier)
}

/// モデルを読み込み、待ち受けを開始する
pub async fn run(config: &AppConfig) -> Result<()> {
    let classifier = load_classifier(config)?;
    let state = AppState {
        classifier,
        metrics_path: config.model.metrics_path.clone(),
    };
    let app = build_router(state, config.server.body_limit_bytes);

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("{} で待ち受けできません", address))?;
    tracing::info!("サーバー起動: http://{}", listener.local_addr()?);

    axum::serve(listener, app).await.context("サーバーが異常終了しました")?;
    Ok(())
}
