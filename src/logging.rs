//! ログ初期化
//!
//! 標準出力へのtracingサブスクライバを1回だけ設定する。
//! `RUST_LOG` が設定されていればそちらを優先する。

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` 未設定時のフィルタ
pub const DEFAULT_DIRECTIVES: &str =
    "info,emotion_lib=info,emotion_server=info,train_model=info,tower_http=info";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// フィルタ文字列が不正
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    /// グローバルサブスクライバの設定に失敗（設定済みなど）
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(String),
}

/// 既定フィルタでログを初期化
pub fn init() -> Result<(), LoggingError> {
    init_with(DEFAULT_DIRECTIVES)
}

/// 指定フィルタでログを初期化
pub fn init_with(default_directives: &str) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| LoggingError::SetGlobal(e.to_string()))
}
