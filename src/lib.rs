//! 表情画像から感情を推定するライブラリ
//!
//! - `ml`: CNNモデル・前処理・学習・推論
//! - `model`: 設定・モデルアーカイブ・学習履歴
//! - `server`: HTTP API

pub mod types;
pub mod logging;
pub mod model;
pub mod ml;
pub mod server;

pub use types::{Emotion, Prediction, NUM_CLASSES};
