//! モデルメタデータの定義
//!
//! モデルファイル（tar.gz）に重みと一緒に保存され、出力ベクトルのインデックスと
//! 感情ラベルの対応、入力画像の形状、学習結果の概要を記録します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// 出力インデックス順のクラスラベル
    /// 例: ["Angry", "Disgust", "Fear", "Happy", "Sad", "Surprise", "Neutral"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形、通常48）
    pub image_size: u32,

    /// 入力チャネル数（グレースケールなので1）
    pub channels: u32,

    /// 実際に学習したエポック数（早期終了を含む）
    pub epochs_run: u32,

    /// 最良の検証損失
    pub best_val_loss: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        image_size: u32,
        epochs_run: u32,
        best_val_loss: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            image_size,
            channels: 1,
            epochs_run,
            best_val_loss,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
