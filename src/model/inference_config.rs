//! モデルメタデータから推論に必要な情報を取り出す
//!
//! 出力ベクトルのインデックスとラベルの対応はここで検証し、以降は
//! 検証済みの対応表だけを使います。

use anyhow::{Context, Result};

use crate::model::model_metadata::ModelMetadata;
use crate::types::{validate_label_order, Emotion};

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// 出力インデックス順の感情ラベル（検証済み）
    pub class_labels: Vec<Emotion>,

    /// モデル入力解像度
    pub model_input_size: usize,
}

impl InferenceConfig {
    /// 対応する入力サイズ
    pub const EXPECTED_INPUT_SIZE: u32 = 48;

    /// メタデータからInferenceConfigを作成
    ///
    /// ラベル順と入力形状がこのサーバーの前提と合わなければエラー。
    pub fn from_metadata(metadata: &ModelMetadata) -> Result<Self> {
        let class_labels = validate_label_order(&metadata.class_labels)
            .context("モデルのクラスラベルが不正です")?;

        if metadata.image_size != Self::EXPECTED_INPUT_SIZE {
            anyhow::bail!(
                "モデル入力サイズが不正です: {}x{} (期待: {}x{})",
                metadata.image_size,
                metadata.image_size,
                Self::EXPECTED_INPUT_SIZE,
                Self::EXPECTED_INPUT_SIZE
            );
        }
        if metadata.channels != 1 {
            anyhow::bail!(
                "入力チャネル数が不正です: {} (期待: 1)",
                metadata.channels
            );
        }

        Ok(Self {
            class_labels,
            model_input_size: metadata.image_size as usize,
        })
    }

    /// 全クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// クラスインデックスから感情ラベルを取得
    pub fn class_index_to_emotion(&self, index: usize) -> Option<Emotion> {
        self.class_labels.get(index).copied()
    }
}
