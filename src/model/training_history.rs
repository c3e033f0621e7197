//! 学習履歴（metrics.json）
//!
//! メトリクス名 -> エポックごとの値の配列、という形のJSONで保存します。
//! 学習のたびに丸ごと上書きされ、部分更新はしません。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 1エポック分のメトリクス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    /// エポック番号（1始まり）
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// このエポックで使った学習率
    pub learning_rate: f64,
}

/// エポックごとのメトリクス履歴
///
/// フィールドはキー名の辞書順に並べてある。サーバー側でJSONを読み直して
/// 再シリアライズしても同じバイト列になる。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub accuracy: Vec<f64>,
    pub learning_rate: Vec<f64>,
    pub loss: Vec<f64>,
    pub val_accuracy: Vec<f64>,
    pub val_loss: Vec<f64>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_epoch(&mut self, metrics: &EpochMetrics) {
        self.accuracy.push(metrics.accuracy);
        self.learning_rate.push(metrics.learning_rate);
        self.loss.push(metrics.loss);
        self.val_accuracy.push(metrics.val_accuracy);
        self.val_loss.push(metrics.val_loss);
    }

    /// 記録済みエポック数
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    /// 最良（最小）の検証損失と、そのエポック番号（1始まり）
    pub fn best_val_loss(&self) -> Option<(usize, f64)> {
        self.val_loss
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
                Some((_, b)) if b <= v => best,
                _ => Some((i + 1, v)),
            })
    }

    /// JSONとして保存（親ディレクトリが無ければ作成）
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create parent directory: {:?}", parent))?;
            }
        }
        let json = serde_json::to_string(self).context("Failed to serialize training history")?;
        fs::write(path, json).context(format!("Failed to write metrics file: {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read metrics file: {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse training history")
    }
}
