//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル/メトリクスのパス、学習パラメータ、サーバー設定を
//! JSON形式で保存・読み込みします。ファイルが無い場合はデフォルト値を使います。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// モデルファイル（tar.gz）のパス
    pub model_path: PathBuf,
    /// 学習履歴（metrics.json）のパス
    pub metrics_path: PathBuf,
    /// 畳み込みブロック後のドロップアウト率
    pub conv_dropout: f64,
    /// 全結合層後のドロップアウト率
    pub dense_dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model/emotion_model.tar.gz"),
            metrics_path: PathBuf::from("model/metrics.json"),
            conv_dropout: 0.25,
            dense_dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 学習データのルート（クラスごとのサブディレクトリ）
    pub train_dir: PathBuf,
    /// 検証データのルート
    pub val_dir: PathBuf,
    /// 最大エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 初期学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// val_lossが改善しないまま学習を打ち切るまでのエポック数
    pub early_stopping_patience: usize,
    /// 学習率を下げるときの倍率
    pub lr_plateau_factor: f64,
    /// 学習率を下げるまで待つエポック数
    pub lr_plateau_patience: usize,
    /// 学習率の下限
    pub min_learning_rate: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("dataset/train"),
            val_dir: PathBuf::from("dataset/test"),
            num_epochs: 10,
            batch_size: 64,
            num_workers: 1,
            learning_rate: 1e-3,
            seed: 42,
            early_stopping_patience: 10,
            lr_plateau_factor: 0.2,
            lr_plateau_patience: 5,
            min_learning_rate: 1e-5,
        }
    }
}

/// データ拡張設定（学習データのみに適用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationSettings {
    /// 回転角の範囲（±度）
    pub rotation_degrees: f32,
    /// 横方向シフト（幅に対する割合）
    pub width_shift: f32,
    /// 縦方向シフト（高さに対する割合）
    pub height_shift: f32,
    /// 左右反転
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_degrees: 20.0,
            width_shift: 0.2,
            height_shift: 0.2,
            horizontal_flip: true,
        }
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロードの最大サイズ（バイト）
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5005,
            body_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    pub augmentation: AugmentationSettings,
    /// サーバー設定
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 値の範囲を検証する（範囲外のドロップアウト率などはburn内部でパニックになる）
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, rate) in [
            ("model.conv_dropout", self.model.conv_dropout),
            ("model.dense_dropout", self.model.dense_dropout),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                anyhow::bail!("{} は0以上1以下が必要です: {}", name, rate);
            }
        }

        let training = &self.training;
        if training.batch_size == 0 {
            anyhow::bail!("training.batch_size は1以上が必要です");
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            anyhow::bail!("training.learning_rate は正の値が必要です: {}", training.learning_rate);
        }
        if !(training.lr_plateau_factor > 0.0 && training.lr_plateau_factor < 1.0) {
            anyhow::bail!(
                "training.lr_plateau_factor は0より大きく1未満が必要です: {}",
                training.lr_plateau_factor
            );
        }
        Ok(())
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// コマンドライン引数（第1引数が設定ファイルのパス）から読み込む
    pub fn from_args() -> Self {
        match std::env::args().nth(1) {
            Some(path) => Self::load_or_default_from(path),
            None => Self::load_or_default(),
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        tracing::info!("=== アプリケーション設定 ===");
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("モデルパス: {}", self.model.model_path.display());
        tracing::info!("メトリクスパス: {}", self.model.metrics_path.display());
        tracing::info!(
            "学習: エポック数={}, バッチサイズ={}, 学習率={}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate
        );
        tracing::info!("サーバー: {}", self.server.bind_address());
    }
}
