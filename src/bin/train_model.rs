//! 感情分類CNNの学習
//!
//! 使い方: `train_model [config.json]`
//!
//! `training.train_dir` / `training.val_dir` 以下に感情名のサブディレクトリ
//! （angry, disgust, fear, happy, sad, surprise, neutral）を置いておくこと。

use emotion_lib::ml::run_training;
use emotion_lib::model::AppConfig;

fn main() -> anyhow::Result<()> {
    if let Err(e) = emotion_lib::logging::init() {
        eprintln!("ログ初期化に失敗しました: {}", e);
    }

    let config = AppConfig::from_args();
    config.display();
    tracing::info!(
        "データ拡張: 回転±{}°, 横シフト{}, 縦シフト{}, 左右反転={}",
        config.augmentation.rotation_degrees,
        config.augmentation.width_shift,
        config.augmentation.height_shift,
        config.augmentation.horizontal_flip
    );

    let report = match run_training(&config) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("学習に失敗しました: {:#}", e);
            return Err(e);
        }
    };

    tracing::info!("=== 学習完了 ===");
    tracing::info!("実行エポック数: {}", report.epochs_run);
    if report.stopped_early {
        tracing::info!("早期終了しました");
    }
    tracing::info!(
        "最良エポック: {} (val_loss={:.4})",
        report.best_epoch,
        report.best_val_loss
    );
    tracing::info!("モデル: {}", report.model_path.display());
    tracing::info!("学習履歴: {}", report.metrics_path.display());
    Ok(())
}
