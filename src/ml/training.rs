//! モデル学習
//!
//! クラスごとのサブディレクトリに分かれた画像データセットを読み込み、
//! CNNを学習して、モデルファイルと学習履歴を書き出します。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use burn::{
    backend::{Autodiff, Wgpu},
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;

use crate::ml::augmentation::augment;
use crate::ml::backend::resolve_device_type;
use crate::ml::callbacks::{BestCheckpoint, ReduceLrOnPlateau, StoppingDecision};
use crate::ml::{encode_weights, normalize_gray, to_model_input, EmotionCnn, ModelConfig, IMAGE_SIZE};
use crate::model::{
    save_model_with_metadata, AppConfig, AugmentationSettings, DeviceType, EpochMetrics,
    ModelMetadata, TrainingHistory,
};
use crate::types::{Emotion, NUM_CLASSES};

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// 学習データセット（パスのリストのみ保持）
pub struct EmotionDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
}

impl EmotionDataset {
    /// ディレクトリから読み込む
    ///
    /// サブディレクトリ名を感情ラベルとして解釈する（大文字小文字は区別しない）。
    /// クラスIDは`Emotion`の並び順で決まり、ディレクトリの列挙順には依存しない。
    pub fn from_directory(data_dir: &Path) -> Result<Self> {
        let mut class_dirs: Vec<(Emotion, PathBuf)> = Vec::new();

        let entries = std::fs::read_dir(data_dir)
            .context(format!("データセットを開けません: {}", data_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", path.display()))?;
            match name.parse::<Emotion>() {
                Ok(emotion) => class_dirs.push((emotion, path)),
                Err(_) => tracing::warn!("未知のクラスディレクトリをスキップします: {}", path.display()),
            }
        }
        class_dirs.sort_by_key(|(emotion, _)| emotion.index());

        let mut samples = Vec::new();
        for (emotion, class_dir) in class_dirs {
            let mut images = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if path.is_file() && has_image_extension(&path) {
                    images.push(path);
                }
            }
            images.sort();
            samples.extend(images.into_iter().map(|p| (p, emotion.index())));
        }

        Ok(Self { samples })
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct EmotionItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<EmotionItem> for EmotionDataset {
    fn get(&self, index: usize) -> Option<EmotionItem> {
        let (path, label) = self.samples.get(index)?;
        Some(EmotionItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチャー
///
/// `augmentation`がある場合は1枚ごとにランダム拡張を掛ける（学習用）。
#[derive(Clone)]
pub struct EmotionBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmentation: Option<AugmentationSettings>,
}

impl<B: Backend> EmotionBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, augmentation: Option<AugmentationSettings>) -> Self {
        Self {
            device,
            image_size,
            augmentation,
        }
    }

    fn load_pixels(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path)?;
        let gray = to_model_input(&img, self.image_size);
        let gray = match &self.augmentation {
            Some(settings) => augment(&gray, settings, &mut rand::thread_rng()),
            None => gray,
        };
        Ok(normalize_gray(&gray))
    }
}

impl<B: Backend> Batcher<B, EmotionItem, EmotionBatch<B>> for EmotionBatcher<B> {
    fn batch(&self, items: Vec<EmotionItem>, _device: &B::Device) -> EmotionBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match self.load_pixels(&item.path) {
                Ok(pixels) => all_pixels.extend_from_slice(&pixels),
                Err(e) => {
                    tracing::warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    // 読めない画像はゼロで埋める
                    all_pixels.extend(std::iter::repeat(0.0f32).take(size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        EmotionBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct EmotionBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// 学習結果の概要
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// 実際に回したエポック数
    pub epochs_run: usize,
    /// 書き出した重みのエポック（1始まり）
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub stopped_early: bool,
    pub model_path: PathBuf,
    pub metrics_path: PathBuf,
}

/// 損失と正解数の集計
#[derive(Default)]
struct Accumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl Accumulator {
    fn add<B: Backend>(&mut self, loss: f64, output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) {
        let batch_size = targets.dims()[0];
        self.loss_sum += loss * batch_size as f64;
        self.correct += count_correct(output, targets);
        self.samples += batch_size;
    }

    fn mean_loss(&self) -> f64 {
        if self.samples > 0 {
            self.loss_sum / self.samples as f64
        } else {
            f64::NAN
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples > 0 {
            self.correct as f64 / self.samples as f64
        } else {
            0.0
        }
    }
}

fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    // argmax(1)は[batch, 1]を返すので平坦化してから比較
    let predicted = output.argmax(1).flatten::<1>(0, 1);
    let correct: i64 = predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    correct as usize
}

/// 設定のデバイス種別に応じたバックエンドで学習を実行
pub fn run_training(config: &AppConfig) -> Result<TrainingReport> {
    match resolve_device_type(config.device_type) {
        DeviceType::Wgpu => {
            tracing::info!("GPU (WGPU) モードで学習を開始します");
            train_model::<Autodiff<Wgpu>>(config, WgpuDevice::default())
        }
        DeviceType::Cpu => {
            tracing::info!("CPU (NdArray) モードで学習を開始します");
            train_model::<Autodiff<NdArray>>(config, NdArrayDevice::Cpu)
        }
    }
}

/// モデル学習を実行
///
/// 検証損失が最良だったエポックの重みをモデルファイルに書き出し、
/// 全エポックの履歴をmetrics.jsonに書き出す。
pub fn train_model<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingReport> {
    config.validate().context("学習設定が不正です")?;
    let training = &config.training;

    let dataset_train = EmotionDataset::from_directory(&training.train_dir)?;
    let dataset_val = EmotionDataset::from_directory(&training.val_dir)?;
    if dataset_train.len() == 0 {
        anyhow::bail!("学習データが見つかりません: {}", training.train_dir.display());
    }
    if dataset_val.len() == 0 {
        anyhow::bail!("検証データが見つかりません: {}", training.val_dir.display());
    }

    tracing::info!("学習データ: {} 枚", dataset_train.len());
    tracing::info!("検証データ: {} 枚", dataset_val.len());
    for (emotion, count) in Emotion::ALL.iter().zip(dataset_train.class_counts()) {
        tracing::info!("  クラス '{}': {} 枚", emotion, count);
    }

    let model_config = ModelConfig {
        num_classes: NUM_CLASSES,
        conv_dropout: config.model.conv_dropout,
        dense_dropout: config.model.dense_dropout,
        image_size: IMAGE_SIZE,
    };
    tracing::info!(
        "モデル設定: {} クラス, 入力サイズ: {}x{}, dropout={}/{}",
        model_config.num_classes,
        IMAGE_SIZE,
        IMAGE_SIZE,
        model_config.conv_dropout,
        model_config.dense_dropout
    );
    tracing::info!("使用デバイス: {:?}", device);

    let batcher_train =
        EmotionBatcher::<B>::new(device.clone(), IMAGE_SIZE, Some(config.augmentation.clone()));
    let batcher_val = EmotionBatcher::<B::InnerBackend>::new(device.clone(), IMAGE_SIZE, None);

    let mut builder_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(training.batch_size)
        .shuffle(training.seed);
    let mut builder_val = DataLoaderBuilder::new(batcher_val).batch_size(training.batch_size);
    if training.num_workers > 0 {
        builder_train = builder_train.num_workers(training.num_workers);
        builder_val = builder_val.num_workers(training.num_workers);
    }
    let dataloader_train = builder_train.build(dataset_train);
    let dataloader_val = builder_val.build(dataset_val);

    let mut model: EmotionCnn<B> = model_config.init(&device);
    let mut optim = AdamConfig::new().init();

    let mut checkpoint: BestCheckpoint<EmotionCnn<B::InnerBackend>> =
        BestCheckpoint::new(training.early_stopping_patience);
    let mut lr_scheduler = ReduceLrOnPlateau::new(
        training.learning_rate,
        training.lr_plateau_factor,
        training.lr_plateau_patience,
        training.min_learning_rate,
    );
    let mut history = TrainingHistory::new();
    let mut stopped_early = false;

    tracing::info!(
        "学習を開始します (最大エポック数: {}, バッチサイズ: {}, 学習率: {})",
        training.num_epochs,
        training.batch_size,
        training.learning_rate
    );

    for epoch in 1..=training.num_epochs {
        let lr = lr_scheduler.lr();

        // 学習フェーズ
        let mut train_acc = Accumulator::default();
        for batch in dataloader_train.iter() {
            let item = model.forward_classification(batch.images, batch.targets);
            let loss_value: f64 = item.loss.clone().into_scalar().elem::<f64>();
            train_acc.add(loss_value, item.output, item.targets);

            let grads = item.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);
        }

        // 検証フェーズ（Dropout無効、BatchNormは移動平均）
        let model_valid = model.valid();
        let mut val_acc = Accumulator::default();
        for batch in dataloader_val.iter() {
            let item = model_valid.forward_classification(batch.images, batch.targets);
            let loss_value: f64 = item.loss.into_scalar().elem::<f64>();
            val_acc.add(loss_value, item.output, item.targets);
        }

        let metrics = EpochMetrics {
            epoch,
            loss: train_acc.mean_loss(),
            accuracy: train_acc.accuracy(),
            val_loss: val_acc.mean_loss(),
            val_accuracy: val_acc.accuracy(),
            learning_rate: lr,
        };
        history.push_epoch(&metrics);
        tracing::info!(
            "Epoch {:>3}/{} | loss={:.4} | acc={:.1}% | val_loss={:.4} | val_acc={:.1}% | lr={:.2e}",
            epoch,
            training.num_epochs,
            metrics.loss,
            metrics.accuracy * 100.0,
            metrics.val_loss,
            metrics.val_accuracy * 100.0,
            lr
        );

        let decision = checkpoint.observe(epoch, metrics.val_loss, model_valid);

        if let Some(new_lr) = lr_scheduler.update(metrics.val_loss) {
            tracing::info!("val_lossが停滞しているため学習率を {:.2e} に下げます", new_lr);
        }

        if decision == StoppingDecision::Stop {
            tracing::info!(
                "{}エポック改善がないため早期終了します",
                training.early_stopping_patience
            );
            stopped_early = true;
            break;
        }
    }

    let epochs_run = history.epochs();
    let (best_epoch, best_model) = match checkpoint.into_best() {
        Some(best) => best,
        None => (0, model.valid()),
    };
    let best_val_loss = history
        .best_val_loss()
        .map(|(_, v)| v)
        .unwrap_or(f64::NAN);
    tracing::info!(
        "エポック{}の重みを保存します (val_loss={:.4})",
        best_epoch,
        best_val_loss
    );

    let model_binary = encode_weights(best_model)?;
    let metadata = ModelMetadata::new(
        Emotion::labels(),
        IMAGE_SIZE as u32,
        epochs_run as u32,
        best_val_loss,
    );

    let model_path = config.model.model_path.clone();
    let metrics_path = config.model.metrics_path.clone();
    save_model_with_metadata(&model_path, &metadata, &model_binary)?;
    history.save(&metrics_path)?;

    tracing::info!(
        "モデルを保存しました: {} ({:.2} MB)",
        model_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    tracing::info!("学習履歴を保存しました: {}", metrics_path.display());

    Ok(TrainingReport {
        epochs_run,
        best_epoch,
        best_val_loss,
        stopped_early,
        model_path,
        metrics_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{decode_weights, InferenceEngine};
    use crate::model::{load_metadata, TrainingSettings};
    use image::{GrayImage, Luma};

    fn write_image(dir: &Path, name: &str, shade: u8) {
        std::fs::create_dir_all(dir).unwrap();
        let img = GrayImage::from_fn(48, 48, |x, y| Luma([shade.wrapping_add((x + y) as u8)]));
        img.save(dir.join(name)).unwrap();
    }

    /// 各クラス`per_class`枚ずつの小さなデータセット
    fn write_dataset(root: &Path, per_class: usize) {
        for emotion in Emotion::ALL {
            let class_dir = root.join(emotion.label().to_lowercase());
            for i in 0..per_class {
                write_image(&class_dir, &format!("{}.png", i), (emotion.index() * 30 + i) as u8);
            }
        }
    }

    #[test]
    fn test_dataset_uses_label_order_not_directory_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("surprise"), "a.png", 10);
        write_image(&dir.path().join("Neutral"), "b.jpg", 20);
        write_image(&dir.path().join("angry"), "c.png", 30);
        write_image(&dir.path().join("contempt"), "d.png", 40);
        std::fs::write(dir.path().join("angry").join("notes.txt"), "x").unwrap();

        let dataset = EmotionDataset::from_directory(dir.path()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get(0).unwrap().label, Emotion::Angry.index());
        assert_eq!(dataset.get(1).unwrap().label, Emotion::Surprise.index());
        assert_eq!(dataset.get(2).unwrap().label, Emotion::Neutral.index());

        let counts = dataset.class_counts();
        assert_eq!(counts[Emotion::Neutral.index()], 1);
        assert_eq!(counts[Emotion::Happy.index()], 0);
    }

    #[test]
    fn test_missing_dataset_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EmotionDataset::from_directory(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_batcher_fills_unreadable_images_with_zeros() {
        type B = NdArray<f32>;
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "ok.png", 255);
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not a png").unwrap();

        let batcher = EmotionBatcher::<B>::new(NdArrayDevice::Cpu, IMAGE_SIZE, None);
        let items = vec![
            EmotionItem { path: dir.path().join("ok.png"), label: 3 },
            EmotionItem { path: broken, label: 5 },
        ];
        let batch = batcher.batch(items, &NdArrayDevice::Cpu);

        assert_eq!(batch.images.dims(), [2, 1, IMAGE_SIZE, IMAGE_SIZE]);
        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        let second = &pixels[IMAGE_SIZE * IMAGE_SIZE..];
        assert!(second.iter().all(|v| *v == 0.0));
        assert_eq!(batch.targets.into_data().to_vec::<i64>().unwrap(), vec![3, 5]);
    }

    fn small_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.training = TrainingSettings {
            train_dir: root.join("dataset").join("train"),
            val_dir: root.join("dataset").join("test"),
            num_epochs: 2,
            batch_size: 4,
            num_workers: 1,
            ..TrainingSettings::default()
        };
        config.model.model_path = root.join("model").join("emotion_model.tar.gz");
        config.model.metrics_path = root.join("model").join("metrics.json");
        config
    }

    #[test]
    fn test_train_model_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_dataset(&config.training.train_dir, 2);
        write_dataset(&config.training.val_dir, 1);

        let report =
            train_model::<Autodiff<NdArray<f32>>>(&config, NdArrayDevice::Cpu).unwrap();
        assert_eq!(report.epochs_run, 2);
        assert!(!report.stopped_early);
        assert!((1..=2).contains(&report.best_epoch));

        let history = TrainingHistory::load(&config.model.metrics_path).unwrap();
        assert_eq!(history.epochs(), 2);
        assert_eq!(history.val_loss.len(), 2);
        assert_eq!(history.learning_rate[0], config.training.learning_rate);

        let metadata = load_metadata(&config.model.model_path).unwrap();
        assert_eq!(metadata.class_labels, Emotion::labels());
        assert_eq!(metadata.epochs_run, 2);

        let engine =
            InferenceEngine::<NdArray<f32>>::load(&config.model.model_path, NdArrayDevice::Cpu)
                .unwrap();
        let prediction = engine
            .classify_path(config.training.val_dir.join("happy").join("0.png"))
            .unwrap();
        assert!((0.0..=1.0).contains(&prediction.confidence));
    }

    #[test]
    fn test_saved_weights_come_from_best_validation_epoch() {
        type B = NdArray<f32>;
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.training.num_epochs = 6;
        config.training.early_stopping_patience = 1;
        config.training.learning_rate = 0.01;
        write_dataset(&config.training.train_dir, 2);
        write_dataset(&config.training.val_dir, 1);

        let report = train_model::<Autodiff<B>>(&config, NdArrayDevice::Cpu).unwrap();
        let history = TrainingHistory::load(&config.model.metrics_path).unwrap();
        assert_eq!(history.epochs(), report.epochs_run);
        if report.epochs_run < config.training.num_epochs {
            assert!(report.stopped_early);
        }
        if report.stopped_early {
            // patience=1なので停止直前のエポックが最良
            assert_eq!(report.best_epoch, report.epochs_run - 1);
        }

        let (best_epoch, best_loss) = history.best_val_loss().unwrap();
        assert_eq!(report.best_epoch, best_epoch);
        assert_eq!(report.best_val_loss, best_loss);
        assert_eq!(load_metadata(&config.model.model_path).unwrap().best_val_loss, best_loss);

        // 保存された重みで検証セットを評価し直すと最良エポックの損失になる
        let device = NdArrayDevice::Cpu;
        let binary = crate::model::load_model_binary(&config.model.model_path).unwrap();
        let model = decode_weights(ModelConfig::new(NUM_CLASSES).init::<B>(&device), binary, &device)
            .unwrap();
        let dataset = EmotionDataset::from_directory(&config.training.val_dir).unwrap();
        let items: Vec<EmotionItem> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();
        let batch = EmotionBatcher::<B>::new(device.clone(), IMAGE_SIZE, None).batch(items, &device);
        let loss: f64 = model
            .forward_classification(batch.images, batch.targets)
            .loss
            .into_scalar()
            .elem::<f64>();
        assert!((loss - best_loss).abs() < 1e-4, "{} vs {}", loss, best_loss);
    }

    #[test]
    fn test_dataset_accepts_other_image_formats() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("sad"), "a.bmp", 10);
        write_image(&dir.path().join("sad"), "b.tiff", 20);
        write_image(&dir.path().join("sad"), "c.png", 30);

        let dataset = EmotionDataset::from_directory(dir.path()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.class_counts()[Emotion::Sad.index()], 3);

        let batcher = EmotionBatcher::<NdArray<f32>>::new(NdArrayDevice::Cpu, IMAGE_SIZE, None);
        let item = dataset.get(0).unwrap();
        assert!(batcher.load_pixels(&item.path).is_ok());
    }

    #[test]
    fn test_train_model_rejects_invalid_dropout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.model.dense_dropout = 1.5;
        write_dataset(&config.training.train_dir, 1);
        write_dataset(&config.training.val_dir, 1);

        let err = train_model::<Autodiff<NdArray<f32>>>(&config, NdArrayDevice::Cpu).unwrap_err();
        assert!(format!("{:#}", err).contains("dense_dropout"));
    }

    #[test]
    fn test_train_model_requires_validation_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_dataset(&config.training.train_dir, 1);
        std::fs::create_dir_all(&config.training.val_dir).unwrap();

        let err = train_model::<Autodiff<NdArray<f32>>>(&config, NdArrayDevice::Cpu).unwrap_err();
        assert!(err.to_string().contains("検証データ"));
        assert!(!config.model.model_path.exists());
    }
}
