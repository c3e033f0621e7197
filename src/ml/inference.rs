//! モデル推論機能

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;

use crate::ml::{
    decode_image, decode_weights, load_and_normalize_image, preprocess_image, EmotionCnn,
    ModelConfig,
};
use crate::model::{load_model_with_metadata, log_metadata_info, InferenceConfig};
use crate::types::Prediction;

/// HTTP層から見た分類器
pub trait EmotionClassifier: Send + Sync {
    /// アップロードされた画像バイト列を分類
    fn classify_bytes(&self, bytes: &[u8]) -> Result<Prediction>;
}

/// 推論エンジン
///
/// モデルは起動時に1回だけ読み込み、以降は変更しない。burnのモジュールは
/// `Sync`が保証されないため、順伝播はMutexで直列化する。
pub struct InferenceEngine<B: Backend> {
    model: Mutex<EmotionCnn<B>>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (metadata, model_binary) = load_model_with_metadata(model_path)
            .context(format!("モデルファイルを読み込めません: {}", model_path.display()))?;
        log_metadata_info(&metadata);

        // ラベル順と入力形状の検証
        let config = InferenceConfig::from_metadata(&metadata)?;

        let model_config = ModelConfig::new(config.num_classes())
            .with_image_size(config.model_input_size);
        let model = decode_weights(model_config.init::<B>(&device), model_binary, &device)?;

        Ok(Self {
            model: Mutex::new(model),
            config,
            device,
        })
    }

    /// 単一画像を分類
    pub fn classify(&self, image: &DynamicImage) -> Result<Prediction> {
        let image_data = preprocess_image(image, self.config.model_input_size);
        self.classify_pixels(&image_data)
    }

    /// 画像ファイルを分類
    pub fn classify_path<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let image_data =
            load_and_normalize_image(image_path.as_ref(), self.config.model_input_size)?;
        self.classify_pixels(&image_data)
    }

    /// 前処理済みの画素列（size*size, [0,1]）を分類
    fn classify_pixels(&self, image_data: &[f32]) -> Result<Prediction> {
        let size = self.config.model_input_size;
        if image_data.len() != size * size {
            anyhow::bail!("入力画素数が不正です: {} (期待: {})", image_data.len(), size * size);
        }

        // Tensorに変換 [1, 1, size, size]
        let tensor = Tensor::<B, 1>::from_floats(image_data, &self.device)
            .reshape([1, 1, size, size]);

        let probabilities = {
            // 重みは読み込み後に変更しないので、ポイズン状態でもそのまま使える
            let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
            model.predict_proba(tensor)
        };
        let probabilities = probabilities
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        let (class_idx, confidence) = arg_max(&probabilities)?;
        let emotion = self
            .config
            .class_index_to_emotion(class_idx)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_idx))?;

        Ok(Prediction {
            emotion,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

impl<B: Backend> EmotionClassifier for InferenceEngine<B> {
    fn classify_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let image = decode_image(bytes)?;
        self.classify(&image)
    }
}

/// 最大値のインデックスと値（同値なら先頭）
fn arg_max(values: &[f32]) -> Result<(usize, f32)> {
    if values.iter().any(|v| !v.is_finite()) {
        anyhow::bail!("モデル出力に有限でない値が含まれています");
    }
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .ok_or_else(|| anyhow::anyhow!("モデル出力が空です"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{encode_weights, IMAGE_SIZE};
    use crate::model::{save_model_with_metadata, ModelMetadata};
    use crate::types::{Emotion, NUM_CLASSES};
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;
    use std::path::PathBuf;

    type TestBackend = NdArray<f32>;

    fn write_untrained_model(dir: &Path, labels: Vec<String>) -> PathBuf {
        let model = ModelConfig::new(NUM_CLASSES).init::<TestBackend>(&NdArrayDevice::Cpu);
        let binary = encode_weights(model).unwrap();
        let path = dir.join("emotion_model.tar.gz");
        save_model_with_metadata(&path, &ModelMetadata::new(labels, 48, 1, 1.9), &binary).unwrap();
        path
    }

    fn face_png() -> Vec<u8> {
        let img = GrayImage::from_fn(64, 64, |x, y| Luma([((x * 3 + y * 2) % 256) as u8]));
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_arg_max_first_max_wins() {
        assert_eq!(arg_max(&[0.1, 0.4, 0.4, 0.1]).unwrap(), (1, 0.4));
        assert!(arg_max(&[]).is_err());
        assert!(arg_max(&[0.5, f32::NAN]).is_err());
    }

    #[test]
    fn test_classify_bytes_returns_known_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_untrained_model(dir.path(), Emotion::labels());
        let engine = InferenceEngine::<TestBackend>::load(&path, NdArrayDevice::Cpu).unwrap();
        assert_eq!(engine.config().model_input_size, IMAGE_SIZE);

        let bytes = face_png();
        let first = engine.classify_bytes(&bytes).unwrap();
        assert!(Emotion::ALL.contains(&first.emotion));
        assert!((0.0..=1.0).contains(&first.confidence));
        // 7クラスのsoftmaxなので最大値は1/7以上
        assert!(first.confidence >= 1.0 / NUM_CLASSES as f32 - 1e-6);

        // 同じモデル・同じ入力なら同じ結果
        let second = engine.classify_bytes(&bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_label_mapping_follows_metadata_order() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = write_untrained_model(dir.path(), Emotion::labels());
        let engine = InferenceEngine::<TestBackend>::load(&canonical, NdArrayDevice::Cpu).unwrap();
        let prediction = engine.classify_bytes(&face_png()).unwrap();

        // 同じ重みでラベル順だけ逆にしたモデル
        let reversed_dir = tempfile::tempdir().unwrap();
        let binary = crate::model::load_model_binary(&canonical).unwrap();
        let mut reversed = Emotion::labels();
        reversed.reverse();
        let reversed_path = reversed_dir.path().join("reversed.tar.gz");
        save_model_with_metadata(&reversed_path, &ModelMetadata::new(reversed, 48, 1, 1.9), &binary)
            .unwrap();
        let engine = InferenceEngine::<TestBackend>::load(&reversed_path, NdArrayDevice::Cpu).unwrap();
        let reversed_prediction = engine.classify_bytes(&face_png()).unwrap();

        assert_eq!(
            reversed_prediction.emotion.index(),
            NUM_CLASSES - 1 - prediction.emotion.index()
        );
        assert_eq!(reversed_prediction.confidence, prediction.confidence);
    }

    #[test]
    fn test_classify_after_panicked_holder_of_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_untrained_model(dir.path(), Emotion::labels());
        let engine = InferenceEngine::<TestBackend>::load(&path, NdArrayDevice::Cpu).unwrap();
        let before = engine.classify_bytes(&face_png()).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = engine.model.lock().unwrap();
            panic!("forward pass failed");
        }));
        assert!(result.is_err());
        assert!(engine.model.is_poisoned());

        let after = engine.classify_bytes(&face_png()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_load_rejects_bad_label_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut labels = Emotion::labels();
        labels[3] = "Contempt".to_string();
        let path = write_untrained_model(dir.path(), labels);

        assert!(InferenceEngine::<TestBackend>::load(&path, NdArrayDevice::Cpu).is_err());
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            InferenceEngine::<TestBackend>::load(dir.path().join("absent.tar.gz"), NdArrayDevice::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn test_classify_bytes_rejects_undecodable_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_untrained_model(dir.path(), Emotion::labels());
        let engine = InferenceEngine::<TestBackend>::load(&path, NdArrayDevice::Cpu).unwrap();

        assert!(engine.classify_bytes(b"GIF89a broken").is_err());
        assert!(engine.classify_bytes(&[]).is_err());
    }
}
