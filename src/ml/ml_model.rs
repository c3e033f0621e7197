//! 機械学習モデルの共通定義
//!
//! 表情分類用のCNNモデルと、学習・推論で共有する画像前処理を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
        PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use image::{imageops::FilterType, DynamicImage, GrayImage};

use crate::ml::backend::catch_backend_panic;

pub use crate::types::NUM_CLASSES;

/// 画像サイズ
pub const IMAGE_SIZE: usize = 48;

/// 畳み込みブロックごとのチャネル数
const BLOCK_CHANNELS: [usize; 3] = [64, 128, 256];

/// 全結合層のユニット数
const DENSE_UNITS: [usize; 2] = [512, 256];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 畳み込みブロック後のドロップアウト率
    #[config(default = 0.25)]
    pub conv_dropout: f64,
    /// 全結合層後のドロップアウト率
    #[config(default = 0.5)]
    pub dense_dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 48)]
    pub image_size: usize,
}

impl ModelConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmotionCnn<B> {
        // 2x2プーリングを3回通すので1/8になる
        let feature_map_size = self.image_size / 8;
        if feature_map_size == 0 {
            panic!("入力サイズが小さすぎます: {} (最小8x8が必要)", self.image_size);
        }

        let [c1, c2, c3] = BLOCK_CHANNELS;
        let d = c3 * feature_map_size * feature_map_size;

        tracing::debug!("[Model] 入力サイズ: 1 x {}x{}", self.image_size, self.image_size);
        tracing::debug!("[Model] Block3後: {} x {}x{}", c3, feature_map_size, feature_map_size);
        tracing::debug!("[Model] Flatten後の特徴次元 d: {}", d);

        let [u1, u2] = DENSE_UNITS;

        EmotionCnn {
            block1: ConvBlock::new(1, c1, self.conv_dropout, device),
            block2: ConvBlock::new(c1, c2, self.conv_dropout, device),
            block3: ConvBlock::new(c2, c3, self.conv_dropout, device),

            fc1: LinearConfig::new(d, u1).init(device),
            norm1: BatchNormConfig::new(u1).init(device),
            fc2: LinearConfig::new(u1, u2).init(device),
            norm2: BatchNormConfig::new(u2).init(device),
            dropout: DropoutConfig::new(self.dense_dropout).init(),
            output: LinearConfig::new(u2, self.num_classes).init(device),

            activation: Relu::new(),
        }
    }
}

/// 畳み込みブロック
///
/// {Conv 3x3 (same) + ReLU + BatchNorm} x 2 -> MaxPool 2x2 -> Dropout
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm1: BatchNormConfig::new(out_channels).init(device),
            conv2: Conv2dConfig::new([out_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm2: BatchNormConfig::new(out_channels).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(dropout).init(),
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.conv1.forward(x));
        let x = self.norm1.forward(x);
        let x = self.activation.forward(self.conv2.forward(x));
        let x = self.norm2.forward(x);
        let x = self.pool.forward(x);
        self.dropout.forward(x)
    }
}

/// 表情分類用CNNモデル
///
/// 48x48のグレースケール画像を7クラスに分類します。
///
/// # アーキテクチャ
/// - ConvBlock x 3（チャネル 64 -> 128 -> 256、サイズ 48 -> 24 -> 12 -> 6）
/// - Flatten (256 * 6 * 6 = 9216)
/// - FC: 9216 -> 512 + ReLU + BatchNorm + Dropout
/// - FC: 512 -> 256 + ReLU + BatchNorm + Dropout
/// - FC: 256 -> num_classes
/// - Softmax (分類時)
///
/// Dropoutは自動微分バックエンドでのみ有効になり、BatchNormも推論時は
/// 移動平均を使うため、`valid()`したモデルはそのまま推論に使えます。
#[derive(Module, Debug)]
pub struct EmotionCnn<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,

    // 全結合層
    fc1: Linear<B>,
    norm1: BatchNorm<B>,
    fc2: Linear<B>,
    norm2: BatchNorm<B>,
    dropout: Dropout,
    output: Linear<B>,

    activation: Relu,
}

impl<B: Backend> EmotionCnn<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = dense_norm(&self.norm1, x);
        let x = self.dropout.forward(x);

        let x = self.activation.forward(self.fc2.forward(x));
        let x = dense_norm(&self.norm2, x);
        let x = self.dropout.forward(x);

        self.output.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, size, size]
    /// - `targets`: ターゲットラベル [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 重みをf32精度のバイナリにする（model.binの中身）
pub fn encode_weights<B: Backend>(model: EmotionCnn<B>) -> anyhow::Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::record(&recorder, model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// バイナリから重みを復元
pub fn decode_weights<B: Backend>(
    model: EmotionCnn<B>,
    binary: Vec<u8>,
    device: &B::Device,
) -> anyhow::Result<EmotionCnn<B>> {
    // 壊れたバイト列ではレコーダーがパニックするため捕捉する
    catch_backend_panic("モデル重みが壊れています", move || {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        <BinBytesRecorder<FullPrecisionSettings> as Recorder<B>>::load(&recorder, binary, device)
            .map(|record| model.load_record(record))
    })?
    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))
}

/// [batch, features] にBatchNormを掛ける（長さ1の系列として扱う）
fn dense_norm<B: Backend>(norm: &BatchNorm<B>, x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch_size, features] = x.dims();
    norm.forward(x.reshape([batch_size, features, 1]))
        .reshape([batch_size, features])
}

/// グレースケール化して`size`x`size`にリサイズ
pub fn to_model_input(img: &DynamicImage, size: usize) -> GrayImage {
    let gray = img.to_luma8();
    let size = size as u32;
    if gray.dimensions() == (size, size) {
        gray
    } else {
        image::imageops::resize(&gray, size, size, FilterType::Triangle)
    }
}

/// 画素値を[0,1]に正規化して平坦化 (H, W)
pub fn normalize_gray(img: &GrayImage) -> Vec<f32> {
    img.pixels().map(|p| p[0] as f32 / 255.0).collect()
}

/// 画像を前処理（グレースケール -> リサイズ -> [0,1]）
pub fn preprocess_image(img: &DynamicImage, size: usize) -> Vec<f32> {
    normalize_gray(&to_model_input(img, size))
}

/// アップロードされたバイト列を画像としてデコード
pub fn decode_image(bytes: &[u8]) -> anyhow::Result<DynamicImage> {
    if bytes.is_empty() {
        anyhow::bail!("画像データが空です");
    }
    Ok(image::load_from_memory(bytes)?)
}

/// 画像ファイルを読み込んで正規化
pub fn load_and_normalize_image(path: &std::path::Path, size: usize) -> anyhow::Result<Vec<f32>> {
    let img = image::open(path)?;
    Ok(preprocess_image(&img, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{ImageBuffer, Luma, Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_preprocess_shape_and_range() {
        let img: RgbImage = ImageBuffer::from_fn(100, 60, |x, y| {
            Rgb([(x * 2) as u8, (y * 4) as u8, 255])
        });
        let data = preprocess_image(&DynamicImage::ImageRgb8(img), IMAGE_SIZE);

        assert_eq!(data.len(), IMAGE_SIZE * IMAGE_SIZE);
        assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_preprocess_keeps_exact_size_pixels() {
        let img: GrayImage = ImageBuffer::from_fn(48, 48, |x, _| Luma([if x < 24 { 0 } else { 255 }]));
        let data = preprocess_image(&DynamicImage::ImageLuma8(img), IMAGE_SIZE);

        assert_eq!(data[0], 0.0);
        assert_eq!(data[47], 1.0);
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(decode_image(&[]).is_err());
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn test_load_and_normalize_image_matches_preprocess() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        let img: GrayImage = ImageBuffer::from_fn(64, 64, |x, y| Luma([((x + y) * 2) as u8]));
        img.save(&path).unwrap();

        let from_disk = load_and_normalize_image(&path, IMAGE_SIZE).unwrap();
        let in_memory = preprocess_image(&DynamicImage::ImageLuma8(img), IMAGE_SIZE);
        assert_eq!(from_disk, in_memory);

        assert!(load_and_normalize_image(&dir.path().join("absent.png"), IMAGE_SIZE).is_err());
    }

    #[test]
    fn test_forward_output_shape() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(NUM_CLASSES).init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 1, IMAGE_SIZE, IMAGE_SIZE], &device);
        let output = model.forward(images.clone());
        assert_eq!(output.dims(), [2, NUM_CLASSES]);

        let probs = model
            .predict_proba(images)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let row_sum: f32 = probs[..NUM_CLASSES].iter().sum();
        assert!((row_sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_weights_round_trip_preserves_output() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(NUM_CLASSES).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 1, IMAGE_SIZE, IMAGE_SIZE], &device);
        let expected = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();

        let binary = encode_weights(model).unwrap();
        let fresh = ModelConfig::new(NUM_CLASSES).init::<TestBackend>(&device);
        let restored = decode_weights(fresh, binary, &device).unwrap();
        let actual = restored.forward(images).into_data().to_vec::<f32>().unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_decode_weights_rejects_garbage() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(NUM_CLASSES).init::<TestBackend>(&device);
        assert!(decode_weights(model, vec![0u8; 16], &device).is_err());
    }
}
