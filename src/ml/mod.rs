pub mod backend;
pub mod ml_model;
pub mod augmentation;
pub mod callbacks;
pub mod training;
pub mod inference;

pub use ml_model::{EmotionCnn, ModelConfig, NUM_CLASSES, IMAGE_SIZE, decode_image, decode_weights, encode_weights, load_and_normalize_image, normalize_gray, preprocess_image, to_model_input};
pub use training::{EmotionDataset, TrainingReport, run_training, train_model};
pub use inference::{EmotionClassifier, InferenceEngine};
pub use backend::{catch_backend_panic, resolve_device_type, wgpu_available};
