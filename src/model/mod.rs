pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod training_history;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{save_model_with_metadata, load_metadata, load_model_binary, load_model_with_metadata, log_metadata_info};
pub use inference_config::InferenceConfig;
pub use training_history::{EpochMetrics, TrainingHistory};
pub use config::{AppConfig, AugmentationSettings, DeviceType, ModelSettings, ServerSettings, TrainingSettings};
