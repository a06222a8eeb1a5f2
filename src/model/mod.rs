pub mod config;
pub mod gguf;
pub mod loader;
pub mod weights;

pub use config::ModelConfig;
pub use loader::{LoadOptions, LoadProgress, load_model};
pub use weights::WeightStore;
