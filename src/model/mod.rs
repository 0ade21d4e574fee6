pub mod config;
pub mod error;
pub mod layers;
pub mod capsule;
pub mod routing;
pub mod optimizer;
pub mod loss;
pub mod builder;
pub mod core;
pub mod checkpoint;

// Réexportations principales
pub use config::{NetworkConfig, OptimizerType, TrainingConfig};
pub use core::{CapNet, TrainingHistory};
pub use builder::ModelBuilder;
pub use error::ModelError;
pub use optimizer::{build_optimizer, Optimizer};
pub use loss::Metrics;
