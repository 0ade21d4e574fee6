pub mod data_loader;
pub mod one_hot;
pub mod training_strategy;

pub use data_loader::{MnistDataset, Split};
pub use training_strategy::TrainingStrategy;
