use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::model::{OptimizerType, TrainingConfig};

/// Entraînement d'un réseau de capsules sur MNIST
#[derive(Debug, Parser)]
#[command(name = "mnist-capsnet", version, about)]
pub struct Args {
    /// Taille des batches d'entraînement
    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,

    /// Taille des batches de test
    #[arg(long, default_value_t = 10)]
    pub test_batch_size: usize,

    /// Nombre d'époques
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    /// Taux d'apprentissage
    #[arg(long, default_value_t = 0.01)]
    pub lr: f32,

    /// Momentum (optimiseur sgd)
    #[arg(long, default_value_t = 0.5)]
    pub momentum: f32,

    /// Désactive CUDA (cette version calcule toujours sur CPU)
    #[arg(long)]
    pub no_cuda: bool,

    /// Graine aléatoire
    #[arg(long, default_value_t = 1337)]
    pub seed: u64,

    /// Nombre de batches entre deux logs d'entraînement
    #[arg(long, default_value_t = 10)]
    pub log_interval: usize,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    pub optimizer: OptimizerKind,

    /// Répertoire des fichiers IDX
    #[arg(long, default_value = "./data/mnist")]
    pub data_dir: PathBuf,

    /// Fichier de paramètres écrit en fin d'entraînement
    #[arg(long, default_value = "./mnist_capsules.safetensors")]
    pub output: PathBuf,

    /// Paramètres initiaux (fichier safetensors)
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Threads rayon (défaut: un par cœur)
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl Args {
    pub fn training_config(&self) -> TrainingConfig {
        let optimizer_type = match self.optimizer {
            OptimizerKind::Adam => OptimizerType::adam(),
            OptimizerKind::Sgd => OptimizerType::SGD {
                momentum: self.momentum,
            },
        };

        TrainingConfig {
            batch_size: self.batch_size,
            test_batch_size: self.test_batch_size,
            learning_rate: self.lr,
            num_epochs: self.epochs,
            seed: self.seed,
            log_interval: self.log_interval,
            optimizer_type,
        }
    }
}
