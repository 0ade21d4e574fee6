mod cli;
mod model;
mod train_data;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Args;
use model::{checkpoint, ModelBuilder, NetworkConfig};
use train_data::{MnistDataset, Split, TrainingStrategy};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let training_config = args.training_config();
    training_config
        .validate()
        .context("hyperparamètres invalides")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🚀 CAPSNET - MNIST");

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("configuration du pool rayon")?;
    }
    if !args.no_cuda {
        warn!("aucun backend CUDA disponible, calcul sur CPU");
    }

    // Données
    MnistDataset::download(&args.data_dir).context("téléchargement de MNIST")?;
    let train = MnistDataset::load(&args.data_dir, Split::Train)
        .context("chargement du jeu d'entraînement")?;
    let test =
        MnistDataset::load(&args.data_dir, Split::Test).context("chargement du jeu de test")?;

    // Modèle
    let mut model = ModelBuilder::new()
        .with_network_config(NetworkConfig::default())
        .with_seed(args.seed)
        .build()
        .context("construction du modèle")?;

    if let Some(weights) = &args.weights {
        checkpoint::load_into(&mut model, weights)
            .with_context(|| format!("chargement de {}", weights.display()))?;
    }
    model.diagnostic()?;

    // Entraînement
    let strategy = TrainingStrategy::new(training_config, args.output.clone());
    let history = strategy
        .run(&mut model, &train, &test)
        .context("entraînement")?;

    info!(
        epochs = history.epochs(),
        steps = model.state.optimizer_steps,
        final_accuracy = history.test_accuracy.last().copied(),
        output = %args.output.display(),
        "🎉 entraînement terminé"
    );
    Ok(())
}
