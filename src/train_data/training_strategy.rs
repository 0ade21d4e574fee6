use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{
    build_optimizer, checkpoint, CapNet, Metrics, ModelError, Optimizer, TrainingConfig,
    TrainingHistory,
};
use crate::train_data::data_loader::{DataError, DataLoader, MnistDataset};
use crate::train_data::one_hot::one_hot;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Data(#[from] DataError),
}

/// Résultat d'un passage sur le jeu de test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub loss: f32,
    pub correct: usize,
    pub total: usize,
}

impl EvalReport {
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }
}

/// Boucle d'entraînement: alterne époque d'entraînement et évaluation, puis sauvegarde
pub struct TrainingStrategy {
    pub config: TrainingConfig,
    pub output_path: PathBuf,
}

impl TrainingStrategy {
    pub fn new(config: TrainingConfig, output_path: PathBuf) -> Self {
        Self {
            config,
            output_path,
        }
    }

    pub fn run(
        &self,
        model: &mut CapNet,
        train: &MnistDataset,
        test: &MnistDataset,
    ) -> Result<TrainingHistory, TrainingError> {
        self.config.validate()?;
        if train.is_empty() && self.config.num_epochs > 0 {
            return Err(DataError::EmptySplit("entraînement").into());
        }
        let mut optimizer =
            build_optimizer(&self.config.optimizer_type, self.config.learning_rate);
        info!(
            optimizer = optimizer.name(),
            lr = optimizer.get_lr(),
            epochs = self.config.num_epochs,
            batch_size = self.config.batch_size,
            "🎯 début de l'entraînement"
        );

        let mut train_loader =
            DataLoader::new(train, self.config.batch_size, true, self.config.seed);
        let mut test_loader = DataLoader::new(
            test,
            self.config.test_batch_size,
            true,
            self.config.seed.wrapping_add(1),
        );

        let mut history = TrainingHistory::default();
        for epoch in 1..=self.config.num_epochs {
            let start = Instant::now();
            let train_loss =
                self.train_epoch(model, &mut train_loader, optimizer.as_mut(), epoch)?;
            let report = self.test(model, &mut test_loader)?;

            model.state.epochs_completed += 1;
            history.update(train_loss, report.loss, report.accuracy());
            debug!(epoch, elapsed = ?start.elapsed(), train_loss, "époque terminée");
        }

        checkpoint::save(model, &self.output_path)?;
        Ok(history)
    }

    /// Une époque complète, renvoie la perte moyenne
    pub fn train_epoch(
        &self,
        model: &mut CapNet,
        loader: &mut DataLoader<'_>,
        optimizer: &mut dyn Optimizer,
        epoch: usize,
    ) -> Result<f32, TrainingError> {
        let num_batches = loader.len();
        let dataset_len = loader.dataset_len();
        let num_classes = model.num_classes();
        let mut total_loss = 0.0;

        for (batch_idx, batch) in loader.iter().enumerate() {
            let targets = one_hot(&batch.labels, num_classes)?;
            let loss = model.train_step(&batch.images.view(), &targets.view(), optimizer)?;
            total_loss += loss * batch.labels.len() as f32;

            if batch_idx % self.config.log_interval == 0 {
                info!(
                    "{}",
                    train_log_line(
                        epoch,
                        batch_idx,
                        batch.labels.len(),
                        dataset_len,
                        num_batches,
                        loss
                    )
                );
            }
        }

        Ok(if dataset_len > 0 {
            total_loss / dataset_len as f32
        } else {
            0.0
        })
    }

    /// Évaluation en inférence: perte MSE moyenne et précision.
    ///
    /// La perte est la moyenne par élément sur tout le jeu de test (moyennes de
    /// batch pondérées par leur taille). Elle vaut `test_batch_size` fois la somme
    /// des moyennes de batch divisée par la taille du jeu, soit 10× cette
    /// dernière avec la taille de batch par défaut.
    pub fn test(
        &self,
        model: &CapNet,
        loader: &mut DataLoader<'_>,
    ) -> Result<EvalReport, TrainingError> {
        let dataset_len = loader.dataset_len();
        let num_classes = model.num_classes();
        let mut total_loss = 0.0;
        let mut correct = 0;

        for batch in loader.iter() {
            let targets = one_hot(&batch.labels, num_classes)?;
            let (loss, outputs) = model.evaluate_batch(&batch.images.view(), &targets.view())?;

            total_loss += loss * batch.labels.len() as f32;
            correct += Metrics::compute(&outputs.view(), &batch.labels).correct;
        }

        let report = EvalReport {
            loss: if dataset_len > 0 {
                total_loss / dataset_len as f32
            } else {
                0.0
            },
            correct,
            total: dataset_len,
        };

        info!("{}", test_loss_line(report.loss));
        info!(
            "Test Accuracy: {}/{} ({:.2}%)",
            report.correct,
            report.total,
            100.0 * report.accuracy()
        );
        Ok(report)
    }
}

/// `Train Epoch: 3 [20/60000 (0%)]\tLoss: 0.089999`
pub fn train_log_line(
    epoch: usize,
    batch_idx: usize,
    batch_len: usize,
    dataset_len: usize,
    num_batches: usize,
    loss: f32,
) -> String {
    format!(
        "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
        epoch,
        batch_idx * batch_len,
        dataset_len,
        100.0 * batch_idx as f32 / num_batches.max(1) as f32,
        loss
    )
}

pub fn test_loss_line(loss: f32) -> String {
    format!("Test Loss: {loss:.6}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, NetworkConfig};
    use ndarray::Array4;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model() -> CapNet {
        ModelBuilder::new()
            .with_network_config(NetworkConfig::tiny(10))
            .with_seed(3)
            .build()
            .unwrap()
    }

    fn synthetic(n: usize, seed: u64) -> MnistDataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Uniform::new(-0.5, 2.5).unwrap();
        let images = Array4::random_using((n, 1, 8, 8), dist, &mut rng);
        MnistDataset::from_parts(images, (0..n).map(|i| (i % 10) as u8).collect()).unwrap()
    }

    fn strategy(dir: &tempfile::TempDir, num_epochs: usize) -> TrainingStrategy {
        TrainingStrategy::new(
            TrainingConfig {
                batch_size: 5,
                num_epochs,
                ..TrainingConfig::default()
            },
            dir.path().join("capsnet.safetensors"),
        )
    }

    #[test]
    fn test_zero_epochs_still_saves() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(&dir, 0);
        let mut model = tiny_model();
        let before: Vec<Array4<f32>> = model
            .named_parameters()
            .into_iter()
            .map(|(_, p)| p.clone())
            .collect();

        let history = strategy
            .run(&mut model, &synthetic(6, 0), &synthetic(4, 1))
            .unwrap();

        assert_eq!(history.epochs(), 0);
        assert_eq!(model.state.optimizer_steps, 0);
        assert!(strategy.output_path.exists());
        for ((_, after), before) in model.named_parameters().into_iter().zip(&before) {
            assert_eq!(after, before);
        }
    }

    #[test]
    fn test_one_epoch_steps_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(&dir, 1);
        let mut model = tiny_model();

        let history = strategy
            .run(&mut model, &synthetic(12, 2), &synthetic(10, 3))
            .unwrap();

        // 12 exemples en batches de 5: 5 + 5 + 2
        assert_eq!(model.state.optimizer_steps, 3);
        assert_eq!(model.state.epochs_completed, 1);
        assert_eq!(history.epochs(), 1);
        assert!(history.train_loss[0].is_finite());
        assert!((0.0..=1.0).contains(&history.test_accuracy[0]));
    }

    #[test]
    fn test_loss_with_batch_of_ten() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(&dir, 1);
        let model = tiny_model();
        let test_set = synthetic(10, 4);
        let mut loader = DataLoader::new(&test_set, 10, true, 0);

        let report = strategy.test(&model, &mut loader).unwrap();

        assert!(report.loss.is_finite());
        assert!(report.loss >= 0.0);
        assert_eq!(report.total, 10);
        assert!(report.correct <= 10);
        assert_eq!(model.state.optimizer_steps, 0);
    }

    #[test]
    fn test_loss_is_weighted_by_batch_length() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(&dir, 1);
        let model = tiny_model();
        let test_set = synthetic(7, 5);

        let whole = strategy
            .test(&model, &mut DataLoader::new(&test_set, 7, false, 0))
            .unwrap();
        let split = strategy
            .test(&model, &mut DataLoader::new(&test_set, 3, false, 0))
            .unwrap();

        approx::assert_abs_diff_eq!(whole.loss, split.loss, epsilon = 1e-5);
        assert_eq!(whole.correct, split.correct);
    }

    #[test]
    fn test_empty_test_set() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(&dir, 1);
        let model = tiny_model();
        let empty = MnistDataset::from_parts(Array4::zeros((0, 1, 8, 8)), Vec::new()).unwrap();

        let report = strategy
            .test(&model, &mut DataLoader::new(&empty, 10, false, 0))
            .unwrap();

        assert_eq!(report.loss, 0.0);
        assert_eq!(report.accuracy(), 0.0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = strategy(&dir, 1);
        strategy.config.batch_size = 0;

        assert!(matches!(
            strategy.run(&mut tiny_model(), &synthetic(2, 6), &synthetic(2, 7)),
            Err(TrainingError::Model(ModelError::InvalidConfig(_)))
        ));
        assert!(!strategy.output_path.exists());
    }

    #[test]
    fn test_loss_is_batch_size_times_mean_sum() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(&dir, 1);
        let model = tiny_model();
        let test_set = synthetic(20, 9);

        let report = strategy
            .test(&model, &mut DataLoader::new(&test_set, 10, false, 0))
            .unwrap();

        let mut sum_of_means = 0.0;
        for start in [0, 10] {
            let batch = test_set.batch(&(start..start + 10).collect::<Vec<_>>());
            let targets = one_hot(&batch.labels, 10).unwrap();
            let (loss, _) = model
                .evaluate_batch(&batch.images.view(), &targets.view())
                .unwrap();
            sum_of_means += loss;
        }

        approx::assert_relative_eq!(
            report.loss,
            10.0 * sum_of_means / 20.0,
            max_relative = 1e-5
        );
    }

    #[test]
    fn test_train_log_line_format() {
        assert_eq!(
            train_log_line(2, 10, 10, 60000, 6000, 0.0901234),
            "Train Epoch: 2 [100/60000 (0%)]\tLoss: 0.090123"
        );
        assert_eq!(
            train_log_line(1, 3, 5, 20, 4, 1.5),
            "Train Epoch: 1 [15/20 (75%)]\tLoss: 1.500000"
        );
        assert_eq!(
            train_log_line(1, 0, 10, 60000, 6000, 0.25),
            "Train Epoch: 1 [0/60000 (0%)]\tLoss: 0.250000"
        );
    }

    #[test]
    fn test_loss_line_format() {
        assert_eq!(test_loss_line(0.0960748), "Test Loss: 0.096075");
        assert_eq!(test_loss_line(0.0), "Test Loss: 0.000000");
    }

    #[test]
    fn test_empty_train_split_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(&dir, 1);
        let empty = MnistDataset::from_parts(Array4::zeros((0, 1, 8, 8)), Vec::new()).unwrap();

        assert!(matches!(
            strategy.run(&mut tiny_model(), &empty, &synthetic(2, 8)),
            Err(TrainingError::Data(DataError::EmptySplit(_)))
        ));
    }
}
