use ndarray::{Array2, Array4, ArrayView2, ArrayView4};
use tracing::info;

use super::{
    capsule::{capsule_lengths, capsule_lengths_gradient},
    config::NetworkConfig,
    error::ModelError,
    layers::{Layer, Param},
    loss::{LossFunction, MseLoss},
    optimizer::Optimizer,
};

/// Modèle CapsNet principal
pub struct CapNet {
    pub network_config: NetworkConfig,
    pub layers: Vec<Box<dyn Layer>>,
    pub state: ModelState,
    pub loss_fn: MseLoss,
    capsule_cache: Option<Array4<f32>>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub train_loss: Vec<f32>,
    pub test_loss: Vec<f32>,
    pub test_accuracy: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelState {
    pub optimizer_steps: usize,
    pub epochs_completed: usize,
}

impl CapNet {
    pub fn new(network_config: NetworkConfig, layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            network_config,
            layers,
            state: ModelState::default(),
            loss_fn: MseLoss,
            capsule_cache: None,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.network_config.num_classes()
    }

    /// Forward pass en entraînement: renvoie la longueur des capsules de classe
    pub fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
        let mut output = input.to_owned();

        for layer in &mut self.layers {
            output = layer.forward(&output.view())?;
        }

        let lengths = capsule_lengths(&output.view())?;
        self.capsule_cache = Some(output);
        Ok(lengths)
    }

    /// Forward pass sans cache ni gradient
    pub fn infer(&self, input: &ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
        let mut output = input.to_owned();

        for layer in &self.layers {
            output = layer.infer(&output.view())?;
        }

        capsule_lengths(&output.view())
    }

    /// Backward pass depuis le gradient de la sortie (batch, classes)
    pub fn backward(&mut self, grad_output: &ArrayView2<f32>) -> Result<(), ModelError> {
        let capsules = self
            .capsule_cache
            .take()
            .ok_or(ModelError::MissingCache("capnet"))?;

        // Backprop à travers toutes les couches en ordre inverse
        let mut grad = capsule_lengths_gradient(&capsules.view(), grad_output);
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad.view())?;
        }

        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }

    /// Mise à jour des poids
    pub fn update_weights(&mut self, optimizer: &mut dyn Optimizer) {
        for (param_id, param) in self.named_parameters_mut() {
            let Param { value, grad } = param;
            optimizer.step(&param_id, value, grad);
        }
        self.state.optimizer_steps += 1;
    }

    /// Une étape d'entraînement sur un batch, renvoie la perte
    pub fn train_step(
        &mut self,
        images: &ArrayView4<f32>,
        targets: &ArrayView2<f32>,
        optimizer: &mut dyn Optimizer,
    ) -> Result<f32, ModelError> {
        self.zero_grad();

        let output = self.forward(images)?;
        check_targets(&output, targets)?;

        let loss = self.loss_fn.compute(&output.view(), targets);
        let grad_loss = self.loss_fn.gradient(&output.view(), targets);

        self.backward(&grad_loss.view())?;
        self.update_weights(optimizer);

        Ok(loss)
    }

    /// Perte et sorties d'un batch en inférence
    pub fn evaluate_batch(
        &self,
        images: &ArrayView4<f32>,
        targets: &ArrayView2<f32>,
    ) -> Result<(f32, Array2<f32>), ModelError> {
        let output = self.infer(images)?;
        check_targets(&output, targets)?;

        let loss = self.loss_fn.compute(&output.view(), targets);
        Ok((loss, output))
    }

    /// Paramètres nommés `layers.{i}.{nom}`
    pub fn named_parameters(&self) -> Vec<(String, &Array4<f32>)> {
        let mut named = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            for (name, param) in layer.params() {
                named.push((format!("layers.{i}.{name}"), &param.value));
            }
        }
        named
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut named = Vec::new();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            for (name, param) in layer.params_mut() {
                named.push((format!("layers.{i}.{name}"), param));
            }
        }
        named
    }

    pub fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, p)| p.len()).sum()
    }

    /// Diagnostic rapide
    pub fn diagnostic(&self) -> Result<(), ModelError> {
        let (c, h, w) = self.network_config.input_shape;
        let output = self.infer(&Array4::zeros((1, c, h, w)).view())?;

        info!(
            layers = self.layers.len(),
            parameters = self.num_parameters(),
            input_shape = ?self.network_config.input_shape,
            output_shape = ?output.dim(),
            "🔍 modèle opérationnel"
        );
        Ok(())
    }
}

fn check_targets(output: &Array2<f32>, targets: &ArrayView2<f32>) -> Result<(), ModelError> {
    if output.dim() != targets.dim() {
        return Err(ModelError::ShapeMismatch(format!(
            "sortie {:?}, cibles {:?}",
            output.dim(),
            targets.dim()
        )));
    }
    Ok(())
}

impl TrainingHistory {
    pub fn update(&mut self, train_loss: f32, test_loss: f32, test_accuracy: f32) {
        self.train_loss.push(train_loss);
        self.test_loss.push(test_loss);
        self.test_accuracy.push(test_accuracy);
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{optimizer::Adam, ModelBuilder};
    use approx::assert_abs_diff_eq;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model(seed: u64) -> CapNet {
        ModelBuilder::new()
            .with_network_config(NetworkConfig::tiny(10))
            .with_seed(seed)
            .build()
            .unwrap()
    }

    fn images(batch_size: usize, seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::random_using((batch_size, 1, 8, 8), Uniform::new(-1.0, 2.0).unwrap(), &mut rng)
    }

    fn targets(labels: &[usize]) -> Array2<f32> {
        let mut targets = Array2::zeros((labels.len(), 10));
        for (row, &label) in labels.iter().enumerate() {
            targets[[row, label]] = 1.0;
        }
        targets
    }

    #[test]
    fn test_forward_output() {
        let mut model = tiny_model(0);
        let input = images(10, 1);

        let output = model.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (10, 10));
        assert!(output.iter().all(|&v| (0.0..1.0).contains(&v)));

        // Même résultat sans cache
        let inferred = model.infer(&input.view()).unwrap();
        for (a, b) in output.iter().zip(inferred.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_evaluate_batch_loss_is_non_negative() {
        let model = tiny_model(2);
        let labels = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

        let (loss, output) = model
            .evaluate_batch(&images(10, 3).view(), &targets(&labels).view())
            .unwrap();

        assert!(loss.is_finite());
        assert!(loss >= 0.0);
        assert_eq!(output.dim(), (10, 10));
        assert_eq!(model.state.optimizer_steps, 0);
    }

    #[test]
    fn test_train_step_updates_all_parameters() {
        let mut model = tiny_model(4);
        let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-8);
        let before: Vec<Array4<f32>> = model
            .named_parameters()
            .into_iter()
            .map(|(_, p)| p.clone())
            .collect();

        let loss = model
            .train_step(
                &images(4, 5).view(),
                &targets(&[1, 3, 5, 7]).view(),
                &mut optimizer,
            )
            .unwrap();

        assert!(loss.is_finite());
        assert_eq!(model.state.optimizer_steps, 1);
        for ((name, after), before) in model.named_parameters().into_iter().zip(&before) {
            assert_ne!(after, before, "{name} inchangé");
        }
    }

    #[test]
    fn test_repeated_steps_reduce_loss() {
        let mut model = tiny_model(6);
        let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-8);
        let input = images(4, 7);
        let target = targets(&[2, 2, 2, 2]);

        let (initial, _) = model.evaluate_batch(&input.view(), &target.view()).unwrap();
        for _ in 0..30 {
            model
                .train_step(&input.view(), &target.view(), &mut optimizer)
                .unwrap();
        }
        let (trained, _) = model.evaluate_batch(&input.view(), &target.view()).unwrap();

        assert!(trained < initial, "{trained} >= {initial}");
    }

    #[test]
    fn test_target_shape_mismatch() {
        let model = tiny_model(8);
        let wrong = Array2::zeros((2, 3));

        assert!(matches!(
            model.evaluate_batch(&images(2, 9).view(), &wrong.view()),
            Err(ModelError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut model = tiny_model(10);
        let grad = Array2::zeros((1, 10));

        assert!(matches!(
            model.backward(&grad.view()),
            Err(ModelError::MissingCache(_))
        ));
    }

    #[test]
    fn test_parameter_names() {
        let model = tiny_model(11);
        let names: Vec<String> = model
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        assert_eq!(
            names,
            vec![
                "layers.0.weight",
                "layers.0.bias",
                "layers.1.weight",
                "layers.1.bias",
                "layers.2.weight"
            ]
        );
    }

    #[test]
    fn test_history() {
        let mut history = TrainingHistory::default();
        history.update(0.5, 0.4, 0.8);
        history.update(0.3, 0.2, 0.9);

        assert_eq!(history.epochs(), 2);
        assert_eq!(history.test_accuracy, vec![0.8, 0.9]);
    }
}
