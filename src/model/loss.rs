use ndarray::{Array2, ArrayView2, Axis};

/// Trait pour les fonctions de perte
pub trait LossFunction: Send + Sync {
    fn compute(&self, predictions: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> f32;
    fn gradient(&self, predictions: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Array2<f32>;
}

/// Erreur quadratique moyenne sur tous les éléments (batch × classes)
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl LossFunction for MseLoss {
    fn compute(&self, predictions: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> f32 {
        let diff = predictions.to_owned() - targets;
        diff.mapv(|x| x * x).mean().unwrap_or(0.0)
    }

    fn gradient(&self, predictions: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Array2<f32> {
        let diff = predictions.to_owned() - targets;
        let n = diff.len().max(1) as f32;

        diff * (2.0 / n)
    }
}

/// Classe prédite: capsule la plus longue
pub fn predicted_classes(outputs: &ArrayView2<f32>) -> Vec<usize> {
    outputs
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (c, &v)| {
                    if v > best.1 {
                        (c, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Métriques d'évaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub correct: usize,
    pub total: usize,
    pub accuracy: f32,
}

impl Metrics {
    pub fn compute(outputs: &ArrayView2<f32>, labels: &[usize]) -> Self {
        let correct = predicted_classes(outputs)
            .iter()
            .zip(labels)
            .filter(|(pred, label)| pred == label)
            .count();
        let total = labels.len();

        Self {
            correct,
            total,
            accuracy: if total > 0 {
                correct as f32 / total as f32
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_mse_loss() {
        let predictions = array![[0.5, 0.0], [1.0, 1.0]];
        let targets = array![[1.0, 0.0], [0.0, 1.0]];

        let loss = MseLoss.compute(&predictions.view(), &targets.view());
        assert_abs_diff_eq!(loss, (0.25 + 1.0) / 4.0);

        let grad = MseLoss.gradient(&predictions.view(), &targets.view());
        assert_abs_diff_eq!(grad[[0, 0]], -0.25);
        assert_abs_diff_eq!(grad[[1, 0]], 0.5);
        assert_abs_diff_eq!(grad[[1, 1]], 0.0);
    }

    #[test]
    fn test_mse_is_zero_on_target() {
        let targets = array![[0.0, 1.0, 0.0]];
        assert_eq!(MseLoss.compute(&targets.view(), &targets.view()), 0.0);
    }

    #[test]
    fn test_metrics() {
        let outputs = array![[0.1, 0.9, 0.2], [0.8, 0.1, 0.3], [0.2, 0.3, 0.4]];
        let metrics = Metrics::compute(&outputs.view(), &[1, 0, 0]);

        assert_eq!(predicted_classes(&outputs.view()), vec![1, 0, 2]);
        assert_eq!(metrics.correct, 2);
        assert_eq!(metrics.total, 3);
        assert_abs_diff_eq!(metrics.accuracy, 2.0 / 3.0);
    }
}
