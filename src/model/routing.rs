use ndarray::{s, Array4, ArrayView1, ArrayView4, Axis};
use rayon::prelude::*;

use super::layers::squash;

/// Résultat du routage: sorties, coefficients de couplage et somme avant squash
#[derive(Debug, Clone)]
pub struct RoutingOutput {
    /// v_j, forme (batch, capsules de sortie, 1, dim)
    pub outputs: Array4<f32>,
    /// c_ij, forme (batch, capsules de sortie, capsules d'entrée, 1)
    pub coupling: Array4<f32>,
    /// s_j, forme (batch, capsules de sortie, 1, dim)
    pub pre_squash: Array4<f32>,
}

/// Routage dynamique par agreement
#[derive(Debug, Clone)]
pub struct DynamicRouting {
    pub num_iterations: usize,
}

impl DynamicRouting {
    pub fn new(num_iterations: usize) -> Self {
        Self { num_iterations }
    }

    /// Routage avec retour des coefficients de couplage.
    /// `predictions` (û_j|i) a la forme (batch, capsules de sortie, capsules d'entrée, dim).
    pub fn route_with_coeffs(&self, predictions: &ArrayView4<f32>) -> RoutingOutput {
        let (batch_size, output_caps, input_caps, _dim) = predictions.dim();

        // Initialisation des logits (b_ij)
        let mut logits = Array4::zeros((batch_size, output_caps, input_caps, 1));
        let mut iteration = 0;

        loop {
            // c_ij = softmax_j(b_ij)
            let coupling = self.softmax_parallel(&logits.view());

            // s_j = Σ_i c_ij * û_j|i
            let pre_squash = self.weighted_sum_parallel(predictions, &coupling.view());

            // v_j = squash(s_j)
            let outputs = squash(&pre_squash.view());

            iteration += 1;
            if iteration >= self.num_iterations {
                return RoutingOutput {
                    outputs,
                    coupling,
                    pre_squash,
                };
            }

            self.update_logits_parallel(predictions, &outputs.view(), &mut logits);
        }
    }

    /// Version simple sans coefficients
    pub fn route(&self, predictions: &ArrayView4<f32>) -> Array4<f32> {
        self.route_with_coeffs(predictions).outputs
    }

    /// Softmax parallélisé sur l'axe des capsules de sortie
    fn softmax_parallel(&self, logits: &ArrayView4<f32>) -> Array4<f32> {
        let mut result = logits.to_owned();

        result
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut batch| {
                for mut lane in batch.lanes_mut(Axis(0)) {
                    // max pour la stabilité numérique
                    let max_val = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    lane.mapv_inplace(|v| (v - max_val).exp());
                    let exp_sum = lane.sum();
                    lane /= exp_sum;
                }
            });

        result
    }

    /// Somme pondérée parallélisée
    fn weighted_sum_parallel(
        &self,
        predictions: &ArrayView4<f32>,
        coupling_coeffs: &ArrayView4<f32>,
    ) -> Array4<f32> {
        let (batch_size, output_caps, _input_caps, dim) = predictions.dim();
        let mut outputs = Array4::zeros((batch_size, output_caps, 1, dim));

        outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut output_batch)| {
                for oc in 0..output_caps {
                    let coeffs: ArrayView1<f32> =
                        coupling_coeffs.slice(s![b, oc, .., 0]);
                    let preds = predictions.slice(s![b, oc, .., ..]);
                    output_batch
                        .slice_mut(s![oc, 0, ..])
                        .assign(&coeffs.dot(&preds));
                }
            });

        outputs
    }

    /// Mise à jour des logits: b_ij += û_j|i · v_j
    fn update_logits_parallel(
        &self,
        predictions: &ArrayView4<f32>,
        outputs: &ArrayView4<f32>,
        logits: &mut Array4<f32>,
    ) {
        let output_caps = predictions.dim().1;

        logits
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut logits_batch)| {
                for oc in 0..output_caps {
                    let agreement = predictions
                        .slice(s![b, oc, .., ..])
                        .dot(&outputs.slice(s![b, oc, 0, ..]));
                    let mut row = logits_batch.slice_mut(s![oc, .., 0]);
                    row += &agreement;
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    #[test]
    fn test_routing_dimensions() {
        let routing = DynamicRouting::new(3);
        let predictions = Array4::ones((2, 10, 1152, 16));

        let output = routing.route(&predictions.view());

        assert_eq!(output.dim(), (2, 10, 1, 16));
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let routing = DynamicRouting::new(3);
        let mut logits = Array4::ones((2, 10, 32, 1));
        logits[[0, 3, 5, 0]] = 4.0;

        let coeffs = routing.softmax_parallel(&logits.view());

        // La somme sur les capsules de sortie vaut 1
        for b in 0..2 {
            for ic in 0..32 {
                let sum: f32 = (0..10).map(|oc| coeffs[[b, oc, ic, 0]]).sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
        assert!(coeffs[[0, 3, 5, 0]] > coeffs[[0, 2, 5, 0]]);
    }

    #[test]
    fn test_single_iteration_is_uniform() {
        let routing = DynamicRouting::new(1);
        let mut predictions = Array4::zeros((1, 4, 3, 2));
        predictions[[0, 1, 0, 0]] = 3.0;

        let result = routing.route_with_coeffs(&predictions.view());

        for &c in result.coupling.iter() {
            assert_abs_diff_eq!(c, 0.25, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(result.pre_squash[[0, 1, 0, 0]], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn test_agreement_raises_coupling() {
        // L'entrée 0 prédit fortement la sortie 0: son couplage vers 0 augmente
        let routing = DynamicRouting::new(3);
        let mut predictions = Array4::zeros((1, 2, 2, 2));
        predictions[[0, 0, 0, 0]] = 2.0;
        predictions[[0, 0, 1, 0]] = 2.0;
        predictions[[0, 1, 0, 1]] = 0.1;
        predictions[[0, 1, 1, 0]] = -0.1;

        let result = routing.route_with_coeffs(&predictions.view());

        assert!(result.coupling[[0, 0, 0, 0]] > 0.5);
        assert!(result.coupling[[0, 0, 1, 0]] > 0.5);
        let norm: f32 = result
            .outputs
            .slice(s![0, 0, 0, ..])
            .iter()
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        assert!(norm < 1.0);
    }
}
