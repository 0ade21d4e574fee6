use ndarray::{s, Array1, Array2, Array4, ArrayView1, ArrayView2, ArrayView4, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;

use super::config::Activation;
use super::error::ModelError;
use super::layers::{squash, squash_gradient, ConvLayer, Layer, Param, EPSILON};
use super::routing::DynamicRouting;

/// Couche de capsules primaires: une convolution dont les canaux sont
/// regroupés en `num_capsules` types de dimension `capsule_dim`
pub struct PrimaryCapsLayer {
    pub conv: ConvLayer,
    pub num_capsules: usize,
    pub capsule_dim: usize,
    cache: Option<PrimaryCapsCache>,
}

struct PrimaryCapsCache {
    pre_squash: Array4<f32>,
    grid: (usize, usize),
}

impl PrimaryCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_capsules: usize,
        capsule_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let conv = ConvLayer::new(
            in_channels,
            num_capsules * capsule_dim,
            kernel_size,
            stride,
            padding,
            Activation::None,
            rng,
        )?;

        Ok(Self {
            conv,
            num_capsules,
            capsule_dim,
            cache: None,
        })
    }

    /// (batch, types*dim, h, w) -> (batch, types, h*w, dim), canal = type*dim + d
    fn to_capsules(&self, maps: Array4<f32>) -> Result<Array4<f32>, ModelError> {
        let (batch_size, _, height, width) = maps.dim();
        let capsules = maps
            .into_shape_with_order((batch_size, self.num_capsules, self.capsule_dim, height * width))?
            .permuted_axes([0, 1, 3, 2])
            .as_standard_layout()
            .into_owned();
        Ok(capsules)
    }

    fn to_maps(
        &self,
        capsules: Array4<f32>,
        height: usize,
        width: usize,
    ) -> Result<Array4<f32>, ModelError> {
        let batch_size = capsules.dim().0;
        let maps = capsules
            .permuted_axes([0, 1, 3, 2])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch_size, self.num_capsules * self.capsule_dim, height, width))?;
        Ok(maps)
    }
}

impl Layer for PrimaryCapsLayer {
    fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let maps = self.conv.forward(input)?;
        let (_, _, height, width) = maps.dim();
        let capsules = self.to_capsules(maps)?;
        let output = squash(&capsules.view());
        self.cache = Some(PrimaryCapsCache {
            pre_squash: capsules,
            grid: (height, width),
        });
        Ok(output)
    }

    fn infer(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let maps = self.conv.infer(input)?;
        let capsules = self.to_capsules(maps)?;
        Ok(squash(&capsules.view()))
    }

    fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let PrimaryCapsCache {
            pre_squash: capsules,
            grid: (height, width),
        } = self
            .cache
            .take()
            .ok_or(ModelError::MissingCache("primary_caps"))?;

        if grad_output.dim() != capsules.dim() {
            return Err(ModelError::ShapeMismatch(format!(
                "primary_caps backward: gradient {:?}, capsules {:?}",
                grad_output.dim(),
                capsules.dim()
            )));
        }

        let grad_capsules = squash_gradient(&capsules.view(), grad_output);
        let grad_maps = self.to_maps(grad_capsules, height, width)?;
        self.conv.backward(&grad_maps.view())
    }

    fn params(&self) -> Vec<(&'static str, &Param)> {
        self.conv.params()
    }

    fn params_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        self.conv.params_mut()
    }
}

struct ClassCapsCache {
    input: Array4<f32>,
    coupling: Array4<f32>,
    pre_squash: Array4<f32>,
}

/// Couche de capsules de classe avec routage dynamique.
/// Les matrices W[classe, type] sont partagées par toutes les positions d'un type.
pub struct ClassCapsLayer {
    pub routing: DynamicRouting,
    pub weight: Param,
    cache: Option<ClassCapsCache>,
}

impl ClassCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        input_capsules: usize,
        input_capsule_dim: usize,
        output_capsules: usize,
        output_capsule_dim: usize,
        routing_iterations: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let scale = (1.0 / input_capsule_dim as f32).sqrt();
        let distribution = Uniform::new(-scale, scale)
            .map_err(|e| ModelError::InvalidConfig(format!("initialisation capsules: {e}")))?;
        let weights = Array4::random_using(
            (output_capsules, input_capsules, output_capsule_dim, input_capsule_dim),
            distribution,
            rng,
        );

        Ok(Self {
            routing: DynamicRouting::new(routing_iterations),
            weight: Param::new(weights),
            cache: None,
        })
    }

    /// û_j|i = W[j, type(i)] · u_i, forme (batch, classes, types*positions, dim sortie)
    fn predictions(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let (batch_size, types, spatial, in_dim) = input.dim();
        let (classes, weight_types, out_dim, weight_in_dim) = self.weight.value.dim();

        if types != weight_types || in_dim != weight_in_dim {
            return Err(ModelError::ShapeMismatch(format!(
                "class_caps: entrée {types}x{in_dim}, poids {weight_types}x{weight_in_dim}"
            )));
        }

        let mut predictions = Array4::zeros((batch_size, classes, types * spatial, out_dim));

        predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut batch_predictions)| {
                for j in 0..classes {
                    for t in 0..types {
                        let w = self.weight.value.slice(s![j, t, .., ..]);
                        let u = input.slice(s![b, t, .., ..]);
                        batch_predictions
                            .slice_mut(s![j, t * spatial..(t + 1) * spatial, ..])
                            .assign(&u.dot(&w.t()));
                    }
                }
            });

        Ok(predictions)
    }
}

impl Layer for ClassCapsLayer {
    fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let predictions = self.predictions(input)?;
        let routed = self.routing.route_with_coeffs(&predictions.view());

        self.cache = Some(ClassCapsCache {
            input: input.to_owned(),
            coupling: routed.coupling,
            pre_squash: routed.pre_squash,
        });

        Ok(routed.outputs)
    }

    fn infer(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let predictions = self.predictions(input)?;
        Ok(self.routing.route(&predictions.view()))
    }

    /// Les coefficients de couplage de la dernière itération sont traités
    /// comme des constantes
    fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let cache = self.cache.take().ok_or(ModelError::MissingCache("class_caps"))?;

        if grad_output.dim() != cache.pre_squash.dim() {
            return Err(ModelError::ShapeMismatch(format!(
                "class_caps backward: gradient {:?}, sortie {:?}",
                grad_output.dim(),
                cache.pre_squash.dim()
            )));
        }

        // dL/ds_j
        let grad_s = squash_gradient(&cache.pre_squash.view(), grad_output);

        let (batch_size, types, spatial, in_dim) = cache.input.dim();
        let (classes, _, out_dim, _) = self.weight.value.dim();
        let mut grad_input = Array4::zeros(cache.input.dim());
        let mut grad_weight = Array4::<f32>::zeros(self.weight.value.dim());

        for b in 0..batch_size {
            for j in 0..classes {
                let g: ArrayView1<f32> = grad_s.slice(s![b, j, 0, ..]);
                for t in 0..types {
                    let coeffs: ArrayView1<f32> =
                        cache.coupling.slice(s![b, j, t * spatial..(t + 1) * spatial, 0]);
                    let u = cache.input.slice(s![b, t, .., ..]);
                    let w = self.weight.value.slice(s![j, t, .., ..]);

                    // dW[j,t] += g ⊗ Σ_s c_s u_s
                    let weighted_u = coeffs.dot(&u);
                    let outer = g
                        .to_shape((out_dim, 1))?
                        .dot(&weighted_u.to_shape((1, in_dim))?);
                    let mut dw = grad_weight.slice_mut(s![j, t, .., ..]);
                    dw += &outer;

                    // du_s += c_s * W^T g
                    let back: Array1<f32> = w.t().dot(&g);
                    let contribution = coeffs
                        .to_shape((spatial, 1))?
                        .dot(&back.to_shape((1, in_dim))?);
                    let mut du = grad_input.slice_mut(s![b, t, .., ..]);
                    du += &contribution;
                }
            }
        }

        self.weight.grad += &grad_weight;
        Ok(grad_input)
    }

    fn params(&self) -> Vec<(&'static str, &Param)> {
        vec![("weight", &self.weight)]
    }

    fn params_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![("weight", &mut self.weight)]
    }
}

/// Longueur des capsules de classe: (batch, classes, 1, dim) -> (batch, classes)
pub fn capsule_lengths(capsules: &ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
    let (batch_size, classes, spatial, _) = capsules.dim();
    if spatial != 1 {
        return Err(ModelError::ShapeMismatch(format!(
            "capsules de classe attendues, {spatial} positions reçues"
        )));
    }

    let mut lengths = Array2::zeros((batch_size, classes));
    for ((b, j), length) in lengths.indexed_iter_mut() {
        let v: ArrayView1<f32> = capsules.slice(s![b, j, 0, ..]);
        *length = (v.dot(&v) + EPSILON).sqrt();
    }

    Ok(lengths)
}

/// dL/dv = dL/d|v| · v / |v|
pub fn capsule_lengths_gradient(
    capsules: &ArrayView4<f32>,
    grad_lengths: &ArrayView2<f32>,
) -> Array4<f32> {
    let mut grad = Array4::zeros(capsules.dim());

    for ((b, j), &g) in grad_lengths.indexed_iter() {
        let v: ArrayView1<f32> = capsules.slice(s![b, j, 0, ..]);
        let norm = (v.dot(&v) + EPSILON).sqrt();
        grad.slice_mut(s![b, j, 0, ..]).assign(&(&v * (g / norm)));
    }

    grad
}
