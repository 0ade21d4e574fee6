use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;

use super::config::{conv_output_size, Activation};
use super::error::ModelError;

/// Stabilité numérique des normes
pub const EPSILON: f32 = 1e-8;

/// Paramètre entraînable et son gradient accumulé
#[derive(Debug, Clone)]
pub struct Param {
    pub value: Array4<f32>,
    pub grad: Array4<f32>,
}

impl Param {
    pub fn new(value: Array4<f32>) -> Self {
        let grad = Array4::zeros(value.dim());
        Self { value, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// Trait pour toutes les couches avec forward et backward
pub trait Layer: Send + Sync {
    /// Passe avant en mode entraînement (garde le cache pour backward)
    fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError>;

    /// Passe avant en inférence, sans cache
    fn infer(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError>;

    /// Accumule les gradients des paramètres, renvoie le gradient de l'entrée
    fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError>;

    fn params(&self) -> Vec<(&'static str, &Param)>;

    fn params_mut(&mut self) -> Vec<(&'static str, &mut Param)>;

    fn zero_grad(&mut self) {
        for (_, param) in self.params_mut() {
            param.zero_grad();
        }
    }
}

impl Activation {
    pub fn apply(&self, x: &Array4<f32>) -> Array4<f32> {
        match *self {
            Activation::ReLU => x.mapv(|v| v.max(0.0)),
            Activation::None => x.clone(),
        }
    }

    /// Dérivée évaluée sur la pré-activation
    pub fn derivative(&self, x: &Array4<f32>) -> Array4<f32> {
        match *self {
            Activation::ReLU => x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::None => Array4::ones(x.dim()),
        }
    }
}

struct ConvCache {
    cols: Vec<Array2<f32>>,
    pre_activation: Array4<f32>,
    input_dim: (usize, usize, usize, usize),
}

/// Couche de convolution (im2col + produit matriciel)
pub struct ConvLayer {
    pub weight: Param,
    pub bias: Param,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
    cache: Option<ConvCache>,
}

impl ConvLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        // Initialisation He
        let scale = (2.0 / (in_channels * kernel_size * kernel_size) as f32).sqrt();
        let distribution = Uniform::new(-scale, scale)
            .map_err(|e| ModelError::InvalidConfig(format!("initialisation conv: {e}")))?;
        let weights = Array4::random_using(
            (out_channels, in_channels, kernel_size, kernel_size),
            distribution,
            rng,
        );

        Ok(Self {
            weight: Param::new(weights),
            bias: Param::new(Array4::zeros((out_channels, 1, 1, 1))),
            stride,
            padding,
            activation,
            cache: None,
        })
    }

    fn compute(&self, input: &ArrayView4<f32>) -> Result<(Array4<f32>, ConvCache), ModelError> {
        let (batch_size, in_channels, in_height, in_width) = input.dim();
        let (out_channels, weight_channels, kernel_size, _) = self.weight.value.dim();

        if in_channels != weight_channels {
            return Err(ModelError::ShapeMismatch(format!(
                "conv: {in_channels} canaux reçus, {weight_channels} attendus"
            )));
        }

        let out_height = conv_output_size(in_height, kernel_size, self.stride, self.padding)?;
        let out_width = conv_output_size(in_width, kernel_size, self.stride, self.padding)?;

        let padded = pad_input(input, self.padding);
        let kernel = self
            .weight
            .value
            .to_shape((out_channels, in_channels * kernel_size * kernel_size))?;
        let bias: Vec<f32> = self.bias.value.iter().copied().collect();

        // Convolution parallélisée par batch
        let per_sample: Vec<(Array2<f32>, Array2<f32>)> = (0..batch_size)
            .into_par_iter()
            .map(|b| {
                let cols = im2col(
                    &padded.index_axis(Axis(0), b),
                    kernel_size,
                    self.stride,
                    out_height,
                    out_width,
                );
                let mut out = kernel.dot(&cols);
                for (mut row, &bias_val) in out.outer_iter_mut().zip(&bias) {
                    row += bias_val;
                }
                (cols, out)
            })
            .collect();

        let mut pre_activation = Array4::zeros((batch_size, out_channels, out_height, out_width));
        let mut cols = Vec::with_capacity(batch_size);
        for (b, (sample_cols, out)) in per_sample.into_iter().enumerate() {
            pre_activation
                .index_axis_mut(Axis(0), b)
                .assign(&out.to_shape((out_channels, out_height, out_width))?);
            cols.push(sample_cols);
        }

        let output = self.activation.apply(&pre_activation);
        let cache = ConvCache {
            cols,
            pre_activation,
            input_dim: input.dim(),
        };

        Ok((output, cache))
    }
}

impl Layer for ConvLayer {
    fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let (output, cache) = self.compute(input)?;
        self.cache = Some(cache);
        Ok(output)
    }

    fn infer(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        self.compute(input).map(|(output, _)| output)
    }

    fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>, ModelError> {
        let cache = self.cache.take().ok_or(ModelError::MissingCache("conv"))?;

        if grad_output.dim() != cache.pre_activation.dim() {
            return Err(ModelError::ShapeMismatch(format!(
                "conv backward: gradient {:?}, sortie {:?}",
                grad_output.dim(),
                cache.pre_activation.dim()
            )));
        }

        // Gradient à travers l'activation
        let grad = grad_output.to_owned() * self.activation.derivative(&cache.pre_activation);

        let (batch_size, out_channels, out_height, out_width) = grad.dim();
        let (_, in_channels, kernel_size, _) = self.weight.value.dim();
        let (_, _, in_height, in_width) = cache.input_dim;
        let patch = in_channels * kernel_size * kernel_size;
        let kernel = self.weight.value.to_shape((out_channels, patch))?;

        let per_sample = (0..batch_size)
            .into_par_iter()
            .map(|b| -> Result<(Array2<f32>, Array1<f32>, Array3<f32>), ModelError> {
                let g = grad
                    .index_axis(Axis(0), b)
                    .to_shape((out_channels, out_height * out_width))?
                    .into_owned();
                let d_kernel = g.dot(&cache.cols[b].t());
                let d_bias = g.sum_axis(Axis(1));
                let d_cols = kernel.t().dot(&g);
                let d_input = col2im(
                    &d_cols,
                    (in_channels, in_height, in_width),
                    kernel_size,
                    self.stride,
                    self.padding,
                    (out_height, out_width),
                );
                Ok((d_kernel, d_bias, d_input))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        let mut d_kernel = Array2::<f32>::zeros((out_channels, patch));
        let mut d_bias = Array1::<f32>::zeros(out_channels);
        let mut grad_input = Array4::zeros(cache.input_dim);
        for (b, (dk, db, dx)) in per_sample.into_iter().enumerate() {
            d_kernel += &dk;
            d_bias += &db;
            grad_input.index_axis_mut(Axis(0), b).assign(&dx);
        }

        let d_kernel =
            d_kernel.into_shape_with_order((out_channels, in_channels, kernel_size, kernel_size))?;
        let d_bias = d_bias.into_shape_with_order((out_channels, 1, 1, 1))?;
        self.weight.grad += &d_kernel;
        self.bias.grad += &d_bias;

        Ok(grad_input)
    }

    fn params(&self) -> Vec<(&'static str, &Param)> {
        vec![("weight", &self.weight), ("bias", &self.bias)]
    }

    fn params_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![("weight", &mut self.weight), ("bias", &mut self.bias)]
    }
}

fn pad_input(input: &ArrayView4<f32>, padding: usize) -> Array4<f32> {
    if padding == 0 {
        return input.to_owned();
    }

    let (batch_size, channels, height, width) = input.dim();
    let mut padded = Array4::zeros((
        batch_size,
        channels,
        height + 2 * padding,
        width + 2 * padding,
    ));
    padded
        .slice_mut(s![.., .., padding..height + padding, padding..width + padding])
        .assign(input);

    padded
}

/// Dépliage des patchs: (C*k*k, OH*OW)
fn im2col(
    input: &ArrayView3<f32>,
    kernel_size: usize,
    stride: usize,
    out_height: usize,
    out_width: usize,
) -> Array2<f32> {
    let channels = input.dim().0;
    let mut cols = Array2::zeros((channels * kernel_size * kernel_size, out_height * out_width));

    for c in 0..channels {
        for kh in 0..kernel_size {
            for kw in 0..kernel_size {
                let row = (c * kernel_size + kh) * kernel_size + kw;
                for oh in 0..out_height {
                    for ow in 0..out_width {
                        cols[[row, oh * out_width + ow]] =
                            input[[c, oh * stride + kh, ow * stride + kw]];
                    }
                }
            }
        }
    }

    cols
}

/// Inverse de im2col: les patchs qui se recouvrent s'additionnent
fn col2im(
    cols: &Array2<f32>,
    (channels, height, width): (usize, usize, usize),
    kernel_size: usize,
    stride: usize,
    padding: usize,
    (out_height, out_width): (usize, usize),
) -> Array3<f32> {
    let mut padded = Array3::zeros((channels, height + 2 * padding, width + 2 * padding));

    for c in 0..channels {
        for kh in 0..kernel_size {
            for kw in 0..kernel_size {
                let row = (c * kernel_size + kh) * kernel_size + kw;
                for oh in 0..out_height {
                    for ow in 0..out_width {
                        padded[[c, oh * stride + kh, ow * stride + kw]] +=
                            cols[[row, oh * out_width + ow]];
                    }
                }
            }
        }
    }

    padded
        .slice(s![.., padding..padding + height, padding..padding + width])
        .to_owned()
}

/// Fonction squash sur le dernier axe: v = |s|² / (1 + |s|²) · s / |s|
pub fn squash(vectors: &ArrayView4<f32>) -> Array4<f32> {
    let mut result = vectors.to_owned();

    for mut lane in result.lanes_mut(Axis(3)) {
        let norm_squared = lane.dot(&lane);
        lane *= squash_factor(norm_squared);
    }

    result
}

fn squash_factor(norm_squared: f32) -> f32 {
    norm_squared / ((1.0 + norm_squared) * (norm_squared + EPSILON).sqrt())
}

/// Gradient de squash par rapport à l'entrée, pour chaque vecteur du dernier axe
pub fn squash_gradient(vectors: &ArrayView4<f32>, grad_output: &ArrayView4<f32>) -> Array4<f32> {
    let mut grad_input = Array4::zeros(vectors.dim());

    Zip::from(grad_input.lanes_mut(Axis(3)))
        .and(vectors.lanes(Axis(3)))
        .and(grad_output.lanes(Axis(3)))
        .for_each(|mut grad_in, vector, grad_out| {
            let q = vector.dot(&vector);
            let r = (q + EPSILON).sqrt();
            let denom = (1.0 + q) * r;
            let factor = q / denom;
            // d(factor)/dq
            let d_factor = (r - q * (1.0 + q) / (2.0 * r)) / (denom * denom);
            let projection = vector.dot(&grad_out);

            grad_in.assign(&grad_out);
            grad_in *= factor;
            grad_in.scaled_add(2.0 * d_factor * projection, &vector);
        });

    grad_input
}
