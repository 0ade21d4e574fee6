use serde::{Deserialize, Serialize};

use super::error::ModelError;

/// Configuration du réseau: forme d'entrée et pile de couches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_shape: (usize, usize, usize),
    pub layers: Vec<LayerConfig>,
    pub routing_iterations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerConfig {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
    },
    PrimaryCapsules {
        in_channels: usize,
        capsule_config: CapsuleConfig,
    },
    ClassCapsules {
        input_capsules: usize,
        input_capsule_dim: usize,
        output_capsules: usize,
        output_capsule_dim: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleConfig {
    pub num_capsules: usize,
    pub capsule_dim: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    None,
}

/// Forme des données entre deux couches (sans l'axe batch)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureShape {
    Maps {
        channels: usize,
        height: usize,
        width: usize,
    },
    Capsules {
        types: usize,
        spatial: usize,
        dim: usize,
    },
}

/// Taille de sortie d'une convolution
pub fn conv_output_size(
    size: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
) -> Result<usize, ModelError> {
    if stride == 0 || kernel_size == 0 {
        return Err(ModelError::InvalidConfig(
            "kernel_size et stride doivent être > 0".to_string(),
        ));
    }
    let padded = size + 2 * padding;
    if padded < kernel_size {
        return Err(ModelError::InvalidConfig(format!(
            "noyau {kernel_size} plus grand que l'entrée {padded}"
        )));
    }
    Ok((padded - kernel_size) / stride + 1)
}

impl NetworkConfig {
    /// Réseau MNIST: conv A canaux, B types de capsules primaires de
    /// dimension C, E capsules de classe de dimension D
    pub fn capsules(a: usize, b: usize, c: usize, d: usize, e: usize, iters: usize) -> Self {
        Self {
            input_shape: (1, 28, 28),
            layers: vec![
                LayerConfig::Conv2d {
                    in_channels: 1,
                    out_channels: a,
                    kernel_size: 9,
                    stride: 1,
                    padding: 0,
                    activation: Activation::ReLU,
                },
                LayerConfig::PrimaryCapsules {
                    in_channels: a,
                    capsule_config: CapsuleConfig {
                        num_capsules: b,
                        capsule_dim: c,
                        kernel_size: 9,
                        stride: 2,
                        padding: 0,
                    },
                },
                LayerConfig::ClassCapsules {
                    input_capsules: b,
                    input_capsule_dim: c,
                    output_capsules: e,
                    output_capsule_dim: d,
                },
            ],
            routing_iterations: iters,
        }
    }

    /// Vérifie l'enchaînement des couches et renvoie la forme de sortie
    pub fn validate(&self) -> Result<FeatureShape, ModelError> {
        if self.routing_iterations == 0 {
            return Err(ModelError::InvalidConfig(
                "routing_iterations doit être >= 1".to_string(),
            ));
        }
        if self.layers.is_empty() {
            return Err(ModelError::InvalidConfig(
                "le réseau doit avoir au moins une couche".to_string(),
            ));
        }

        let (channels, height, width) = self.input_shape;
        let mut shape = FeatureShape::Maps {
            channels,
            height,
            width,
        };

        for (i, layer) in self.layers.iter().enumerate() {
            shape = layer.output_shape(shape).map_err(|e| match e {
                ModelError::InvalidConfig(msg) => {
                    ModelError::InvalidConfig(format!("couche {i}: {msg}"))
                }
                other => other,
            })?;
        }

        match shape {
            FeatureShape::Capsules { spatial: 1, .. } => Ok(shape),
            _ => Err(ModelError::InvalidConfig(
                "la dernière couche doit être ClassCapsules".to_string(),
            )),
        }
    }

    /// Nombre de classes (capsules de sortie de la dernière couche)
    pub fn num_classes(&self) -> usize {
        match self.layers.last() {
            Some(LayerConfig::ClassCapsules {
                output_capsules, ..
            }) => *output_capsules,
            _ => 0,
        }
    }

    /// Petit réseau 1x8x8 pour les tests
    #[cfg(test)]
    pub fn tiny(num_classes: usize) -> Self {
        Self {
            input_shape: (1, 8, 8),
            layers: vec![
                LayerConfig::Conv2d {
                    in_channels: 1,
                    out_channels: 4,
                    kernel_size: 3,
                    stride: 1,
                    padding: 0,
                    activation: Activation::ReLU,
                },
                LayerConfig::PrimaryCapsules {
                    in_channels: 4,
                    capsule_config: CapsuleConfig {
                        num_capsules: 2,
                        capsule_dim: 4,
                        kernel_size: 3,
                        stride: 2,
                        padding: 0,
                    },
                },
                LayerConfig::ClassCapsules {
                    input_capsules: 2,
                    input_capsule_dim: 4,
                    output_capsules: num_classes,
                    output_capsule_dim: 4,
                },
            ],
            routing_iterations: 2,
        }
    }
}

impl LayerConfig {
    fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape, ModelError> {
        match (self, input) {
            (
                LayerConfig::Conv2d {
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    padding,
                    ..
                },
                FeatureShape::Maps {
                    channels,
                    height,
                    width,
                },
            ) => {
                if *in_channels != channels {
                    return Err(ModelError::InvalidConfig(format!(
                        "Conv2d attend {in_channels} canaux, reçoit {channels}"
                    )));
                }
                if *out_channels == 0 {
                    return Err(ModelError::InvalidConfig(
                        "Conv2d sans canal de sortie".to_string(),
                    ));
                }
                Ok(FeatureShape::Maps {
                    channels: *out_channels,
                    height: conv_output_size(height, *kernel_size, *stride, *padding)?,
                    width: conv_output_size(width, *kernel_size, *stride, *padding)?,
                })
            }
            (
                LayerConfig::PrimaryCapsules {
                    in_channels,
                    capsule_config,
                },
                FeatureShape::Maps {
                    channels,
                    height,
                    width,
                },
            ) => {
                if *in_channels != channels {
                    return Err(ModelError::InvalidConfig(format!(
                        "PrimaryCapsules attend {in_channels} canaux, reçoit {channels}"
                    )));
                }
                if capsule_config.num_capsules == 0 || capsule_config.capsule_dim == 0 {
                    return Err(ModelError::InvalidConfig(
                        "PrimaryCapsules sans capsule".to_string(),
                    ));
                }
                let h = conv_output_size(
                    height,
                    capsule_config.kernel_size,
                    capsule_config.stride,
                    capsule_config.padding,
                )?;
                let w = conv_output_size(
                    width,
                    capsule_config.kernel_size,
                    capsule_config.stride,
                    capsule_config.padding,
                )?;
                Ok(FeatureShape::Capsules {
                    types: capsule_config.num_capsules,
                    spatial: h * w,
                    dim: capsule_config.capsule_dim,
                })
            }
            (
                LayerConfig::ClassCapsules {
                    input_capsules,
                    input_capsule_dim,
                    output_capsules,
                    output_capsule_dim,
                },
                FeatureShape::Capsules { types, dim, .. },
            ) => {
                if *input_capsules != types || *input_capsule_dim != dim {
                    return Err(ModelError::InvalidConfig(format!(
                        "ClassCapsules attend {input_capsules}x{input_capsule_dim}, reçoit {types}x{dim}"
                    )));
                }
                if *output_capsules == 0 || *output_capsule_dim == 0 {
                    return Err(ModelError::InvalidConfig(
                        "ClassCapsules sans capsule de sortie".to_string(),
                    ));
                }
                Ok(FeatureShape::Capsules {
                    types: *output_capsules,
                    spatial: 1,
                    dim: *output_capsule_dim,
                })
            }
            (layer, shape) => Err(ModelError::InvalidConfig(format!(
                "{layer:?} ne peut pas suivre une sortie {shape:?}"
            ))),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::capsules(64, 8, 16, 16, 10, 2)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub learning_rate: f32,
    pub num_epochs: usize,
    pub seed: u64,
    pub log_interval: usize,
    pub optimizer_type: OptimizerType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
    SGD { momentum: f32 },
}

impl OptimizerType {
    pub fn adam() -> Self {
        OptimizerType::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return Err(ModelError::InvalidConfig(
                "la taille de batch doit être > 0".to_string(),
            ));
        }
        if self.log_interval == 0 {
            return Err(ModelError::InvalidConfig(
                "log_interval doit être > 0".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "learning rate invalide: {}",
                self.learning_rate
            )));
        }
        match self.optimizer_type {
            OptimizerType::Adam { beta1, beta2, .. }
                if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) =>
            {
                Err(ModelError::InvalidConfig(
                    "beta1/beta2 doivent être dans [0, 1)".to_string(),
                ))
            }
            OptimizerType::SGD { momentum } if !(0.0..1.0).contains(&momentum) => Err(
                ModelError::InvalidConfig("momentum doit être dans [0, 1)".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            test_batch_size: 10,
            learning_rate: 0.01,
            num_epochs: 10,
            seed: 1337,
            log_interval: 10,
            optimizer_type: OptimizerType::adam(),
        }
    }
}
