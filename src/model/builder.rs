use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::{
    capsule::{ClassCapsLayer, PrimaryCapsLayer},
    config::{LayerConfig, NetworkConfig},
    core::CapNet,
    error::ModelError,
    layers::{ConvLayer, Layer},
};

/// Constructeur de modèle
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    seed: u64,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            seed: 0,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    /// Graine de l'initialisation des poids
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> Result<CapNet, ModelError> {
        let network_config = self
            .network_config
            .ok_or_else(|| ModelError::InvalidConfig("configuration réseau requise".to_string()))?;

        // Validation
        let output_shape = network_config.validate()?;
        debug!(?output_shape, "configuration réseau validée");

        let mut rng = StdRng::seed_from_u64(self.seed);
        let layers = Self::build_layers(&network_config, &mut rng)?;

        Ok(CapNet::new(network_config, layers))
    }

    fn build_layers(
        config: &NetworkConfig,
        rng: &mut StdRng,
    ) -> Result<Vec<Box<dyn Layer>>, ModelError> {
        let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(config.layers.len());

        for layer_config in &config.layers {
            let layer: Box<dyn Layer> = match layer_config {
                LayerConfig::Conv2d {
                    in_channels,
                    out_channels,
                    kernel_size,
                    stride,
                    padding,
                    activation,
                } => Box::new(ConvLayer::new(
                    *in_channels,
                    *out_channels,
                    *kernel_size,
                    *stride,
                    *padding,
                    *activation,
                    rng,
                )?),

                LayerConfig::PrimaryCapsules {
                    in_channels,
                    capsule_config,
                } => Box::new(PrimaryCapsLayer::new(
                    *in_channels,
                    capsule_config.num_capsules,
                    capsule_config.capsule_dim,
                    capsule_config.kernel_size,
                    capsule_config.stride,
                    capsule_config.padding,
                    rng,
                )?),

                LayerConfig::ClassCapsules {
                    input_capsules,
                    input_capsule_dim,
                    output_capsules,
                    output_capsule_dim,
                } => Box::new(ClassCapsLayer::new(
                    *input_capsules,
                    *input_capsule_dim,
                    *output_capsules,
                    *output_capsule_dim,
                    config.routing_iterations,
                    rng,
                )?),
            };

            layers.push(layer);
        }

        Ok(layers)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_config() {
        assert!(matches!(
            ModelBuilder::new().build(),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = ModelBuilder::new()
            .with_network_config(NetworkConfig::tiny(10))
            .with_seed(42)
            .build()
            .unwrap();
        let b = ModelBuilder::new()
            .with_network_config(NetworkConfig::tiny(10))
            .with_seed(42)
            .build()
            .unwrap();
        let c = ModelBuilder::new()
            .with_network_config(NetworkConfig::tiny(10))
            .with_seed(43)
            .build()
            .unwrap();

        let weights = |model: &CapNet| {
            model
                .named_parameters()
                .into_iter()
                .map(|(_, p)| p.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(weights(&a), weights(&b));
        assert_ne!(weights(&a), weights(&c));
    }

    #[test]
    fn test_layer_count() {
        let model = ModelBuilder::new()
            .with_network_config(NetworkConfig::default())
            .build()
            .unwrap();

        assert_eq!(model.layers.len(), 3);
        assert_eq!(model.num_classes(), 10);
        // conv 64x1x9x9 + 64, primaires 128x64x9x9 + 128, classes 10x8x16x16
        assert_eq!(
            model.num_parameters(),
            64 * 81 + 64 + 128 * 64 * 81 + 128 + 10 * 8 * 16 * 16
        );
    }
}
