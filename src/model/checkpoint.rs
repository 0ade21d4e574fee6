use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ndarray::ArrayView4;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tracing::{debug, info};

use super::core::CapNet;
use super::error::ModelError;

const CONFIG_KEY: &str = "network_config";
const STEPS_KEY: &str = "optimizer_steps";

/// Sauvegarde des paramètres au format safetensors
pub fn save(model: &CapNet, path: &Path) -> Result<(), ModelError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tensor_data: Vec<(String, Vec<u8>, Vec<usize>)> = model
        .named_parameters()
        .into_iter()
        .map(|(name, param)| {
            let values: Vec<f32> = param.iter().copied().collect();
            let bytes = bytemuck::cast_slice::<f32, u8>(&values).to_vec();
            (name, bytes, param.shape().to_vec())
        })
        .collect();

    let views = tensor_data
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| ModelError::Checkpoint(format!("{name}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut metadata = HashMap::new();
    metadata.insert(
        CONFIG_KEY.to_string(),
        serde_json::to_string(&model.network_config)?,
    );
    metadata.insert(
        STEPS_KEY.to_string(),
        model.state.optimizer_steps.to_string(),
    );

    let bytes = safetensors::serialize(views, Some(metadata))
        .map_err(|e| ModelError::Checkpoint(format!("sérialisation: {e}")))?;
    fs::write(path, bytes)?;

    info!(
        path = %path.display(),
        tensors = tensor_data.len(),
        "💾 paramètres sauvegardés"
    );
    Ok(())
}

/// Recharge les paramètres dans un modèle de même architecture
pub fn load_into(model: &mut CapNet, path: &Path) -> Result<(), ModelError> {
    let buffer = fs::read(path)?;

    let (_, header) = SafeTensors::read_metadata(&buffer)
        .map_err(|e| ModelError::Checkpoint(format!("en-tête: {e}")))?;
    if let Some(saved) = header.metadata().as_ref().and_then(|m| m.get(CONFIG_KEY)) {
        let expected = serde_json::to_string(&model.network_config)?;
        if *saved != expected {
            return Err(ModelError::Checkpoint(
                "architecture différente de celle du modèle".to_string(),
            ));
        }
    }
    let steps = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(STEPS_KEY))
        .and_then(|s| s.parse::<usize>().ok());

    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| ModelError::Checkpoint(format!("désérialisation: {e}")))?;

    for (name, param) in model.named_parameters_mut() {
        let tensor = tensors
            .tensor(&name)
            .map_err(|_| ModelError::Checkpoint(format!("tenseur manquant: {name}")))?;

        if tensor.dtype() != Dtype::F32 {
            return Err(ModelError::Checkpoint(format!(
                "{name}: type {:?} au lieu de F32",
                tensor.dtype()
            )));
        }
        if tensor.shape() != param.value.shape() {
            return Err(ModelError::ShapeMismatch(format!(
                "{name}: {:?} au lieu de {:?}",
                tensor.shape(),
                param.value.shape()
            )));
        }

        let values: Vec<f32> = bytemuck::pod_collect_to_vec(tensor.data());
        let view = ArrayView4::from_shape(param.value.dim(), &values)?;
        param.value.assign(&view);
        debug!(%name, "tenseur restauré");
    }

    if let Some(steps) = steps {
        model.state.optimizer_steps = steps;
    }
    info!(path = %path.display(), "📂 paramètres chargés");
    Ok(())
}
