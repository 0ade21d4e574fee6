use thiserror::Error;

/// Erreurs du modèle (construction, calcul, sauvegarde)
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("configuration invalide: {0}")]
    InvalidConfig(String),

    #[error("dimensions incompatibles: {0}")]
    ShapeMismatch(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("backward appelé avant forward ({0})")]
    MissingCache(&'static str),

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
