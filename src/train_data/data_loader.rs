use ndarray::{Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use flate2::read::GzDecoder;

/// Moyenne et écart-type des pixels MNIST (après division par 255)
pub const MNIST_MEAN: f32 = 0.1307;
pub const MNIST_STD: f32 = 0.3081;

// Miroir CVDF des fichiers de Yann LeCun
const MIRROR: &str = "https://storage.googleapis.com/cvdf-datasets/mnist/";
const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

/// Erreurs de chargement des données
#[derive(Debug, Error)]
pub enum DataError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("téléchargement de {url} impossible: {source}")]
    Download { url: String, source: reqwest::Error },

    #[error("{}: nombre magique {found} au lieu de {expected}", path.display())]
    BadMagic {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("{}: fichier tronqué ({actual} octets, {expected} attendus)", path.display())]
    Truncated {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("partition {0} vide")]
    EmptySplit(&'static str),

    #[error("{images} images pour {labels} étiquettes")]
    CountMismatch { images: usize, labels: usize },

    #[error("étiquette {label} hors de [0, {num_classes})")]
    LabelOutOfRange { label: usize, num_classes: usize },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn files(self) -> (&'static str, &'static str) {
        match self {
            Split::Train => (TRAIN_IMAGES, TRAIN_LABELS),
            Split::Test => (TEST_IMAGES, TEST_LABELS),
        }
    }
}

/// Jeu MNIST en mémoire, images normalisées (N, 1, 28, 28)
#[derive(Debug, Clone)]
pub struct MnistDataset {
    pub images: Array4<f32>,
    pub labels: Vec<u8>,
}

/// Un batch prêt pour le modèle
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl MnistDataset {
    /// Télécharge les fichiers manquants dans `root`
    pub fn download(root: &Path) -> Result<(), DataError> {
        fs::create_dir_all(root).map_err(|source| DataError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        for name in [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS] {
            let file_name = root.join(name);
            if file_name.exists() {
                debug!(file = %file_name.display(), "déjà présent");
                continue;
            }

            let url = format!("{MIRROR}{name}.gz");
            info!(%url, "⬇️  téléchargement");
            let compressed = reqwest::blocking::get(&url)
                .and_then(|response| response.error_for_status())
                .and_then(|response| response.bytes())
                .map_err(|source| DataError::Download {
                    url: url.clone(),
                    source,
                })?;

            store_gunzipped(&compressed, &file_name)?;
        }

        Ok(())
    }

    /// Charge une partition depuis les fichiers IDX décompressés
    pub fn load(root: &Path, split: Split) -> Result<Self, DataError> {
        let start = Instant::now();
        let (images_name, labels_name) = split.files();

        let images = read_images(&root.join(images_name))?;
        let labels = read_labels(&root.join(labels_name))?;
        let dataset = Self::from_parts(images, labels)?;

        info!(
            ?split,
            samples = dataset.len(),
            elapsed = ?start.elapsed(),
            "📁 données chargées"
        );
        Ok(dataset)
    }

    pub fn from_parts(images: Array4<f32>, labels: Vec<u8>) -> Result<Self, DataError> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(DataError::CountMismatch {
                images: images.len_of(Axis(0)),
                labels: labels.len(),
            });
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Extrait les exemples d'indices donnés, dans cet ordre
    pub fn batch(&self, indices: &[usize]) -> Batch {
        Batch {
            images: self.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i] as usize).collect(),
        }
    }
}

/// Décompresse dans `<fichier>.tmp` puis renomme: un fichier présent est toujours complet
fn store_gunzipped(compressed: &[u8], file_name: &Path) -> Result<(), DataError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| DataError::Io { path, source }
    };

    let mut raw = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut raw)
        .map_err(io_error(file_name))?;

    let tmp = file_name.with_extension("tmp");
    fs::write(&tmp, raw).map_err(io_error(&tmp))?;
    fs::rename(&tmp, file_name).map_err(io_error(file_name))
}

fn read_file(path: &Path) -> Result<Vec<u8>, DataError> {
    fs::read(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn be_u32(bytes: &[u8], offset: usize, path: &Path) -> Result<u32, DataError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| DataError::Truncated {
            path: path.to_path_buf(),
            expected: offset + 4,
            actual: bytes.len(),
        })
}

fn check_magic(bytes: &[u8], expected: u32, path: &Path) -> Result<(), DataError> {
    let found = be_u32(bytes, 0, path)?;
    if found != expected {
        return Err(DataError::BadMagic {
            path: path.to_path_buf(),
            expected,
            found,
        });
    }
    Ok(())
}

fn payload<'b>(
    bytes: &'b [u8],
    header: usize,
    count: usize,
    path: &Path,
) -> Result<&'b [u8], DataError> {
    let end = header.checked_add(count).unwrap_or(usize::MAX);
    bytes.get(header..end).ok_or_else(|| DataError::Truncated {
        path: path.to_path_buf(),
        expected: end,
        actual: bytes.len(),
    })
}

/// Fichier d'images IDX3: magic, n, lignes, colonnes, puis n·l·c octets
fn read_images(path: &Path) -> Result<Array4<f32>, DataError> {
    let bytes = read_file(path)?;
    check_magic(&bytes, IMAGES_MAGIC, path)?;

    let count = be_u32(&bytes, 4, path)? as usize;
    let rows = be_u32(&bytes, 8, path)? as usize;
    let cols = be_u32(&bytes, 12, path)? as usize;
    debug!(file = %path.display(), count, rows, cols, "en-tête IDX images");

    // En-tête corrompu: la taille saturée est signalée comme troncature
    let size = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .unwrap_or(usize::MAX);
    let pixels = payload(&bytes, 16, size, path)?;
    let normalized = pixels
        .iter()
        .map(|&p| (p as f32 / 255.0 - MNIST_MEAN) / MNIST_STD)
        .collect();

    Ok(Array4::from_shape_vec((count, 1, rows, cols), normalized)?)
}

/// Fichier d'étiquettes IDX1: magic, n, puis n octets
fn read_labels(path: &Path) -> Result<Vec<u8>, DataError> {
    let bytes = read_file(path)?;
    check_magic(&bytes, LABELS_MAGIC, path)?;

    let count = be_u32(&bytes, 4, path)? as usize;
    debug!(file = %path.display(), count, "en-tête IDX étiquettes");

    Ok(payload(&bytes, 8, count, path)?.to_vec())
}

/// Découpe un jeu en batches, mélangés à chaque passage si demandé
pub struct DataLoader<'a> {
    dataset: &'a MnistDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a MnistDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Nombre de batches (le dernier peut être incomplet)
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    pub fn iter(&mut self) -> impl Iterator<Item = Batch> + 'a {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }

        let dataset = self.dataset;
        let batch_size = self.batch_size;
        (0..self.len()).map(move |b| {
            let start = b * batch_size;
            let end = (start + batch_size).min(order.len());
            dataset.batch(&order[start..end])
        })
    }
}
