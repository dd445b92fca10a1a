use image::ImageReader;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::bktree::HashSource;
use crate::core::distance::HashValue;
use crate::core::phash::{self, PHashError};
use crate::services::paths::normalize;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Hash computation failed: {0}")]
    Hash(#[from] PHashError),
}

/// Compute the perceptual hash of an image file.
pub fn hash_file(path: &Path) -> Result<HashValue, HashError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(phash::hash_image(&image)?)
}

/// Hashes identifiers that are paths relative to an image folder.
#[derive(Debug, Clone)]
pub struct HashService {
    image_dir: PathBuf,
}

impl HashService {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Hash several identifiers in parallel, keeping their order.
    pub fn hash_batch<S>(&self, identifiers: &[S]) -> Vec<Result<HashValue, HashError>>
    where
        S: AsRef<str> + Sync,
    {
        identifiers
            .par_iter()
            .map(|identifier| self.hash_of(identifier.as_ref()))
            .collect()
    }
}

impl HashSource for HashService {
    type Error = HashError;

    /// `..` in the identifier is resolved lexically, so files outside the
    /// image folder hash even when the folder itself does not exist.
    fn hash_of(&self, identifier: &str) -> Result<HashValue, HashError> {
        hash_file(&normalize(&self.image_dir.join(identifier)))
    }
}
