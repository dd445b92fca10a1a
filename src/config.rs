use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::services::storage::{self, StorageError};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Contents of `config.json`.
///
/// Keys are PascalCase (`Database`, `UsageFile`, ...); missing keys take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    /// Tree file.
    pub database: PathBuf,
    /// Set of identifiers marked as used.
    pub usage_file: PathBuf,
    /// Folder holding the indexed images; identifiers are relative to it.
    pub image_folder: PathBuf,
    /// Name for files moved into the image folder. `{num}` becomes a free
    /// number, `{ext}` the original extension including the dot.
    pub name_format: String,
    /// Base for the relative paths above. Current directory when unset.
    pub relative_base: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("images.dat"),
            usage_file: PathBuf::from("used.dat"),
            image_folder: PathBuf::from("images"),
            name_format: "image{num}{ext}".to_string(),
            relative_base: None,
        }
    }
}

/// Command line overrides for the config values.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub folder: Option<PathBuf>,
    pub usage_file: Option<PathBuf>,
    pub relative_base: Option<PathBuf>,
    /// Write indented `.json` copies next to the compressed files.
    pub show_json: bool,
}

/// Effective file locations after overrides and the relative base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub database: PathBuf,
    pub usage_file: PathBuf,
    pub image_folder: PathBuf,
}

impl Config {
    /// Load the config, falling back to defaults when the file is missing.
    /// The flag is true when defaults were used.
    pub fn load(path: &Path) -> Result<(Self, bool), StorageError> {
        match storage::read_json(path)? {
            Some(config) => Ok((config, false)),
            None => {
                log::info!("No config at {}, using defaults", path.display());
                Ok((Self::default(), true))
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        storage::write_json(self, path)
    }

    pub fn resolve(&self, overrides: &Overrides) -> Paths {
        let base = overrides
            .relative_base
            .as_deref()
            .or(self.relative_base.as_deref());
        let locate = |value: &Path| match base {
            Some(base) if value.is_relative() => base.join(value),
            _ => value.to_path_buf(),
        };

        Paths {
            database: locate(overrides.database.as_deref().unwrap_or(&self.database)),
            usage_file: locate(overrides.usage_file.as_deref().unwrap_or(&self.usage_file)),
            image_folder: locate(overrides.folder.as_deref().unwrap_or(&self.image_folder)),
        }
    }
}
