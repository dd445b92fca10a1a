//! The image database: config, tree and used set, loaded on demand and saved
//! once at the end of a command.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{Config, Overrides, Paths};
use crate::core::bktree::BkTree;
use crate::core::distance::{Hamming, HashValue};
use crate::core::order::sort_natural;
use crate::services::hash::{self, HashError, HashService};
use crate::services::paths::relative_path;
use crate::services::storage::{self, StorageError};

pub type ImageTree = BkTree<HashService, Hamming>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Could not hash {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: HashError,
    },

    #[error("Could not move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of trying to add an image to the tree.
#[derive(Debug)]
pub enum AddOutcome {
    Added(String),
    AlreadyPresent(String),
    /// The image could not be hashed; the tree was not changed.
    Unreadable(String, HashError),
}

/// Closest entry to a file that may or may not be in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub hash: HashValue,
    /// Identifier and distance of the nearest entry; `None` for an empty tree.
    pub closest: Option<(String, u32)>,
}

impl LookupResult {
    pub fn distance(&self) -> Option<u32> {
        self.closest.as_ref().map(|(_, distance)| *distance)
    }
}

/// Which file [`ImageDb::backup`] copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTarget {
    Used,
    Database,
}

pub struct ImageDb {
    config: Config,
    config_path: PathBuf,
    config_updated: bool,
    paths: Paths,
    show_json: bool,
    tree: Option<ImageTree>,
    tree_updated: bool,
    used: Option<HashSet<String>>,
    used_updated: bool,
}

impl ImageDb {
    /// Load the config and resolve file locations. The tree and the used set
    /// are read lazily.
    pub fn open(config_path: impl Into<PathBuf>, overrides: &Overrides) -> Result<Self, DbError> {
        let config_path = config_path.into();
        let (config, config_updated) = Config::load(&config_path)?;
        let paths = config.resolve(overrides);
        log::debug!("Resolved paths: {:?}", paths);

        Ok(Self {
            config,
            config_path,
            config_updated,
            paths,
            show_json: overrides.show_json,
            tree: None,
            tree_updated: false,
            used: None,
            used_updated: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn image_folder(&self) -> &Path {
        &self.paths.image_folder
    }

    /// Create default files and the image folder.
    pub fn init(&mut self) -> Result<(), DbError> {
        self.tree()?;
        self.used()?;
        self.config_updated = true;
        self.tree_updated = true;
        self.used_updated = true;
        let folder = &self.paths.image_folder;
        fs::create_dir_all(folder).map_err(|source| DbError::Io {
            path: folder.clone(),
            source,
        })
    }

    /// Rewrite every file on the next save, with indented JSON copies.
    pub fn rewrite_all(&mut self) -> Result<(), DbError> {
        self.tree()?;
        self.used()?;
        self.show_json = true;
        self.tree_updated = true;
        self.used_updated = true;
        Ok(())
    }

    pub fn tree(&mut self) -> Result<&ImageTree, DbError> {
        self.tree_mut().map(|tree| &*tree)
    }

    fn tree_mut(&mut self) -> Result<&mut ImageTree, DbError> {
        let tree = match self.tree.take() {
            Some(tree) => tree,
            None => {
                let hasher = HashService::new(&self.paths.image_folder);
                match storage::load_tree(&self.paths.database)? {
                    Some(root) => BkTree::from_root(root, hasher, Hamming),
                    None => {
                        log::info!(
                            "No database at {}, starting empty",
                            self.paths.database.display()
                        );
                        self.tree_updated = true;
                        BkTree::new(hasher, Hamming)
                    }
                }
            }
        };
        Ok(self.tree.insert(tree))
    }

    fn used(&mut self) -> Result<&mut HashSet<String>, DbError> {
        let used = match self.used.take() {
            Some(used) => used,
            None => match storage::load_used(&self.paths.usage_file)? {
                Some(used) => used,
                None => {
                    self.used_updated = true;
                    HashSet::new()
                }
            },
        };
        Ok(self.used.insert(used))
    }

    /// Identifier for a file: its path relative to the image folder.
    pub fn identifier_for(&self, file: &Path) -> String {
        relative_path(&self.paths.image_folder, file)
            .to_string_lossy()
            .into_owned()
    }

    /// Hash and add a file. Hash failures are reported, not raised.
    pub fn try_add_image(&mut self, file: &Path) -> Result<AddOutcome, DbError> {
        let identifier = self.identifier_for(file);
        let outcome = match self.tree_mut()?.add(&identifier) {
            Ok(true) => AddOutcome::Added(identifier),
            Ok(false) => AddOutcome::AlreadyPresent(identifier),
            Err(e) => {
                log::warn!("Failed to hash {}: {}", file.display(), e);
                AddOutcome::Unreadable(identifier, e)
            }
        };
        if matches!(outcome, AddOutcome::Added(_)) {
            self.tree_updated = true;
        }
        Ok(outcome)
    }

    /// Add an entry whose hash was computed elsewhere.
    pub fn add_hashed(&mut self, identifier: &str, hash: HashValue) -> Result<bool, DbError> {
        let added = self.tree_mut()?.insert(identifier, hash);
        self.tree_updated |= added;
        Ok(added)
    }

    pub fn remove_image(&mut self, file: &Path) -> Result<bool, DbError> {
        let identifier = self.identifier_for(file);
        let removed = self
            .tree_mut()?
            .remove(&identifier)
            .map_err(|source| DbError::Hash {
                path: file.to_path_buf(),
                source,
            })?;
        self.tree_updated |= removed;
        Ok(removed)
    }

    pub fn contains_image(&mut self, file: &Path) -> Result<bool, DbError> {
        let identifier = self.identifier_for(file);
        self.tree()?
            .contains(&identifier)
            .map_err(|source| DbError::Hash {
                path: file.to_path_buf(),
                source,
            })
    }

    /// Every entry within `tolerance` of the file's hash, with distances.
    pub fn find_similar(
        &mut self,
        file: &Path,
        tolerance: u32,
    ) -> Result<Vec<(String, u32)>, DbError> {
        let hash = hash_path(file)?;
        Ok(self
            .tree()?
            .lookup_all(hash, tolerance)
            .map(|found| (found.identifier.to_string(), found.distance))
            .collect())
    }

    pub fn find_closest(&mut self, file: &Path) -> Result<LookupResult, DbError> {
        let hash = hash_path(file)?;
        let closest = self
            .tree()?
            .lookup_distance(hash)
            .map(|(identifier, distance)| (identifier.to_string(), distance));
        Ok(LookupResult { hash, closest })
    }

    /// Move a file into the image folder under the next free name.
    pub fn move_to_image_folder(&self, file: &Path) -> Result<PathBuf, DbError> {
        let folder = &self.paths.image_folder;
        let io_error = |source| DbError::Io {
            path: folder.clone(),
            source,
        };
        fs::create_dir_all(folder).map_err(io_error)?;

        let ext = file
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let dest = next_file_path(folder, &ext, &self.config.name_format).map_err(io_error)?;
        move_file(file, &dest)?;
        log::info!("Moved {} to {}", file.display(), dest.display());
        Ok(dest)
    }

    /// Move a file into the image folder and add it.
    pub fn import(&mut self, file: &Path) -> Result<(PathBuf, AddOutcome), DbError> {
        let dest = self.move_to_image_folder(file)?;
        let outcome = self.try_add_image(&dest)?;
        Ok((dest, outcome))
    }

    pub fn is_used(&mut self, identifier: &str) -> Result<bool, DbError> {
        Ok(self.used()?.contains(identifier))
    }

    /// Returns false if it was already marked.
    pub fn mark_used(&mut self, identifier: &str) -> Result<bool, DbError> {
        let added = self.used()?.insert(identifier.to_string());
        self.used_updated |= added;
        Ok(added)
    }

    /// Returns false if it was not marked.
    pub fn unmark_used(&mut self, identifier: &str) -> Result<bool, DbError> {
        let removed = self.used()?.remove(identifier);
        self.used_updated |= removed;
        Ok(removed)
    }

    /// Used identifiers in natural order.
    pub fn used_sorted(&mut self) -> Result<Vec<String>, DbError> {
        let mut list: Vec<String> = self.used()?.iter().cloned().collect();
        sort_natural(&mut list);
        Ok(list)
    }

    /// Pick the first indexed image that has not been used yet and mark it.
    pub fn choose(&mut self) -> Result<Option<String>, DbError> {
        self.tree()?;
        self.used()?;
        let (Some(tree), Some(used)) = (&self.tree, &self.used) else {
            return Ok(None);
        };
        let chosen = tree
            .iter()
            .find(|identifier| !used.contains(*identifier))
            .map(str::to_string);
        if let Some(identifier) = &chosen {
            self.mark_used(identifier)?;
        }
        Ok(chosen)
    }

    /// Write a `.bak` copy of the used set (plain JSON) or the tree (gzip).
    pub fn backup(&mut self, target: BackupTarget) -> Result<PathBuf, DbError> {
        match target {
            BackupTarget::Used => {
                let output = self.paths.usage_file.with_extension("bak");
                let list = self.used_sorted()?;
                storage::write_json(&list, &output)?;
                Ok(output)
            }
            BackupTarget::Database => {
                let output = self.paths.database.with_extension("bak");
                let show_json = self.show_json;
                storage::save_tree(self.tree()?.root(), &output, show_json)?;
                Ok(output)
            }
        }
    }

    /// Write whatever changed.
    pub fn save(&mut self) -> Result<(), DbError> {
        if self.tree_updated {
            if let Some(tree) = &self.tree {
                storage::save_tree(tree.root(), &self.paths.database, self.show_json)?;
                log::info!("Saved database to {}", self.paths.database.display());
            }
            self.tree_updated = false;
        }
        if self.used_updated {
            if let Some(used) = &self.used {
                storage::save_used(used, &self.paths.usage_file, self.show_json)?;
                log::info!("Saved usage file to {}", self.paths.usage_file.display());
            }
            self.used_updated = false;
        }
        if self.config_updated {
            self.config.save(&self.config_path)?;
            log::info!("Saved config to {}", self.config_path.display());
            self.config_updated = false;
        }
        Ok(())
    }
}

fn hash_path(file: &Path) -> Result<HashValue, DbError> {
    hash::hash_file(file).map_err(|source| DbError::Hash {
        path: file.to_path_buf(),
        source,
    })
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<(), DbError> {
    let error = |source| DbError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(error)?;
    fs::remove_file(from).map_err(error)
}

/// Next free path in `dir` for `format`.
///
/// `{num}` is replaced by a number whose file stem is not taken yet, trying
/// `count + 1` first and then `1..=count`. `{ext}` is replaced by `ext`, which
/// is appended instead if the format has no `{ext}`.
pub fn next_file_path(dir: &Path, ext: &str, format: &str) -> std::io::Result<PathBuf> {
    let mut taken = HashSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(stem) = path.file_stem() {
            taken.insert(stem.to_os_string());
        }
    }

    let file_name = |num: usize| {
        let name = format.replace("{num}", &num.to_string());
        if name.contains("{ext}") {
            name.replace("{ext}", ext)
        } else {
            format!("{name}{ext}")
        }
    };

    let count = taken.len();
    let name = std::iter::once(count + 1)
        .chain(1..=count)
        .map(file_name)
        .find(|name| {
            Path::new(name)
                .file_stem()
                .is_some_and(|stem| !taken.contains(stem))
        })
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("No free file name for format {format:?}"),
            )
        })?;
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hash::tests::create_test_image;
    use tempfile::TempDir;

    fn open_in(dir: &Path) -> ImageDb {
        let overrides = Overrides {
            relative_base: Some(dir.to_path_buf()),
            ..Overrides::default()
        };
        ImageDb::open(dir.join("config.json"), &overrides).unwrap()
    }

    #[test]
    fn test_next_file_path() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        assert_eq!(
            next_file_path(dir, ".png", "image{num}{ext}").unwrap(),
            dir.join("image1.png")
        );

        fs::write(dir.join("image1.png"), b"").unwrap();
        fs::write(dir.join("image2.jpg"), b"").unwrap();
        assert_eq!(
            next_file_path(dir, ".png", "image{num}{ext}").unwrap(),
            dir.join("image3.png")
        );

        // A gap is reused once count + 1 is taken.
        fs::remove_file(dir.join("image1.png")).unwrap();
        fs::write(dir.join("image2.png"), b"").unwrap();
        assert_eq!(
            next_file_path(dir, ".gif", "image{num}{ext}").unwrap(),
            dir.join("image1.gif")
        );

        assert_eq!(
            next_file_path(dir, ".png", "pic_{num}").unwrap(),
            dir.join("pic_2.png")
        );

        fs::write(dir.join("cover.png"), b"").unwrap();
        assert!(next_file_path(dir, ".png", "cover").is_err());
    }

    #[test]
    fn test_init_creates_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut db = open_in(temp_dir.path());
        db.init().unwrap();
        db.save().unwrap();

        assert!(temp_dir.path().join("config.json").exists());
        assert!(temp_dir.path().join("images.dat").exists());
        assert!(temp_dir.path().join("used.dat").exists());
        assert!(temp_dir.path().join("images").is_dir());
    }

    #[test]
    fn test_import_lookup_remove_persist() {
        let temp_dir = TempDir::new().unwrap();
        let inbox = temp_dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        create_test_image(&inbox.join("h.png"), 64, 64, false, 0).unwrap();
        create_test_image(&inbox.join("v.png"), 64, 64, true, 0).unwrap();
        create_test_image(&inbox.join("h_copy.png"), 64, 64, false, 10).unwrap();

        let mut db = open_in(temp_dir.path());
        let (dest, outcome) = db.import(&inbox.join("h.png")).unwrap();
        assert!(matches!(outcome, AddOutcome::Added(ref id) if id == "image1.png"));
        assert_eq!(dest, temp_dir.path().join("images").join("image1.png"));
        assert!(!inbox.join("h.png").exists());
        db.import(&inbox.join("v.png")).unwrap();

        // Adding the same file again is a no-op.
        assert!(matches!(
            db.try_add_image(&dest).unwrap(),
            AddOutcome::AlreadyPresent(_)
        ));

        let closest = db.find_closest(&inbox.join("h_copy.png")).unwrap();
        let (identifier, distance) = closest.closest.clone().unwrap();
        assert_eq!(identifier, "image1.png");
        assert!(distance <= 4);

        let similar = db.find_similar(&inbox.join("h_copy.png"), distance).unwrap();
        assert!(similar.iter().any(|(id, _)| id == "image1.png"));
        db.save().unwrap();

        let mut reopened = open_in(temp_dir.path());
        assert!(reopened.contains_image(&dest).unwrap());
        assert_eq!(reopened.tree().unwrap().len(), 2);
        assert!(reopened.remove_image(&dest).unwrap());
        assert!(!reopened.contains_image(&dest).unwrap());
        reopened.save().unwrap();

        let mut again = open_in(temp_dir.path());
        assert_eq!(
            again.tree().unwrap().iter().collect::<Vec<_>>(),
            vec!["image2.png"]
        );
    }

    #[test]
    fn test_unreadable_image_not_added() {
        let temp_dir = TempDir::new().unwrap();
        let mut db = open_in(temp_dir.path());
        let images = temp_dir.path().join("images");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("junk.png"), b"junk").unwrap();

        let outcome = db.try_add_image(&images.join("junk.png")).unwrap();
        assert!(matches!(outcome, AddOutcome::Unreadable(ref id, _) if id == "junk.png"));
        assert!(db.tree().unwrap().is_empty());
    }

    #[test]
    fn test_used_set_and_choose() {
        let temp_dir = TempDir::new().unwrap();
        let mut db = open_in(temp_dir.path());
        db.add_hashed("image1.png", 0).unwrap();
        db.add_hashed("image2.png", u64::MAX).unwrap();

        assert!(db.mark_used("image1.png").unwrap());
        assert!(!db.mark_used("image1.png").unwrap());
        assert_eq!(db.choose().unwrap(), Some("image2.png".to_string()));
        assert_eq!(db.choose().unwrap(), None);
        assert_eq!(db.used_sorted().unwrap(), vec!["image1.png", "image2.png"]);

        assert!(db.unmark_used("image2.png").unwrap());
        assert!(!db.unmark_used("image2.png").unwrap());
        db.save().unwrap();

        let mut reopened = open_in(temp_dir.path());
        assert!(reopened.is_used("image1.png").unwrap());
        assert!(!reopened.is_used("image2.png").unwrap());
    }

    #[test]
    fn test_backup_targets() {
        let temp_dir = TempDir::new().unwrap();
        let mut db = open_in(temp_dir.path());
        db.add_hashed("image1.png", 7).unwrap();
        db.mark_used("image1.png").unwrap();

        let used_backup = db.backup(BackupTarget::Used).unwrap();
        assert_eq!(used_backup, temp_dir.path().join("used.bak"));
        let list: Vec<String> =
            serde_json::from_str(&fs::read_to_string(&used_backup).unwrap()).unwrap();
        assert_eq!(list, vec!["image1.png"]);

        let db_backup = db.backup(BackupTarget::Database).unwrap();
        assert_eq!(db_backup, temp_dir.path().join("images.bak"));
        let root = storage::load_tree(&db_backup).unwrap().unwrap().unwrap();
        assert_eq!(root.identifier(), "image1.png");
    }
}
