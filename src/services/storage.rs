//! Reading and writing the database files.
//!
//! The tree and the used set are stored as gzip compressed JSON; the config and
//! backups of the used set are plain, indented JSON.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::bktree::Node;
use crate::core::order::sort_natural;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed data in {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn serde(path: &Path, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk shape of the tree file.
#[derive(Debug, Serialize, Deserialize)]
struct TreeFile<N> {
    root: Option<N>,
}

fn open(path: &Path) -> Result<Option<File>, StorageError> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

fn create(path: &Path) -> Result<File, StorageError> {
    File::create(path).map_err(|e| StorageError::io(path, e))
}

fn deserialize<T: DeserializeOwned, R: Read>(reader: R, path: &Path) -> Result<T, StorageError> {
    let mut de = serde_json::Deserializer::from_reader(reader);
    // Tree depth is unbounded: lift serde_json's nesting limit and grow the
    // stack as needed instead.
    de.disable_recursion_limit();
    let value = T::deserialize(serde_stacker::Deserializer::new(&mut de))
        .map_err(|e| StorageError::serde(path, e))?;
    de.end().map_err(|e| StorageError::serde(path, e))?;
    Ok(value)
}

/// Read gzip compressed JSON. A missing file yields `None`.
pub fn read_gzipped<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let Some(file) = open(path)? else {
        return Ok(None);
    };
    let reader = BufReader::new(GzDecoder::new(BufReader::new(file)));
    deserialize(reader, path).map(Some)
}

/// Write compact JSON through gzip. With `plain`, an indented copy is also
/// written to `<path>.json`.
pub fn write_gzipped<T: Serialize>(value: &T, path: &Path, plain: bool) -> Result<(), StorageError> {
    let file = create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::best());
    serde_json::to_writer(&mut encoder, value).map_err(|e| StorageError::serde(path, e))?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .map_err(|e| StorageError::io(path, e))?;

    if plain {
        write_json(value, &plain_path(path))?;
    }
    Ok(())
}

/// Read plain JSON. A missing file yields `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let Some(file) = open(path)? else {
        return Ok(None);
    };
    deserialize(BufReader::new(file), path).map(Some)
}

/// Write indented JSON.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), StorageError> {
    let mut writer = BufWriter::new(create(path)?);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| StorageError::serde(path, e))?;
    writer.flush().map_err(|e| StorageError::io(path, e))
}

/// `images.dat` -> `images.dat.json`
pub fn plain_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Load the stored tree root. `None` if the file does not exist; `Some(None)`
/// for a stored empty tree.
pub fn load_tree(path: &Path) -> Result<Option<Option<Node>>, StorageError> {
    Ok(read_gzipped::<TreeFile<Node>>(path)?.map(|file| file.root))
}

pub fn save_tree(root: Option<&Node>, path: &Path, plain: bool) -> Result<(), StorageError> {
    write_gzipped(&TreeFile { root }, path, plain)
}

pub fn load_used(path: &Path) -> Result<Option<HashSet<String>>, StorageError> {
    read_gzipped(path)
}

/// Save the used set, naturally ordered so the plain copy is readable.
pub fn save_used(used: &HashSet<String>, path: &Path, plain: bool) -> Result<(), StorageError> {
    write_gzipped(&sorted(used), path, plain)
}

/// The used set as a naturally ordered list.
pub fn sorted(used: &HashSet<String>) -> Vec<&str> {
    let mut list: Vec<&str> = used.iter().map(String::as_str).collect();
    sort_natural(&mut list);
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bktree::BkTree;
    use crate::core::distance::Hamming;
    use std::convert::Infallible;
    use std::fs;
    use tempfile::TempDir;

    fn no_hasher(_: &str) -> Result<u64, Infallible> {
        Ok(0)
    }

    #[test]
    fn test_missing_files_read_as_none() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.dat");
        assert!(load_tree(&path).unwrap().is_none());
        assert!(load_used(&path).unwrap().is_none());
        assert!(read_json::<serde_json::Value>(&path).unwrap().is_none());
    }

    #[test]
    fn test_tree_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("images.dat");

        let mut tree = BkTree::new(no_hasher, Hamming);
        tree.insert("image1.png", 0b1010);
        tree.insert("image2.png", 0b1011);
        tree.insert("image3.png", u64::MAX);
        save_tree(tree.root(), &path, true).unwrap();

        let root = load_tree(&path).unwrap().unwrap();
        assert_eq!(root.as_ref(), tree.root());
        let restored = BkTree::from_root(root, no_hasher, Hamming);
        assert_eq!(restored.lookup_distance(0b1011), Some(("image2.png", 0)));

        // The plain copy is readable JSON with the nested node layout.
        let plain: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(plain_path(&path)).unwrap()).unwrap();
        assert_eq!(plain["root"]["identifier"], "image1.png");
        assert_eq!(plain["root"]["children"]["1"]["identifier"], "image2.png");
    }

    #[test]
    fn test_empty_tree_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("images.dat");
        save_tree(None, &path, false).unwrap();
        assert_eq!(load_tree(&path).unwrap(), Some(None));
        assert!(!plain_path(&path).exists());
    }

    #[test]
    fn test_deep_tree_loads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("deep.dat");

        // Every pair of distinct hashes is at distance 1, so the entries form one chain.
        let mut tree = BkTree::new(no_hasher, |a: u64, b: u64| u32::from(a != b));
        for i in 0..300u64 {
            tree.insert(format!("image{i}.png"), i);
        }
        save_tree(tree.root(), &path, false).unwrap();
        let root = load_tree(&path).unwrap().unwrap();
        assert_eq!(root.as_ref(), tree.root());
    }

    #[test]
    fn test_chain_of_identical_hashes_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("copies.dat");

        // Identical hashes nest along edge 0, one level per entry.
        let mut tree = BkTree::new(no_hasher, Hamming);
        for i in 0..5_000u64 {
            tree.insert(format!("copy{i}.png"), 0);
        }
        save_tree(tree.root(), &path, false).unwrap();
        drop(tree);

        let restored = BkTree::from_root(load_tree(&path).unwrap().unwrap(), no_hasher, Hamming);
        assert_eq!(restored.len(), 5_000);
        assert!(restored.contains_hashed("copy4999.png", 0));
    }

    #[test]
    fn test_used_set_round_trip_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("used.dat");
        let used: HashSet<String> = ["image10.png", "image2.png", "image1.png"]
            .into_iter()
            .map(String::from)
            .collect();

        save_used(&used, &path, true).unwrap();
        assert_eq!(load_used(&path).unwrap(), Some(used));

        let plain: Vec<String> =
            serde_json::from_str(&fs::read_to_string(plain_path(&path)).unwrap()).unwrap();
        assert_eq!(plain, vec!["image1.png", "image2.png", "image10.png"]);
    }

    #[test]
    fn test_corrupt_file_reports_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
        assert!(err.to_string().contains("config.json"));
    }
}
