//! Lexical path handling. Nothing here touches the filesystem, so paths through
//! folders that do not exist yet resolve the same as any other.

use std::path::{Component, Path, PathBuf};

/// `path` expressed relative to `base`.
pub fn relative_path(base: &Path, path: &Path) -> PathBuf {
    let base = normalize(base);
    let path = normalize(path);
    let common = base
        .components()
        .zip(path.components())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in base.components().skip(common) {
        relative.push("..");
    }
    for component in path.components().skip(common) {
        relative.push(component);
    }
    relative
}

/// Absolute path with `.` and `..` resolved lexically.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("/a/images"), Path::new("/a/images/x.png")),
            PathBuf::from("x.png")
        );
        assert_eq!(
            relative_path(Path::new("/a/images"), Path::new("/a/images/sub/../y.png")),
            PathBuf::from("y.png")
        );
        assert_eq!(
            relative_path(Path::new("/a/images"), Path::new("/a/other/z.png")),
            PathBuf::from("../other/z.png")
        );
    }

    #[test]
    fn test_normalize_resolves_parent_components() {
        assert_eq!(
            normalize(Path::new("/data/missing/../inbox/./a.png")),
            PathBuf::from("/data/inbox/a.png")
        );
        assert_eq!(normalize(Path::new("/..")), PathBuf::from("/"));
    }
}
