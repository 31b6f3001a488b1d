use std::path::{Component, Path, PathBuf};

use spaces_integrations::ids::TRANSFER_TMP_SUFFIX;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("entry path is empty")]
    Empty,
    #[error("entry path contains unsupported component")]
    UnsupportedComponent,
    #[error("path is outside of the tree root: {0}")]
    OutsideRoot(PathBuf),
}

/// Which of the two managed trees a path lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tree {
    Source,
    Mirror,
}

#[derive(Debug, Clone)]
pub struct TreeRoots {
    pub source: PathBuf,
    pub mirror: PathBuf,
}

impl TreeRoots {
    pub fn new(source: impl Into<PathBuf>, mirror: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            mirror: mirror.into(),
        }
    }

    pub fn source_path(&self, entry_path: &str) -> Result<PathBuf, PathError> {
        tree_path_for(&self.source, entry_path)
    }

    pub fn mirror_path(&self, entry_path: &str) -> Result<PathBuf, PathError> {
        tree_path_for(&self.mirror, entry_path)
    }

    /// Maps an absolute path from either tree back to its entry path.
    pub fn classify(&self, path: &Path) -> Option<(Tree, String)> {
        if let Some(entry) = entry_path_for(&self.source, path) {
            return Some((Tree::Source, entry));
        }
        entry_path_for(&self.mirror, path).map(|entry| (Tree::Mirror, entry))
    }
}

pub fn tree_path_for(root: &Path, entry_path: &str) -> Result<PathBuf, PathError> {
    if entry_path.is_empty() {
        return Err(PathError::Empty);
    }

    // Entry paths are POSIX-like ("/Docs/A.txt"); map them under the root.
    let mut out = root.to_path_buf();
    for component in Path::new(entry_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Entry path of `path` below `root`. Names that are not valid UTF-8 cannot
/// be stored and are skipped with a warning.
pub fn entry_path_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let Some(relative) = relative.to_str() else {
        tracing::warn!(path = ?path, "skipping path with a non UTF-8 name");
        return None;
    };
    Some(format!("/{relative}"))
}

pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        Some("/".to_string())
    } else {
        Some(parent.to_string())
    }
}

/// Ancestors of an entry path, nearest first, excluding the tree root.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = parent_path(path);
    while let Some(parent) = current {
        if parent == "/" {
            break;
        }
        current = parent_path(&parent);
        out.push(parent);
    }
    out
}

pub fn file_name(path: &str) -> String {
    path.rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or(path)
        .to_string()
}

pub fn is_descendant_of(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Sibling temp file used while a transfer into `target` is in flight.
pub fn transfer_tmp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(TRANSFER_TMP_SUFFIX);
    target.with_file_name(name)
}

pub fn is_transfer_tmp(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TRANSFER_TMP_SUFFIX))
}
