//! Workspace path resolution with security checks.
//!
//! This is the only component that touches raw caller paths. Every tool
//! handler receives an already-validated absolute path. Resolution order:
//! null-byte rejection, join to the root, lexical `.`/`..` folding, symlink
//! canonicalization (tolerating a missing tail), containment check. Folding
//! dot segments before touching the filesystem means a `..` can never ride
//! through a not-yet-existing prefix.

use crate::error::ToolError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub struct WorkspaceResolver {
    root: PathBuf,
}

impl WorkspaceResolver {
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path to an absolute path strictly inside
    /// the workspace root. Fails with `security` on null bytes, traversal,
    /// or symlink escape.
    pub fn resolve(&self, user_path: &str) -> Result<PathBuf, ToolError> {
        if user_path.contains('\0') {
            return Err(ToolError::security("Path contains null bytes"));
        }
        let candidate = Path::new(user_path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = lexical_normalize(&joined);
        let resolved = canonicalize_allowing_missing(&normalized)
            .map_err(|e| ToolError::security(format!("Cannot resolve path '{user_path}': {e}")))?;
        if !self.contains(&resolved) {
            return Err(ToolError::security(format!(
                "Path '{user_path}' resolves outside the workspace boundary"
            ))
            .with_suggestion("Ensure the path is within the workspace boundary".to_string()));
        }
        debug!(user_path, resolved = %resolved.display(), "path resolved");
        Ok(resolved)
    }

    fn contains(&self, resolved: &Path) -> bool {
        resolved == self.root || resolved.starts_with(&self.root)
    }

    pub fn is_within(&self, path: &Path) -> bool {
        match canonicalize_allowing_missing(&lexical_normalize(path)) {
            Ok(resolved) => self.contains(&resolved),
            Err(_) => false,
        }
    }
}

/// Fold `.` and `..` components without consulting the filesystem. A `..`
/// at the root is dropped rather than escaping upward.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

/// Canonicalize `path`, tolerating a missing tail: the deepest existing
/// ancestor is canonicalized and the remainder is appended. The input must
/// already be lexically normalized (no dot segments).
fn canonicalize_allowing_missing(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while let Some(parent) = existing.parent() {
        match existing.file_name() {
            Some(name) => tail.push(name.to_os_string()),
            None => break,
        }
        let parent = parent.to_path_buf();
        if let Ok(resolved) = parent.canonicalize() {
            let mut out = resolved;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return Ok(out);
        }
        existing = parent;
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no existing ancestor",
    ))
}
