//! Path sandbox guard.
//!
//! Every file tool resolves its target through [`resolve`] before touching the
//! filesystem. The guard joins the requested subpath onto the allowed root,
//! normalizes `.` and `..` lexically, then canonicalizes the deepest existing
//! ancestor so that symlinks pointing outside the root are caught even when
//! the final component does not exist yet (as for `write_file`).

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Resolve `subpath` against `root`.
///
/// Returns the absolute target if it is `root` itself or lies below it. An
/// empty `subpath` resolves to `root`. An empty `root` rejects everything.
pub fn resolve(root: &Path, subpath: &str) -> Result<PathBuf> {
    if root.as_os_str().is_empty() {
        return Err(Error::Configuration("no allowed directory configured".into()));
    }

    let root = root.canonicalize().map_err(|e| {
        Error::Configuration(format!(
            "allowed directory {} is not accessible: {}",
            root.display(),
            e
        ))
    })?;

    let joined = if subpath.is_empty() {
        root.clone()
    } else {
        root.join(subpath)
    };

    let normalized = normalize(&joined);
    if !normalized.starts_with(&root) {
        return Err(violation(subpath));
    }

    let resolved = canonicalize_existing(&normalized).ok_or_else(|| violation(subpath))?;
    if !resolved.starts_with(&root) {
        return Err(violation(subpath));
    }

    Ok(resolved)
}

fn violation(subpath: &str) -> Error {
    Error::SandboxViolation(format!("path traversal detected: {subpath}"))
}

/// Lexical normalization; `..` never climbs above the filesystem root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str())
            }
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
        }
    }
    out
}

/// Canonicalize the longest existing prefix and re-append the rest.
///
/// Returns `None` for a dangling symlink, whose target cannot be checked.
fn canonicalize_existing(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut missing: Vec<OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(mut canonical) => {
                for name in missing.iter().rev() {
                    canonical.push(name);
                }
                return Some(canonical);
            }
            Err(_) => {
                if existing.symlink_metadata().is_ok() {
                    return None;
                }
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Some(path.to_path_buf());
                };
                missing.push(name.to_os_string());
                existing = parent;
            }
        }
    }
}
