//! Filesystem confinement: resolve untrusted relative paths under a fixed root.
//!
//! Both roots passed in here must already be canonical. Lexical escapes are
//! refused before the filesystem is touched; symlink escapes are caught after
//! canonicalization.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfineError {
    #[error("path escapes its root: {path}")]
    Escape { path: String },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Resolve `target` to an existing path inside `root`.
pub fn confine_existing(root: &Path, target: &str) -> Result<PathBuf, ConfineError> {
    let relative = lexical_relative(target)?;
    let candidate = root.join(relative);
    let resolved = candidate.canonicalize().map_err(|source| ConfineError::Io {
        path: target.to_string(),
        source,
    })?;
    if !resolved.starts_with(root) {
        debug!(target, resolved = %resolved.display(), "symlink escape");
        return Err(ConfineError::Escape {
            path: target.to_string(),
        });
    }
    Ok(resolved)
}

/// Resolve `target` to a directory inside `root`, creating missing components.
///
/// Each component is checked as it is created or entered, so a symlink planted
/// inside `root` cannot redirect creation elsewhere.
pub fn confine_dir(root: &Path, target: &str) -> Result<PathBuf, ConfineError> {
    let relative = lexical_relative(target)?;
    let mut current = root.to_path_buf();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        let next = current.join(part);
        if fs::symlink_metadata(&next).is_err() {
            fs::create_dir(&next).map_err(|source| ConfineError::Io {
                path: target.to_string(),
                source,
            })?;
        }
        let resolved = next.canonicalize().map_err(|source| ConfineError::Io {
            path: target.to_string(),
            source,
        })?;
        if !resolved.starts_with(root) {
            return Err(ConfineError::Escape {
                path: target.to_string(),
            });
        }
        if !resolved.is_dir() {
            return Err(ConfineError::Io {
                path: target.to_string(),
                source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
            });
        }
        current = resolved;
    }
    Ok(current)
}

/// Normalize `target` lexically, refusing absolute paths and `..` that climbs
/// above the root.
fn lexical_relative(target: &str) -> Result<PathBuf, ConfineError> {
    let escape = || ConfineError::Escape {
        path: target.to_string(),
    };
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(target).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    Ok(parts.iter().collect())
}
