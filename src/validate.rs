//! Path and quota validation at every public entry point.
//!
//! Paths arriving from callers are resolved against the store's base
//! directory, never the process working directory. Inputs are NFC-normalized
//! before resolution so visually-identical names map to one file, and
//! anything that would land outside the base directory is rejected.

use std::path::{Component, Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PathValidator {
    base: PathBuf,
}

impl PathValidator {
    /// The base directory must exist; it is canonicalized once so later
    /// prefix checks compare real paths.
    pub fn new(base: &Path) -> Result<PathValidator> {
        let base = base
            .canonicalize()
            .map_err(|e| Error::io(base.to_path_buf(), e))?;
        Ok(PathValidator { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve a caller-supplied relative path to a real path inside the
    /// base directory, or fail with `InvalidPath`.
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf> {
        let reject = |reason: &str| Error::InvalidPath {
            path: PathBuf::from(candidate),
            reason: reason.to_string(),
        };

        if candidate.is_empty() {
            return Err(reject("empty path"));
        }
        if candidate.bytes().any(|b| b == 0) {
            return Err(reject("contains a NUL byte"));
        }

        let normalized: String = candidate.nfc().collect();
        let path = Path::new(&normalized);

        let mut resolved = self.base.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(reject("contains `..` after resolution"));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(reject("absolute paths are not accepted"));
                }
            }
        }

        if !resolved.starts_with(&self.base) {
            return Err(reject("escapes the base directory"));
        }

        // Symlinks inside the base can still point out of it; check the
        // real path of whatever part already exists.
        if let Ok(real) = resolved.canonicalize() {
            if !real.starts_with(&self.base) {
                return Err(reject("resolves outside the base directory"));
            }
            return Ok(real);
        }
        Ok(resolved)
    }
}

/// Fail with `QuotaExceeded` when an append would grow `file` past the cap.
pub fn check_file_size(file: &Path, current: u64, incoming: u64, max: u64) -> Result<()> {
    let projected = current.saturating_add(incoming);
    if projected > max {
        return Err(Error::QuotaExceeded(format!(
            "appending {incoming} bytes to {file:?} would reach {projected} bytes, cap is {max}"
        )));
    }
    Ok(())
}

pub fn check_batch_size(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::QuotaExceeded(format!(
            "batch of {len} records exceeds the cap of {max}"
        )));
    }
    Ok(())
}
