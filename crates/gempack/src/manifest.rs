//! The project's dependency manifest and lock file.

use crate::gemfile::{Gemfile, GemfileError};
use crate::lockfile::LOCK_SUFFIX;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when reading the manifest files.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {source}", .path.display())]
    Gemfile {
        path: PathBuf,
        #[source]
        source: GemfileError,
    },

    #[error("manifest path has no file name: {}", .0.display())]
    NoFileName(PathBuf),
}

/// The manifest and lock file of a project, read once and never modified.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Absolute path of the manifest.
    pub path: PathBuf,

    /// Raw manifest bytes, copied verbatim into the archive.
    pub content: Vec<u8>,

    /// Path of the lock file, whether or not it exists.
    pub lock_path: PathBuf,

    /// Raw lock file bytes, if the lock file exists.
    pub lock_content: Option<Vec<u8>>,

    /// Declarations read from the manifest.
    pub gemfile: Gemfile,
}

impl Manifest {
    /// Read a manifest and its sibling lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or parsed, or the lock
    /// file exists but cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .ok_or_else(|| ManifestError::NoFileName(path.clone()))?;

        let content = std::fs::read(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        let gemfile = Gemfile::parse(&String::from_utf8_lossy(&content)).map_err(|source| {
            ManifestError::Gemfile {
                path: path.clone(),
                source,
            }
        })?;

        let mut lock_name = file_name.to_os_string();
        lock_name.push(LOCK_SUFFIX);
        let lock_path = path.with_file_name(lock_name);
        let lock_content = if lock_path.is_file() {
            Some(std::fs::read(&lock_path).map_err(|source| ManifestError::Io {
                path: lock_path.clone(),
                source,
            })?)
        } else {
            None
        };

        Ok(Self {
            path,
            content,
            lock_path,
            lock_content,
            gemfile,
        })
    }

    /// The manifest's file name (`Gemfile`).
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The lock file's name (`Gemfile.lock`).
    #[must_use]
    pub fn lock_file_name(&self) -> String {
        format!("{}{LOCK_SUFFIX}", self.file_name())
    }

    /// Directory containing the manifest.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_with_lock() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Gemfile"), "gem 'rake'\n").unwrap();
        fs::write(tmp.path().join("Gemfile.lock"), "GEM\n").unwrap();

        let manifest = Manifest::load(tmp.path().join("Gemfile")).unwrap();
        assert_eq!(manifest.file_name(), "Gemfile");
        assert_eq!(manifest.lock_file_name(), "Gemfile.lock");
        assert_eq!(manifest.content, b"gem 'rake'\n");
        assert_eq!(manifest.lock_content.as_deref(), Some(&b"GEM\n"[..]));
        assert_eq!(manifest.dir(), tmp.path());
    }

    #[test]
    fn load_without_lock() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Special-Gemfile"), "group :test do\ngem 'rspec'\nend\n")
            .unwrap();

        let manifest = Manifest::load(tmp.path().join("Special-Gemfile")).unwrap();
        assert!(manifest.lock_content.is_none());
        assert_eq!(manifest.lock_path, tmp.path().join("Special-Gemfile.lock"));
        assert!(manifest.gemfile.gems[0].groups.contains("test"));
    }

    #[test]
    fn missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let err = Manifest::load(tmp.path().join("Gemfile")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }

    #[test]
    fn invalid_manifest() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Gemfile"), "group :test do\n").unwrap();
        let err = Manifest::load(tmp.path().join("Gemfile")).unwrap_err();
        assert!(matches!(err, ManifestError::Gemfile { .. }));
    }
}
