//! Archive entries and the writer they are handed to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors an archive sink can report.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("duplicate archive entry: {0}")]
    Duplicate(String),

    #[error("invalid archive path '{0}'")]
    InvalidPath(String),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where an entry's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// A file on the host, read when the entry is written.
    File(PathBuf),
    /// Generated content.
    Bytes(Vec<u8>),
}

impl EntrySource {
    /// Read the entry's content.
    ///
    /// # Errors
    ///
    /// Returns an error if a host file cannot be read.
    pub fn read(&self) -> Result<Vec<u8>, ArchiveError> {
        match self {
            Self::File(path) => std::fs::read(path).map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            }),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// One file of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Archive-relative, `/`-separated destination.
    pub path: String,
    pub source: EntrySource,
}

impl ArchiveEntry {
    /// An entry copied from a host file.
    pub fn file(path: impl Into<String>, source: impl AsRef<Path>) -> Self {
        Self {
            path: path.into(),
            source: EntrySource::File(source.as_ref().to_path_buf()),
        }
    }

    /// An entry with generated content.
    pub fn bytes(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            source: EntrySource::Bytes(content.into()),
        }
    }

    /// Returns true if the destination is relative, `/`-separated and free
    /// of `.`/`..` segments.
    #[must_use]
    pub fn has_valid_path(&self) -> bool {
        is_valid_archive_path(&self.path)
    }
}

pub(crate) fn is_valid_archive_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && path.split('/').all(|s| !s.is_empty() && s != "." && s != "..")
}

/// The archive writer collaborator: accepts each destination exactly once.
pub trait ArchiveSink {
    /// Add one entry.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate destination or unreadable source.
    fn add(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError>;
}

/// An archive held in memory, keyed by destination path.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    /// Create an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of an entry.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    /// Returns true if an entry exists.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Destination paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArchiveSink for MemoryArchive {
    fn add(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError> {
        if !entry.has_valid_path() {
            return Err(ArchiveError::InvalidPath(entry.path));
        }
        if self.entries.contains_key(&entry.path) {
            return Err(ArchiveError::Duplicate(entry.path));
        }
        let content = entry.source.read()?;
        self.entries.insert(entry.path, content);
        Ok(())
    }
}
