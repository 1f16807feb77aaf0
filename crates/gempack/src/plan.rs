//! The end-to-end packaging pipeline.

use crate::archive::{ArchiveEntry, ArchiveError, ArchiveSink};
use crate::bootstrap;
use crate::bundler::{BundlerTrait, ProjectTrait};
use crate::classify::Diagnostic;
use crate::layout::{self, ArchiveKind, LayoutError};
use crate::manifest::ManifestError;
use crate::policy::{PackagingPolicy, PolicyError};
use crate::resolve::{ConfiguredResolver, DependencyResolver, ResolveError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that stop a packaging run.
#[derive(Error, Debug)]
pub enum PackagingError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("dependency resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Everything the engine contributes to one archive.
#[derive(Debug, Clone)]
pub struct PackagingPlan {
    /// How the archive is hosted.
    pub kind: ArchiveKind,

    /// Dependency trees, manifest files and the bootstrap script.
    pub entries: Vec<ArchiveEntry>,

    /// Project-relative paths the generic file copier must skip.
    pub host_excludes: Vec<PathBuf>,

    /// Packages that were dropped with a warning.
    pub diagnostics: Vec<Diagnostic>,

    /// SHA-256 over every entry's path and content, hex encoded.
    pub fingerprint: String,
}

impl PackagingPlan {
    /// Destination paths in entry order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.path.as_str())
    }

    /// Find an entry by destination.
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Hand every entry to an archive writer.
    ///
    /// # Errors
    ///
    /// Returns the first error the sink reports.
    pub fn write_to(&self, sink: &mut dyn ArchiveSink) -> Result<(), ArchiveError> {
        for entry in &self.entries {
            sink.add(entry.clone())?;
        }
        debug!("wrote {} entries", self.entries.len());
        Ok(())
    }
}

/// Hash entry paths and contents in order.
///
/// # Errors
///
/// Returns an error if an entry's source file cannot be read.
pub fn fingerprint(entries: &[ArchiveEntry]) -> Result<String, ArchiveError> {
    let mut hasher = Sha256::new();
    for entry in entries {
        let content = entry.source.read()?;
        hasher.update(entry.path.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Package a project with the resolver its policy selects.
///
/// Returns `Ok(None)` when the project does not use Bundler.
///
/// # Errors
///
/// Returns an error if resolution fails, two files map to the same archive
/// path, or a file cannot be read.
pub fn package_project(
    project: impl AsRef<Path>,
    policy: &PackagingPolicy,
) -> Result<Option<PackagingPlan>, PackagingError> {
    let resolver = ConfiguredResolver::from_policy(policy);
    package_project_with(project, policy, &resolver)
}

/// Load a project's policy and package it.
///
/// `env` is a snapshot of the environment, see [`PackagingPolicy::load`].
///
/// # Errors
///
/// Returns an error if the policy is invalid, or see [`package_project`].
pub fn package_with_env<I, K, V>(
    project: impl AsRef<Path>,
    env: I,
) -> Result<Option<PackagingPlan>, PackagingError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let project = project.as_ref();
    let policy = PackagingPolicy::load(project, env)?;
    package_project(project, &policy)
}

/// Package a project with an explicit resolver.
///
/// # Errors
///
/// See [`package_project`].
pub fn package_project_with(
    project: impl AsRef<Path>,
    policy: &PackagingPolicy,
    resolver: &dyn DependencyResolver,
) -> Result<Option<PackagingPlan>, PackagingError> {
    let project = project.as_ref();
    let traits = ProjectTrait::detect_all(project, policy);
    if !traits.contains(&ProjectTrait::Bundler) {
        info!("no Gemfile in {}; skipping dependencies", project.display());
        return Ok(None);
    }
    let kind = ProjectTrait::archive_kind(&traits);

    let (active, manifest) = BundlerTrait::apply(project, policy, resolver)?;
    let mut entries = layout::map_entries(&active, &manifest, policy, kind)?;

    let script = bootstrap::entry(&manifest, policy, kind);
    if entries.iter().any(|e| e.path == script.path) {
        return Err(LayoutError::DuplicateDestination {
            path: script.path,
            first: manifest.path.clone(),
            second: PathBuf::from(&policy.bootstrap_path),
        }
        .into());
    }
    entries.push(script);

    let fingerprint = fingerprint(&entries)?;
    info!(
        "{} archive: {} packages, {} entries",
        kind,
        active.len(),
        entries.len()
    );

    Ok(Some(PackagingPlan {
        kind,
        entries,
        host_excludes: layout::host_excludes(project, policy),
        diagnostics: active.diagnostics,
        fingerprint,
    }))
}
