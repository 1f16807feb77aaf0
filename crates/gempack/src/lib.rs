//! Dependency resolution and selective packaging for Bundler projects.
//!
//! This crate provides:
//! - Reading of `Gemfile` declarations and `Gemfile.lock`
//! - Resolution of the full dependency graph through a pluggable resolver
//! - Group filtering and classification of packages by origin
//! - The archive layout of embedded gems, specifications and manifest files
//! - Generation of the runtime bootstrap script
//!
//! ```no_run
//! use gempack::{package_project, MemoryArchive, PackagingPolicy};
//!
//! let policy = PackagingPolicy::load("my-app", std::env::vars())?;
//! if let Some(plan) = package_project("my-app", &policy)? {
//!     let mut archive = MemoryArchive::new();
//!     plan.write_to(&mut archive)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod archive;
pub mod bootstrap;
mod bundler;
mod classify;
mod gemfile;
mod graph;
pub mod groups;
mod layout;
mod lockfile;
mod manifest;
mod plan;
mod policy;
mod resolve;

pub use archive::{ArchiveEntry, ArchiveError, ArchiveSink, EntrySource, MemoryArchive};
pub use bundler::{BundlerTrait, ProjectTrait};
pub use classify::{
    classify, classify_all, ActivePackage, ActivePackageSet, Classification, Contribution,
    Diagnostic,
};
pub use gemfile::{DeclaredGem, DeclaredSource, Gemfile, GemfileError, GEMFILE};
pub use graph::{Declaration, Origin, ResolvedGraph, ResolvedPackage, DEFAULT_GROUP};
pub use layout::{host_excludes, map_entries, ArchiveKind, LayoutError};
pub use lockfile::{
    LockError, LockedDependency, LockedSource, LockedSpec, Lockfile, SourceKind, LOCK_SUFFIX,
};
pub use manifest::{Manifest, ManifestError};
pub use plan::{
    fingerprint, package_project, package_project_with, package_with_env, PackagingError,
    PackagingPlan,
};
pub use policy::{
    BundleSettings, PackagingPolicy, PolicyError, PolicyFile, ResolverConfig, BUNDLE_CONFIG,
    DEFAULT_BASE, DEFAULT_BOOTSTRAP, DEFAULT_DEPLOYMENT_PATH, DEFAULT_EXCLUDED_GROUPS,
    DEFAULT_MANAGER_PACKAGE, GEMFILE_ENV, POLICY_FILE,
};
pub use resolve::{
    checkout_dir_name, CommandResolver, ConfiguredResolver, DependencyResolver, LockfileResolver,
    ResolveError, SHORT_REVISION_LEN,
};
