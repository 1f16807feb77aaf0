//! Obtaining the resolved dependency graph.
//!
//! Resolution itself belongs to the dependency manager. This module only
//! defines the collaborator interface ([`DependencyResolver`]) and two ways of
//! satisfying it:
//!
//! - [`LockfileResolver`] reads `Gemfile.lock` and locates each locked gem in
//!   an installed gem home. It never re-resolves, so it behaves the same in
//!   frozen and non-frozen mode except for how strictly a stale lock file is
//!   treated.
//! - [`CommandResolver`] runs an external program that prints the graph as
//!   JSON (the [`ResolvedGraph`] serde shape).
//!
//! Either way the result is all or nothing: an error never comes with a
//! partial graph.

use crate::gemfile::DeclaredSource;
use crate::graph::{Declaration, Origin, ResolvedGraph, ResolvedPackage};
use crate::lockfile::{LockError, LockedSource, LockedSpec, Lockfile, SourceKind};
use crate::manifest::Manifest;
use crate::policy::{PackagingPolicy, ResolverConfig, GEMFILE_ENV};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Length of the revision prefix Bundler uses for checkout directories.
pub const SHORT_REVISION_LEN: usize = 12;

/// Errors that can occur while obtaining the resolved graph.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No lock file to read versions from.
    #[error("no lock file at {}; run `bundle install` first", .0.display())]
    MissingLockfile(PathBuf),

    /// The lock file is corrupt.
    #[error("corrupt lock file: {0}")]
    Lock(#[from] LockError),

    /// A declared dependency has no locked version.
    #[error("'{0}' is declared in the Gemfile but missing from the lock file")]
    NotLocked(String),

    /// Frozen mode and the manifest no longer matches the lock file.
    #[error("the Gemfile changed since the lock file was written (frozen): {}", .0.join(", "))]
    FrozenMismatch(Vec<String>),

    /// No gem home could be found.
    #[error("no installed gem home found under {}", .0.display())]
    NoGemHome(PathBuf),

    /// A locked package is not installed.
    #[error("'{name}' is locked but not installed at {}", .path.display())]
    NotInstalled { name: String, path: PathBuf },

    /// The external resolver could not be started.
    #[error("failed to run resolver '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external resolver reported a failure.
    #[error("resolver '{program}' failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// The external resolver printed something that is not a graph.
    #[error("resolver output is not a dependency graph: {0}")]
    Output(#[from] serde_json::Error),

    /// The graph is internally inconsistent.
    #[error("inconsistent graph: {0}")]
    Inconsistent(String),
}

/// The external dependency-manager service.
pub trait DependencyResolver {
    /// Produce the full resolved graph for a manifest.
    ///
    /// In frozen mode the resolver must use the lock file's exact versions
    /// and must not re-resolve.
    fn resolve(&self, manifest: &Manifest, frozen: bool) -> Result<ResolvedGraph, ResolveError>;
}

/// The resolver a policy asks for.
#[derive(Debug, Clone)]
pub enum ConfiguredResolver {
    Lockfile(LockfileResolver),
    Command(CommandResolver),
}

impl ConfiguredResolver {
    /// Build the resolver selected by a policy.
    #[must_use]
    pub fn from_policy(policy: &PackagingPolicy) -> Self {
        match &policy.resolver {
            ResolverConfig::Lockfile { gem_home } => Self::Lockfile(
                LockfileResolver::new()
                    .with_gem_home(gem_home.clone())
                    .with_install_path(policy.install_path.clone())
                    .with_manager_package(&policy.manager_package)
                    .with_excluded_groups(&policy.excluded_groups),
            ),
            ResolverConfig::Command { program, args } => {
                Self::Command(CommandResolver::new(program, args.clone()))
            }
        }
    }
}

impl DependencyResolver for ConfiguredResolver {
    fn resolve(&self, manifest: &Manifest, frozen: bool) -> Result<ResolvedGraph, ResolveError> {
        match self {
            Self::Lockfile(resolver) => resolver.resolve(manifest, frozen),
            Self::Command(resolver) => resolver.resolve(manifest, frozen),
        }
    }
}

/// Resolves from `Gemfile.lock` and an installed gem home.
#[derive(Debug, Clone, Default)]
pub struct LockfileResolver {
    /// Explicit gem home; relative paths are taken from the manifest directory.
    gem_home: Option<PathBuf>,
    /// Bundler install path to search for a gem home.
    install_path: Option<PathBuf>,
    /// Package added from the gem home when it is not locked.
    manager_package: Option<String>,
    /// Groups whose packages may be missing from the gem home.
    excluded_groups: Vec<String>,
}

impl LockfileResolver {
    /// Create a resolver with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this gem home.
    #[must_use]
    pub fn with_gem_home(mut self, gem_home: Option<PathBuf>) -> Self {
        self.gem_home = gem_home;
        self
    }

    /// Search this Bundler install path for the gem home.
    #[must_use]
    pub fn with_install_path(mut self, install_path: Option<PathBuf>) -> Self {
        self.install_path = install_path;
        self
    }

    /// Add the dependency manager's own package when it is installed.
    #[must_use]
    pub fn with_manager_package(mut self, name: &str) -> Self {
        self.manager_package = Some(name.to_string());
        self
    }

    /// Tolerate uninstalled registry gems only these groups require.
    #[must_use]
    pub fn with_excluded_groups(mut self, groups: &[String]) -> Self {
        self.excluded_groups = groups.to_vec();
        self
    }

    /// Locate the gem home for a manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if neither the explicit gem home nor the install path
    /// holds a `specifications` directory.
    pub fn gem_home(&self, manifest: &Manifest) -> Result<PathBuf, ResolveError> {
        let dir = manifest.dir();
        if let Some(home) = &self.gem_home {
            return Ok(dir.join(home));
        }

        let install = dir.join(
            self.install_path
                .as_deref()
                .unwrap_or_else(|| Path::new(crate::policy::DEFAULT_DEPLOYMENT_PATH)),
        );
        if install.join("specifications").is_dir() {
            return Ok(install);
        }

        // Bundler installs into <path>/<engine>/<abi-version>.
        WalkDir::new(&install)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .map(walkdir::DirEntry::into_path)
            .find(|p| p.join("specifications").is_dir())
            .ok_or(ResolveError::NoGemHome(install))
    }

    fn check_declarations(
        &self,
        manifest: &Manifest,
        lock: &Lockfile,
        frozen: bool,
    ) -> Result<(), ResolveError> {
        let mut changed = Vec::new();

        for gem in &manifest.gemfile.gems {
            let Some((source, _)) = lock.find(&gem.name) else {
                return Err(ResolveError::NotLocked(gem.name.clone()));
            };
            let matches = matches!(
                (&gem.source, source.kind),
                (DeclaredSource::Registry, SourceKind::Gem)
                    | (DeclaredSource::Git { .. }, SourceKind::Git)
                    | (DeclaredSource::Path { .. }, SourceKind::Path)
            );
            if !matches {
                changed.push(format!("{} is now from {}", gem.name, source.kind));
            }
        }

        for dep in lock.dependencies.iter().filter(|d| !d.pinned) {
            let pinned_source = manifest.gemfile.gems.iter().any(|g| {
                g.name == dep.name && !matches!(g.source, DeclaredSource::Registry)
            });
            if pinned_source {
                changed.push(format!("{} is no longer pinned to its source", dep.name));
            }
        }

        if !lock.dependencies.is_empty() {
            let declared: BTreeSet<&str> =
                manifest.gemfile.gems.iter().map(|g| g.name.as_str()).collect();
            let locked: BTreeSet<&str> =
                lock.dependencies.iter().map(|d| d.name.as_str()).collect();
            changed.extend(declared.difference(&locked).map(|n| format!("added {n}")));
            changed.extend(locked.difference(&declared).map(|n| format!("removed {n}")));
        }

        if changed.is_empty() {
            return Ok(());
        }
        if frozen {
            return Err(ResolveError::FrozenMismatch(changed));
        }
        warn!("lock file is out of date with the Gemfile: {}", changed.join(", "));
        Ok(())
    }

    fn locate(
        &self,
        manifest: &Manifest,
        gem_home: &Path,
        lock: &Lockfile,
        name: &str,
    ) -> Result<Option<ResolvedPackage>, ResolveError> {
        let mut variants = lock.variants(name).peekable();
        let Some(&(source, spec)) = variants.peek() else {
            return Ok(None);
        };

        let package = match source.kind {
            SourceKind::Gem => {
                let mut first_missing = None;
                let mut found = None;
                for (_, spec) in variants {
                    let package = registry_package(gem_home, spec);
                    if package.install_dir.is_dir() {
                        found = Some(package);
                        break;
                    }
                    first_missing.get_or_insert(package.install_dir);
                }
                found.ok_or_else(|| ResolveError::NotInstalled {
                    name: name.to_string(),
                    path: first_missing.unwrap_or_default(),
                })?
            }
            SourceKind::Git => git_package(gem_home, source, spec)?,
            SourceKind::Path => {
                let dir = manifest.dir().join(source.remote.as_deref().unwrap_or("."));
                ResolvedPackage {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                    origin: Origin::LocalPath { path: dir.clone() },
                    descriptor: dir.join(format!("{}.gemspec", spec.name)),
                    install_dir: dir,
                    dependencies: spec.dependencies.clone(),
                }
            }
        };

        Ok(Some(package))
    }

    /// Locate `roots` and everything they require into `graph`.
    ///
    /// With `required` unset, registry gems missing from the gem home are
    /// left out of the graph; a missing git checkout is still an error.
    fn walk(
        &self,
        manifest: &Manifest,
        gem_home: &Path,
        lock: &Lockfile,
        graph: &mut ResolvedGraph,
        roots: Vec<String>,
        required: bool,
    ) -> Result<(), ResolveError> {
        let mut stack = roots;
        while let Some(name) = stack.pop() {
            if graph.get(&name).is_some() {
                continue;
            }
            let package = match self.locate(manifest, gem_home, lock, &name) {
                Ok(Some(package)) => package,
                Ok(None) => continue,
                Err(ResolveError::NotInstalled { path, .. })
                    if !required
                        && lock.find(&name).map(|(source, _)| source.kind)
                            == Some(SourceKind::Gem) =>
                {
                    debug!("skipping {name}: not installed at {}", path.display());
                    continue;
                }
                Err(err) => return Err(err),
            };
            stack.extend(package.dependencies.iter().cloned());
            graph.insert(package);
        }
        Ok(())
    }

    fn installed_manager(&self, gem_home: &Path, lock: &Lockfile) -> Option<ResolvedPackage> {
        let name = self.manager_package.as_deref()?;
        let version = lock.bundled_with.as_deref()?;
        let package = registry_package(
            gem_home,
            &LockedSpec {
                name: name.to_string(),
                version: version.to_string(),
                dependencies: Vec::new(),
            },
        );
        package.install_dir.is_dir().then_some(package)
    }
}

impl DependencyResolver for LockfileResolver {
    fn resolve(&self, manifest: &Manifest, frozen: bool) -> Result<ResolvedGraph, ResolveError> {
        let content = manifest
            .lock_content
            .as_deref()
            .ok_or_else(|| ResolveError::MissingLockfile(manifest.lock_path.clone()))?;
        let lock = Lockfile::parse(&String::from_utf8_lossy(content))?;
        self.check_declarations(manifest, &lock, frozen)?;

        let gem_home = self.gem_home(manifest)?;
        debug!("resolving against gem home {}", gem_home.display());

        let mut graph = ResolvedGraph {
            declarations: manifest
                .gemfile
                .gems
                .iter()
                .map(|g| Declaration::new(g.name.clone(), g.groups.iter().cloned()))
                .collect(),
            ..ResolvedGraph::default()
        };

        // Walk the lock file from the declarations so entries that nothing
        // requires (other platforms, stale leftovers) are never looked up.
        // Included declarations go first, so anything they reach must be
        // installed even when an excluded declaration also requires it.
        let (included, excluded): (Vec<&Declaration>, Vec<&Declaration>) =
            graph.declarations.iter().partition(|d| {
                d.effective_groups()
                    .any(|group| !self.excluded_groups.iter().any(|g| g == group))
            });
        let included: Vec<String> = included.into_iter().map(|d| d.name.clone()).collect();
        let excluded: Vec<String> = excluded.into_iter().map(|d| d.name.clone()).collect();

        self.walk(manifest, &gem_home, &lock, &mut graph, included, true)?;
        self.walk(manifest, &gem_home, &lock, &mut graph, excluded, false)?;

        if let Some(manager) = self.installed_manager(&gem_home, &lock) {
            if graph.get(&manager.name).is_none() {
                debug!("adding {} from the gem home", manager.full_name());
                graph.insert(manager);
            }
        }

        info!("resolved {} packages from {}", graph.len(), manifest.lock_path.display());
        Ok(graph)
    }
}

fn registry_package(gem_home: &Path, spec: &LockedSpec) -> ResolvedPackage {
    let full_name = format!("{}-{}", spec.name, spec.version);
    ResolvedPackage {
        name: spec.name.clone(),
        version: spec.version.clone(),
        origin: Origin::Registry,
        install_dir: gem_home.join("gems").join(&full_name),
        descriptor: gem_home
            .join("specifications")
            .join(format!("{full_name}.gemspec")),
        dependencies: spec.dependencies.clone(),
    }
}

fn git_package(
    gem_home: &Path,
    source: &LockedSource,
    spec: &LockedSpec,
) -> Result<ResolvedPackage, ResolveError> {
    let remote = source.remote.clone().unwrap_or_default();
    let revision = source.revision.clone().unwrap_or_default();
    let dir = gem_home
        .join("bundler")
        .join("gems")
        .join(checkout_dir_name(&remote, &revision));

    let not_installed = || ResolveError::NotInstalled {
        name: spec.name.clone(),
        path: dir.clone(),
    };
    if !dir.is_dir() {
        return Err(not_installed());
    }

    let gemspec = format!("{}.gemspec", spec.name);
    let descriptor = if dir.join(&gemspec).is_file() {
        dir.join(&gemspec)
    } else {
        WalkDir::new(&dir)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == gemspec)
            .map(walkdir::DirEntry::into_path)
            .ok_or_else(not_installed)?
    };

    Ok(ResolvedPackage {
        name: spec.name.clone(),
        version: spec.version.clone(),
        origin: Origin::Vcs { remote, revision },
        install_dir: dir,
        descriptor,
        dependencies: spec.dependencies.clone(),
    })
}

/// Bundler's checkout directory: `<repository basename>-<short revision>`.
#[must_use]
pub fn checkout_dir_name(remote: &str, revision: &str) -> String {
    let trimmed = remote.trim_end_matches('/');
    let base = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    let base = base.strip_suffix(".git").unwrap_or(base);
    let short: String = revision.chars().take(SHORT_REVISION_LEN).collect();
    format!("{base}-{short}")
}

/// Runs an external program that prints the resolved graph as JSON.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    program: String,
    args: Vec<String>,
}

impl CommandResolver {
    /// Create a resolver for `program args...`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl DependencyResolver for CommandResolver {
    fn resolve(&self, manifest: &Manifest, frozen: bool) -> Result<ResolvedGraph, ResolveError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(manifest.dir())
            .env(GEMFILE_ENV, &manifest.path);
        if frozen {
            command.env("BUNDLE_FROZEN", "1");
        }

        debug!("running resolver {} {}", self.program, self.args.join(" "));
        let output = command.output().map_err(|source| ResolveError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ResolveError::CommandFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let graph: ResolvedGraph = serde_json::from_slice(&output.stdout)?;
        for (key, package) in &graph.packages {
            if *key != package.name {
                return Err(ResolveError::Inconsistent(format!(
                    "package '{}' listed under '{key}'",
                    package.name
                )));
            }
        }

        info!("resolver {} returned {} packages", self.program, graph.len());
        Ok(graph)
    }
}
