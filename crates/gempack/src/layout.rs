//! Archive layout: where every embedded file lands.
//!
//! Application archives carry their own root directory (`<base>`, `WEB-INF`
//! by default) and everything goes below it:
//!
//! ```text
//! WEB-INF/Gemfile
//! WEB-INF/Gemfile.lock
//! WEB-INF/gems/gems/rake-13.0.6/lib/rake.rb
//! WEB-INF/gems/specifications/rake-13.0.6.gemspec
//! WEB-INF/gems/bundler/gems/warbler-3f2a9c1d7e0b/warbler.gemspec
//! ```
//!
//! Library archives are hosted by a container that supplies the root, so the
//! same tree starts at the archive root. A gem path override replaces
//! `<base>/gems` in both cases.

use crate::archive::{is_valid_archive_path, ArchiveEntry};
use crate::classify::{ActivePackageSet, Contribution};
use crate::graph::{Origin, ResolvedPackage};
use crate::manifest::Manifest;
use crate::policy::{join_archive, PackagingPolicy, DEFAULT_BASE, DEFAULT_DEPLOYMENT_PATH};
use crate::resolve::checkout_dir_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Errors that can occur while mapping files into the archive.
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error(
        "two different files map to archive path '{path}': {} and {}",
        .first.display(),
        .second.display()
    )]
    DuplicateDestination {
        path: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("'{path}' is not a valid archive path (from {})", .source_path.display())]
    InvalidPath { path: String, source_path: PathBuf },

    #[error("descriptor for '{name}' not found at {}", .path.display())]
    MissingDescriptor { name: String, path: PathBuf },

    #[error("failed to walk installed files: {0}")]
    Walk(#[from] walkdir::Error),
}

/// How the archive is hosted at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// Self-contained application with its own root directory.
    Application,
    /// Hosted by a container that supplies the runtime root.
    Library,
}

impl ArchiveKind {
    /// Guess the archive kind from the project's files.
    #[must_use]
    pub fn detect(project: &Path) -> Self {
        let application = project.join("config.ru").is_file()
            || project.join("config").join("environment.rb").is_file()
            || project.join(DEFAULT_BASE).is_dir();
        if application {
            Self::Application
        } else {
            Self::Library
        }
    }
}

impl std::fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Application => write!(f, "application"),
            Self::Library => write!(f, "library"),
        }
    }
}

/// Collects entries and catches destination clashes.
#[derive(Default)]
struct EntryMap {
    entries: Vec<ArchiveEntry>,
    sources: BTreeMap<String, PathBuf>,
}

impl EntryMap {
    fn check_path(path: &str, source: &Path) -> Result<(), LayoutError> {
        if is_valid_archive_path(path) {
            return Ok(());
        }
        Err(LayoutError::InvalidPath {
            path: path.to_string(),
            source_path: source.to_path_buf(),
        })
    }

    fn add_file(&mut self, path: String, source: &Path) -> Result<(), LayoutError> {
        Self::check_path(&path, source)?;
        if let Some(first) = self.sources.get(&path) {
            if first == source {
                return Ok(());
            }
            return Err(LayoutError::DuplicateDestination {
                path,
                first: first.clone(),
                second: source.to_path_buf(),
            });
        }
        self.sources.insert(path.clone(), source.to_path_buf());
        self.entries.push(ArchiveEntry::file(path, source));
        Ok(())
    }

    fn add_bytes(
        &mut self,
        path: String,
        origin: &Path,
        content: &[u8],
    ) -> Result<(), LayoutError> {
        Self::check_path(&path, origin)?;
        if let Some(first) = self.sources.get(&path) {
            return Err(LayoutError::DuplicateDestination {
                path,
                first: first.clone(),
                second: origin.to_path_buf(),
            });
        }
        self.sources.insert(path.clone(), origin.to_path_buf());
        self.entries.push(ArchiveEntry::bytes(path, content));
        Ok(())
    }

    /// Add every file below `root` under `dest`, sorted by name.
    fn add_tree(
        &mut self,
        root: &Path,
        dest: &str,
        excludes: &[glob::Pattern],
    ) -> Result<(), LayoutError> {
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_archive_path(root, entry.path()) else {
                continue;
            };
            if excludes.iter().any(|p| p.matches(&relative)) {
                debug!("skipping {}/{relative}: excluded", dest);
                continue;
            }
            self.add_file(join_archive(dest, &relative), entry.path())?;
        }
        Ok(())
    }
}

/// `path` relative to `root`, `/`-separated. `None` outside `root`.
fn relative_archive_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// Directory name of a checkout inside `bundler/gems`.
fn checkout_dir(package: &ResolvedPackage) -> String {
    match package.install_dir.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => match &package.origin {
            Origin::Vcs { remote, revision } => checkout_dir_name(remote, revision),
            _ => package.full_name(),
        },
    }
}

fn descriptor_name(package: &ResolvedPackage) -> String {
    package.descriptor.file_name().map_or_else(
        || format!("{}.gemspec", package.name),
        |n| n.to_string_lossy().into_owned(),
    )
}

/// Compute the archive entries for the classified packages and the
/// manifest files.
///
/// # Errors
///
/// Returns an error if two different files map to the same destination, a
/// destination is not a valid archive path, a descriptor is missing, or an
/// installed tree cannot be walked.
pub fn map_entries(
    active: &ActivePackageSet,
    manifest: &Manifest,
    policy: &PackagingPolicy,
    kind: ArchiveKind,
) -> Result<Vec<ArchiveEntry>, LayoutError> {
    let gem_root = policy.gem_root(kind);
    let mut map = EntryMap::default();

    for item in &active.packages {
        let package = &item.package;
        if !package.descriptor.is_file() {
            return Err(LayoutError::MissingDescriptor {
                name: package.name.clone(),
                path: package.descriptor.clone(),
            });
        }

        match &package.origin {
            Origin::Vcs { .. } => {
                let dest =
                    join_archive(&gem_root, &format!("bundler/gems/{}", checkout_dir(package)));
                if item.contribution == Contribution::FullTree {
                    map.add_tree(&package.install_dir, &dest, &policy.gem_excludes)?;
                }
                let relative = relative_archive_path(&package.install_dir, &package.descriptor)
                    .unwrap_or_else(|| descriptor_name(package));
                map.add_file(join_archive(&dest, &relative), &package.descriptor)?;
            }
            _ => {
                let full_name = package.full_name();
                let dest = join_archive(&gem_root, &format!("gems/{full_name}"));
                map.add_tree(&package.install_dir, &dest, &policy.gem_excludes)?;
                map.add_file(
                    join_archive(&gem_root, &format!("specifications/{full_name}.gemspec")),
                    &package.descriptor,
                )?;
            }
        }
        debug!("mapped {} ({:?})", package.full_name(), item.contribution);
    }

    let base = policy.base_for(kind);
    map.add_bytes(
        join_archive(base, &manifest.file_name()),
        &manifest.path,
        &manifest.content,
    )?;
    if let Some(lock) = &manifest.lock_content {
        map.add_bytes(
            join_archive(base, &manifest.lock_file_name()),
            &manifest.lock_path,
            lock,
        )?;
    }

    Ok(map.entries)
}

/// Project-relative paths the generic file copier must leave out: the
/// bundle install directory in frozen mode.
#[must_use]
pub fn host_excludes(project: &Path, policy: &PackagingPolicy) -> Vec<PathBuf> {
    if !policy.frozen {
        return Vec::new();
    }
    let install_path = policy
        .install_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEPLOYMENT_PATH));
    let absolute = if install_path.is_absolute() {
        install_path
    } else {
        project.join(install_path)
    };

    match absolute.strip_prefix(project) {
        Ok(relative) if absolute.is_dir() && !relative.as_os_str().is_empty() => {
            vec![relative.to_path_buf()]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ActivePackage;
    use std::fs;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    struct Fixture {
        tmp: TempDir,
        manifest: Manifest,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            write(&tmp.path().join("app/Gemfile"), "gem 'rake'\n");
            write(&tmp.path().join("app/Gemfile.lock"), "GEM\n");
            let manifest = Manifest::load(tmp.path().join("app/Gemfile")).unwrap();
            Self { tmp, manifest }
        }

        fn home(&self) -> PathBuf {
            self.tmp.path().join("home")
        }

        fn registry(&self, name: &str, version: &str) -> ResolvedPackage {
            let full = format!("{name}-{version}");
            let install_dir = self.home().join("gems").join(&full);
            write(&install_dir.join(format!("lib/{name}.rb")), "");
            write(&install_dir.join("README.md"), "");
            let descriptor = self.home().join(format!("specifications/{full}.gemspec"));
            write(&descriptor, "");
            ResolvedPackage {
                name: name.to_string(),
                version: version.to_string(),
                origin: Origin::Registry,
                install_dir,
                descriptor,
                dependencies: Vec::new(),
            }
        }

        fn vcs(&self, name: &str) -> ResolvedPackage {
            let install_dir = self.home().join("bundler/gems/tools-0123456789ab");
            write(&install_dir.join(format!("{name}/lib/{name}.rb")), "");
            let descriptor = install_dir.join(format!("{name}/{name}.gemspec"));
            write(&descriptor, "");
            ResolvedPackage {
                name: name.to_string(),
                version: "0.1.0".to_string(),
                origin: Origin::Vcs {
                    remote: "https://example.com/tools.git".to_string(),
                    revision: "0123456789abcdef".to_string(),
                },
                install_dir,
                descriptor,
                dependencies: Vec::new(),
            }
        }
    }

    fn set(items: Vec<(ResolvedPackage, Contribution)>) -> ActivePackageSet {
        ActivePackageSet {
            packages: items
                .into_iter()
                .map(|(package, contribution)| ActivePackage {
                    package,
                    contribution,
                })
                .collect(),
            diagnostics: Vec::new(),
        }
    }

    fn paths(entries: &[ArchiveEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn application_layout() {
        let fx = Fixture::new();
        let active = set(vec![(fx.registry("rake", "13.0.6"), Contribution::FullTree)]);
        let entries = map_entries(
            &active,
            &fx.manifest,
            &PackagingPolicy::new(),
            ArchiveKind::Application,
        )
        .unwrap();

        assert_eq!(
            paths(&entries),
            vec![
                "WEB-INF/gems/gems/rake-13.0.6/README.md",
                "WEB-INF/gems/gems/rake-13.0.6/lib/rake.rb",
                "WEB-INF/gems/specifications/rake-13.0.6.gemspec",
                "WEB-INF/Gemfile",
                "WEB-INF/Gemfile.lock",
            ]
        );
        assert_eq!(entries[3].source.read().unwrap(), b"gem 'rake'\n");
    }

    #[test]
    fn library_layout_has_no_base() {
        let fx = Fixture::new();
        let active = set(vec![(fx.registry("rake", "13.0.6"), Contribution::FullTree)]);
        let entries = map_entries(
            &active,
            &fx.manifest,
            &PackagingPolicy::new(),
            ArchiveKind::Library,
        )
        .unwrap();

        assert!(paths(&entries).contains(&"gems/specifications/rake-13.0.6.gemspec"));
        assert!(paths(&entries).contains(&"Gemfile.lock"));
    }

    #[test]
    fn gem_path_override() {
        let fx = Fixture::new();
        let active = set(vec![(fx.registry("rake", "13.0.6"), Contribution::FullTree)]);
        let policy = PackagingPolicy::new().with_gem_path("/WEB-INF/jewels").unwrap();
        let entries = map_entries(&active, &fx.manifest, &policy, ArchiveKind::Application).unwrap();

        assert!(paths(&entries).contains(&"WEB-INF/jewels/specifications/rake-13.0.6.gemspec"));
        assert!(paths(&entries).contains(&"WEB-INF/jewels/gems/rake-13.0.6/lib/rake.rb"));
        assert!(paths(&entries).contains(&"WEB-INF/Gemfile"));
    }

    #[test]
    fn vcs_full_tree_and_descriptor_only() {
        let fx = Fixture::new();
        let policy = PackagingPolicy::new();

        let active = set(vec![(fx.vcs("lint"), Contribution::FullTree)]);
        let entries = map_entries(&active, &fx.manifest, &policy, ArchiveKind::Application).unwrap();
        assert_eq!(
            paths(&entries)[..2],
            [
                "WEB-INF/gems/bundler/gems/tools-0123456789ab/lint/lib/lint.rb",
                "WEB-INF/gems/bundler/gems/tools-0123456789ab/lint/lint.gemspec",
            ]
        );
        assert_eq!(entries.len(), 4);

        let active = set(vec![(fx.vcs("lint"), Contribution::DescriptorOnly)]);
        let entries = map_entries(&active, &fx.manifest, &policy, ArchiveKind::Application).unwrap();
        assert_eq!(
            paths(&entries),
            vec![
                "WEB-INF/gems/bundler/gems/tools-0123456789ab/lint/lint.gemspec",
                "WEB-INF/Gemfile",
                "WEB-INF/Gemfile.lock",
            ]
        );
    }

    #[test]
    fn gem_excludes_skip_matching_files() {
        let fx = Fixture::new();
        let active = set(vec![(fx.registry("rake", "13.0.6"), Contribution::FullTree)]);
        let policy = PackagingPolicy::new().with_gem_exclude("*.md").unwrap();
        let entries = map_entries(&active, &fx.manifest, &policy, ArchiveKind::Library).unwrap();
        assert!(!paths(&entries).iter().any(|p| p.ends_with("README.md")));
        assert!(paths(&entries).contains(&"gems/gems/rake-13.0.6/lib/rake.rb"));
    }

    #[test]
    fn different_files_at_same_destination() {
        let fx = Fixture::new();
        let first = fx.registry("rake", "13.0.6");
        let mut second = fx.registry("rake-copy", "1.0");
        second.name = "rake".to_string();
        second.version = "13.0.6".to_string();

        let active = set(vec![
            (first, Contribution::FullTree),
            (second, Contribution::FullTree),
        ]);
        let err = map_entries(
            &active,
            &fx.manifest,
            &PackagingPolicy::new(),
            ArchiveKind::Library,
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::DuplicateDestination { .. }));
    }

    #[test]
    fn shared_checkout_is_mapped_once() {
        let fx = Fixture::new();
        let lint = fx.vcs("lint");
        let mut fmt = fx.vcs("fmt");
        fmt.install_dir = lint.install_dir.clone();

        let active = set(vec![
            (fmt, Contribution::FullTree),
            (lint, Contribution::FullTree),
        ]);
        let entries = map_entries(
            &active,
            &fx.manifest,
            &PackagingPolicy::new(),
            ArchiveKind::Library,
        )
        .unwrap();
        let tree: Vec<_> = paths(&entries)
            .into_iter()
            .filter(|p| p.starts_with("gems/bundler/gems/"))
            .collect();
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn missing_descriptor() {
        let fx = Fixture::new();
        let mut rake = fx.registry("rake", "13.0.6");
        rake.descriptor = fx.home().join("specifications/missing.gemspec");
        let err = map_entries(
            &set(vec![(rake, Contribution::FullTree)]),
            &fx.manifest,
            &PackagingPolicy::new(),
            ArchiveKind::Library,
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::MissingDescriptor { .. }));
    }

    #[test]
    fn names_cannot_escape_the_gem_root() {
        let fx = Fixture::new();
        let mut rake = fx.registry("rake", "13.0.6");
        rake.name = "../x".to_string();
        let err = map_entries(
            &set(vec![(rake, Contribution::FullTree)]),
            &fx.manifest,
            &PackagingPolicy::new(),
            ArchiveKind::Application,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LayoutError::InvalidPath { path, .. }
                if path.starts_with("WEB-INF/gems/gems/../x-13.0.6/")
        ));
    }

    #[test]
    fn detect_archive_kind() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(ArchiveKind::detect(tmp.path()), ArchiveKind::Library);
        write(&tmp.path().join("config.ru"), "run App\n");
        assert_eq!(ArchiveKind::detect(tmp.path()), ArchiveKind::Application);
    }

    #[test]
    fn frozen_excludes_install_path() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("vendor/bundle")).unwrap();

        let policy = PackagingPolicy::new();
        assert!(host_excludes(tmp.path(), &policy).is_empty());

        let policy = policy.with_frozen(true);
        assert_eq!(
            host_excludes(tmp.path(), &policy),
            vec![PathBuf::from("vendor/bundle")]
        );

        let mut policy = policy;
        policy.install_path = Some(PathBuf::from("/elsewhere/bundle"));
        assert!(host_excludes(tmp.path(), &policy).is_empty());
    }
}
