//! Project traits, and the Bundler trait that drives dependency packaging.

use crate::classify::{classify_all, ActivePackageSet};
use crate::gemfile::GEMFILE;
use crate::groups;
use crate::layout::ArchiveKind;
use crate::manifest::Manifest;
use crate::plan::PackagingError;
use crate::policy::PackagingPolicy;
use crate::resolve::DependencyResolver;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A packaging trait found by inspecting the project directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectTrait {
    /// Dependencies are managed by Bundler.
    Bundler,
    /// The project is packaged as an archive of the given kind.
    Archive(ArchiveKind),
}

impl ProjectTrait {
    /// Every trait that applies to a project, Bundler first.
    ///
    /// The archive kind comes from the policy when it names one.
    #[must_use]
    pub fn detect_all(project: &Path, policy: &PackagingPolicy) -> Vec<Self> {
        let mut traits = Vec::new();
        if BundlerTrait::detect(project, policy) {
            traits.push(Self::Bundler);
        }
        let kind = policy
            .archive_kind
            .unwrap_or_else(|| ArchiveKind::detect(project));
        traits.push(Self::Archive(kind));
        debug!("project traits for {}: {traits:?}", project.display());
        traits
    }

    /// The archive kind among a set of traits.
    #[must_use]
    pub fn archive_kind(traits: &[Self]) -> ArchiveKind {
        traits
            .iter()
            .find_map(|t| match t {
                Self::Archive(kind) => Some(*kind),
                Self::Bundler => None,
            })
            .unwrap_or(ArchiveKind::Library)
    }
}

/// The Bundler packaging trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundlerTrait;

impl BundlerTrait {
    /// The manifest location: the override (relative to the project) or
    /// `<project>/Gemfile`.
    #[must_use]
    pub fn manifest_path(project: &Path, policy: &PackagingPolicy) -> PathBuf {
        match &policy.manifest_override {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => project.join(path),
            None => project.join(GEMFILE),
        }
    }

    /// Returns true if the project uses Bundler.
    #[must_use]
    pub fn detect(project: &Path, policy: &PackagingPolicy) -> bool {
        policy.manifest_override.is_some() || project.join(GEMFILE).is_file()
    }

    /// Resolve the project and classify its packages.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or resolution fails.
    pub fn apply(
        project: &Path,
        policy: &PackagingPolicy,
        resolver: &dyn DependencyResolver,
    ) -> Result<(ActivePackageSet, Manifest), PackagingError> {
        let manifest = Manifest::load(Self::manifest_path(project, policy))?;
        info!(
            "packaging dependencies from {} (frozen: {})",
            manifest.path.display(),
            policy.frozen
        );

        let graph = resolver.resolve(&manifest, policy.frozen)?;
        let active = groups::select(
            &graph,
            &policy.excluded_groups,
            &policy.allow_list,
            &policy.manager_package,
        );
        debug!("{} of {} packages active", active.len(), graph.len());

        Ok((classify_all(&graph, &active), manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Declaration, Origin, ResolvedGraph, ResolvedPackage};
    use crate::resolve::ResolveError;
    use std::fs;
    use tempfile::TempDir;

    struct FixedResolver(ResolvedGraph);

    impl DependencyResolver for FixedResolver {
        fn resolve(&self, _: &Manifest, _: bool) -> Result<ResolvedGraph, ResolveError> {
            Ok(self.0.clone())
        }
    }

    struct FailingResolver;

    impl DependencyResolver for FailingResolver {
        fn resolve(&self, manifest: &Manifest, _: bool) -> Result<ResolvedGraph, ResolveError> {
            Err(ResolveError::MissingLockfile(manifest.lock_path.clone()))
        }
    }

    fn package(name: &str, origin: Origin) -> ResolvedPackage {
        ResolvedPackage {
            name: name.to_string(),
            version: "1.0".to_string(),
            origin,
            install_dir: PathBuf::from(name),
            descriptor: PathBuf::from(format!("{name}.gemspec")),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn detection() {
        let tmp = TempDir::new().unwrap();
        let policy = PackagingPolicy::new();
        assert!(!BundlerTrait::detect(tmp.path(), &policy));
        assert_eq!(
            ProjectTrait::detect_all(tmp.path(), &policy),
            vec![ProjectTrait::Archive(ArchiveKind::Library)]
        );

        fs::write(tmp.path().join("Gemfile"), "").unwrap();
        assert!(BundlerTrait::detect(tmp.path(), &policy));

        let policy = policy.with_archive_kind(ArchiveKind::Application);
        let traits = ProjectTrait::detect_all(tmp.path(), &policy);
        assert_eq!(traits[0], ProjectTrait::Bundler);
        assert_eq!(ProjectTrait::archive_kind(&traits), ArchiveKind::Application);
    }

    #[test]
    fn manifest_override_is_relative_to_project() {
        let tmp = TempDir::new().unwrap();
        let policy = PackagingPolicy::new().with_env([("BUNDLE_GEMFILE", "gemfiles/Special")]);
        assert!(BundlerTrait::detect(tmp.path(), &policy));
        assert_eq!(
            BundlerTrait::manifest_path(tmp.path(), &policy),
            tmp.path().join("gemfiles/Special")
        );
    }

    #[test]
    fn apply_filters_and_classifies() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Gemfile"), "gem 'rack'\n").unwrap();

        let mut graph = ResolvedGraph::default();
        graph.insert(package("rack", Origin::Registry));
        graph.insert(package("rspec", Origin::Registry));
        graph.insert(package("local", Origin::LocalPath { path: "../local".into() }));
        graph.declarations = vec![
            Declaration::new("rack", Vec::<String>::new()),
            Declaration::new("rspec", ["test"]),
            Declaration::new("local", Vec::<String>::new()),
        ];

        let (set, manifest) =
            BundlerTrait::apply(tmp.path(), &PackagingPolicy::new(), &FixedResolver(graph))
                .unwrap();
        assert_eq!(manifest.file_name(), "Gemfile");
        assert_eq!(set.len(), 1);
        assert!(set.get("rack").is_some());
        assert_eq!(set.diagnostics.len(), 1);
    }

    #[test]
    fn resolution_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Gemfile"), "gem 'rack'\n").unwrap();
        let err = BundlerTrait::apply(tmp.path(), &PackagingPolicy::new(), &FailingResolver)
            .unwrap_err();
        assert!(matches!(err, PackagingError::Resolution(_)));
    }
}
