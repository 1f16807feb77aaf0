//! Source classification: what each resolved package contributes.

use crate::graph::{Origin, ResolvedGraph, ResolvedPackage};
use std::collections::BTreeSet;
use tracing::warn;

/// The files a package contributes to the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    /// The installed tree plus the descriptor.
    FullTree,
    /// Only the `.gemspec`.
    DescriptorOnly,
}

/// Something worth telling the caller about that did not stop packaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A local-path package was dropped.
    UnsupportedOrigin { name: String, version: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedOrigin { name, version } => write!(
                f,
                "path dependencies are not supported; '{name}-{version}' was not packaged \
                 and the application may fail to boot"
            ),
        }
    }
}

/// The outcome of classifying one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Embed the package.
    Include(Contribution),
    /// Leave it out: not active and nothing to keep.
    Excluded,
    /// Leave it out: its origin cannot be embedded.
    Unsupported(Diagnostic),
}

/// Classify one package given whether the group filter kept it.
///
/// Inactive VCS packages keep their descriptor, since Bundler looks up every
/// git source of the lock file at load time.
#[must_use]
pub fn classify(package: &ResolvedPackage, active: bool) -> Classification {
    match (&package.origin, active) {
        (Origin::LocalPath { .. }, _) => Classification::Unsupported(Diagnostic::UnsupportedOrigin {
            name: package.name.clone(),
            version: package.version.clone(),
        }),
        (_, true) => Classification::Include(Contribution::FullTree),
        (Origin::Vcs { .. }, false) => Classification::Include(Contribution::DescriptorOnly),
        (Origin::Registry, false) => Classification::Excluded,
    }
}

/// A package with what it contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePackage {
    pub package: ResolvedPackage,
    pub contribution: Contribution,
}

/// The classified packages of one run, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivePackageSet {
    pub packages: Vec<ActivePackage>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ActivePackageSet {
    /// Returns the number of packages contributing files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns true if nothing is contributed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Get a package by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ActivePackage> {
        self.packages.iter().find(|p| p.package.name == name)
    }

    /// Packages contributing their full tree.
    pub fn full_trees(&self) -> impl Iterator<Item = &ResolvedPackage> {
        self.packages
            .iter()
            .filter(|p| p.contribution == Contribution::FullTree)
            .map(|p| &p.package)
    }
}

/// Classify every package of a graph.
#[must_use]
pub fn classify_all(graph: &ResolvedGraph, active: &BTreeSet<String>) -> ActivePackageSet {
    let mut set = ActivePackageSet::default();

    for package in graph.packages.values() {
        match classify(package, active.contains(&package.name)) {
            Classification::Include(contribution) => set.packages.push(ActivePackage {
                package: package.clone(),
                contribution,
            }),
            Classification::Excluded => {}
            Classification::Unsupported(diagnostic) => {
                warn!("{diagnostic}");
                set.diagnostics.push(diagnostic);
            }
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

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

    fn vcs() -> Origin {
        Origin::Vcs {
            remote: "/src/warbler".to_string(),
            revision: "abc".to_string(),
        }
    }

    #[test]
    fn registry() {
        let rake = package("rake", Origin::Registry);
        assert_eq!(
            classify(&rake, true),
            Classification::Include(Contribution::FullTree)
        );
        assert_eq!(classify(&rake, false), Classification::Excluded);
    }

    #[test]
    fn vcs_full_tree_wins_when_active() {
        let warbler = package("warbler", vcs());
        assert_eq!(
            classify(&warbler, true),
            Classification::Include(Contribution::FullTree)
        );
        assert_eq!(
            classify(&warbler, false),
            Classification::Include(Contribution::DescriptorOnly)
        );
    }

    #[test]
    fn local_path_is_never_included() {
        let local = package("local", Origin::LocalPath { path: "../local".into() });
        for active in [true, false] {
            assert!(matches!(
                classify(&local, active),
                Classification::Unsupported(Diagnostic::UnsupportedOrigin { .. })
            ));
        }
    }

    #[test]
    fn classify_all_orders_and_reports() {
        let mut graph = ResolvedGraph::default();
        graph.insert(package("warbler", vcs()));
        graph.insert(package("rake", Origin::Registry));
        graph.insert(package("rspec", Origin::Registry));
        graph.insert(package("local", Origin::LocalPath { path: "../local".into() }));

        let active: BTreeSet<String> = ["rake".to_string(), "local".to_string()].into();
        let set = classify_all(&graph, &active);

        let names: Vec<_> = set.packages.iter().map(|p| p.package.name.as_str()).collect();
        assert_eq!(names, vec!["rake", "warbler"]);
        assert_eq!(set.get("warbler").unwrap().contribution, Contribution::DescriptorOnly);
        assert_eq!(set.full_trees().count(), 1);
        assert_eq!(set.diagnostics.len(), 1);
        assert!(set.diagnostics[0].to_string().contains("local-1.0"));
    }
}
