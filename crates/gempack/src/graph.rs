//! The resolved dependency graph handed over by a resolver.
//!
//! Resolvers (see [`crate::resolve`]) produce a [`ResolvedGraph`]; the group
//! filter and the source classifier only ever read it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Name of the implicit group for declarations outside any `group` block.
pub const DEFAULT_GROUP: &str = "default";

/// Where a resolved package's files physically come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Origin {
    /// Downloaded from a gem registry and installed into the gem home.
    Registry,
    /// Checked out from a version-control repository.
    Vcs { remote: String, revision: String },
    /// Used in place from a local filesystem path.
    LocalPath { path: PathBuf },
}

impl Origin {
    /// Returns true if this is a version-control checkout.
    #[must_use]
    pub fn is_vcs(&self) -> bool {
        matches!(self, Self::Vcs { .. })
    }

    /// Returns true if this is a local path origin.
    #[must_use]
    pub fn is_local_path(&self) -> bool {
        matches!(self, Self::LocalPath { .. })
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry => write!(f, "registry"),
            Self::Vcs { remote, revision } => write!(f, "git:{remote}#{revision}"),
            Self::LocalPath { path } => write!(f, "path:{}", path.display()),
        }
    }
}

/// One node of the resolved dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    /// Package name, unique within a graph.
    pub name: String,

    /// Exact resolved version, including any platform suffix (`1.6.0-java`).
    pub version: String,

    /// Where the package comes from.
    pub origin: Origin,

    /// Absolute location of the installed files.
    pub install_dir: PathBuf,

    /// Absolute location of the package's `.gemspec`.
    pub descriptor: PathBuf,

    /// Names of the packages this one requires at runtime.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ResolvedPackage {
    /// `<name>-<version>`, the installed directory name of a registry gem.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// A top-level `gem` declaration from the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    /// Declared package name.
    pub name: String,

    /// Groups the declaration belongs to. Empty means [`DEFAULT_GROUP`].
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Declaration {
    /// Create a declaration in the given groups.
    pub fn new<I, S>(name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// Groups with the implicit default group filled in.
    pub fn effective_groups(&self) -> impl Iterator<Item = &str> {
        let default = self.groups.is_empty().then_some(DEFAULT_GROUP);
        self.groups.iter().map(String::as_str).chain(default)
    }
}

/// The full graph produced by a resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedGraph {
    /// Top-level declarations, in manifest order.
    #[serde(default)]
    pub declarations: Vec<Declaration>,

    /// Every resolved package by name.
    #[serde(default)]
    pub packages: BTreeMap<String, ResolvedPackage>,
}

impl ResolvedGraph {
    /// Returns the number of resolved packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns true if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Get a package by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResolvedPackage> {
        self.packages.get(name)
    }

    /// Insert a package, replacing any previous package of the same name.
    pub fn insert(&mut self, package: ResolvedPackage) {
        self.packages.insert(package.name.clone(), package);
    }

    /// Names reachable from `roots` through runtime dependency edges,
    /// roots included. Names absent from the graph are skipped.
    pub fn reachable_from<'a, I>(&self, roots: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = roots.into_iter().collect();

        while let Some(name) = stack.pop() {
            let Some(package) = self.packages.get(name) else {
                continue;
            };
            if !seen.insert(package.name.clone()) {
                continue;
            }
            stack.extend(package.dependencies.iter().map(String::as_str));
        }

        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(name: &str, deps: &[&str]) -> ResolvedPackage {
        ResolvedPackage {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            origin: Origin::Registry,
            install_dir: PathBuf::from(format!("/gems/gems/{name}-1.0.0")),
            descriptor: PathBuf::from(format!("/gems/specifications/{name}-1.0.0.gemspec")),
            dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
        }
    }

    #[test]
    fn reachability_follows_edges_and_tolerates_cycles() {
        let mut graph = ResolvedGraph::default();
        graph.insert(package("a", &["b"]));
        graph.insert(package("b", &["c", "a"]));
        graph.insert(package("c", &["missing"]));
        graph.insert(package("d", &[]));

        let reached = graph.reachable_from(["a"]);
        assert_eq!(
            reached.into_iter().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn ungrouped_declaration_is_default() {
        let decl = Declaration::new("rake", Vec::<String>::new());
        assert_eq!(decl.effective_groups().collect::<Vec<_>>(), vec!["default"]);

        let decl = Declaration::new("rspec", ["test"]);
        assert_eq!(decl.effective_groups().collect::<Vec<_>>(), vec!["test"]);
    }

    #[test]
    fn graph_json_shape() {
        let json = r#"{
            "declarations": [{ "name": "warbler", "groups": ["test"] }],
            "packages": {
                "warbler": {
                    "name": "warbler",
                    "version": "1.4.0",
                    "origin": { "kind": "vcs", "remote": "git://x", "revision": "abc" },
                    "install_dir": "/g/bundler/gems/warbler-abc",
                    "descriptor": "/g/bundler/gems/warbler-abc/warbler.gemspec"
                }
            }
        }"#;
        let graph: ResolvedGraph = serde_json::from_str(json).unwrap();
        let warbler = graph.get("warbler").unwrap();
        assert!(warbler.origin.is_vcs());
        assert!(warbler.dependencies.is_empty());
    }
}
