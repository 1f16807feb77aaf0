//! Reader for `Gemfile.lock`.
//!
//! The lock file records the exact versions a previous resolution picked:
//!
//! ```text
//! GIT
//!   remote: https://github.com/jruby/warbler
//!   revision: 4f3a1c2b3d4e5f60718293a4b5c6d7e8f9012345
//!   specs:
//!     warbler (1.4.0)
//!       rake (>= 0.9.6)
//!
//! GEM
//!   remote: https://rubygems.org/
//!   specs:
//!     rake (10.1.0)
//!
//! DEPENDENCIES
//!   rake
//!   warbler!
//! ```

use thiserror::Error;

/// The lock file name, relative to the manifest.
pub const LOCK_SUFFIX: &str = ".lock";

/// Errors that can occur when reading a lock file.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("line {line}: malformed entry '{text}'")]
    Malformed { line: usize, text: String },

    #[error("line {line}: entry outside of a section")]
    OutsideSection { line: usize },

    #[error("git source '{remote}' has no revision")]
    MissingRevision { remote: String },

    #[error("package '{name}' is locked more than once")]
    DuplicateSpec { name: String },
}

/// The kind of a lock file source section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// `GEM`: a gem registry.
    Gem,
    /// `GIT`: a git checkout.
    Git,
    /// `PATH`: a local directory.
    Path,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gem => write!(f, "GEM"),
            Self::Git => write!(f, "GIT"),
            Self::Path => write!(f, "PATH"),
        }
    }
}

/// A `GEM`, `GIT` or `PATH` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedSource {
    /// Section kind.
    pub kind: SourceKind,
    /// `remote:` value (registry URL, repository URL or directory).
    pub remote: Option<String>,
    /// `revision:` value, git sections only.
    pub revision: Option<String>,
    /// Packages locked from this source.
    pub specs: Vec<LockedSpec>,
}

/// One locked package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedSpec {
    /// Package name.
    pub name: String,
    /// Exact version, including any platform suffix.
    pub version: String,
    /// Names of the packages it requires.
    pub dependencies: Vec<String>,
}

/// An entry of the `DEPENDENCIES` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedDependency {
    /// Declared name.
    pub name: String,
    /// `!` marker: the dependency is pinned to a non-registry source.
    pub pinned: bool,
}

/// A parsed `Gemfile.lock`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lockfile {
    /// Source sections in file order.
    pub sources: Vec<LockedSource>,
    /// The `DEPENDENCIES` section.
    pub dependencies: Vec<LockedDependency>,
    /// The `BUNDLED WITH` version.
    pub bundled_with: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Source,
    Dependencies,
    BundledWith,
    Ignored,
}

impl Lockfile {
    /// Parse lock file content.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed entries, git sources without a revision,
    /// or a package locked twice.
    pub fn parse(content: &str) -> Result<Self, LockError> {
        let mut lock = Self::default();
        let mut section: Option<Section> = None;
        let mut in_specs = false;

        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            if raw.trim().is_empty() {
                continue;
            }

            let indent = raw.len() - raw.trim_start().len();
            let text = raw.trim();

            if indent == 0 {
                in_specs = false;
                section = Some(match text {
                    "GEM" | "GIT" | "PATH" => {
                        let kind = match text {
                            "GEM" => SourceKind::Gem,
                            "GIT" => SourceKind::Git,
                            _ => SourceKind::Path,
                        };
                        lock.sources.push(LockedSource {
                            kind,
                            remote: None,
                            revision: None,
                            specs: Vec::new(),
                        });
                        Section::Source
                    }
                    "DEPENDENCIES" => Section::Dependencies,
                    "BUNDLED WITH" => Section::BundledWith,
                    _ => Section::Ignored,
                });
                continue;
            }

            match section.ok_or(LockError::OutsideSection { line })? {
                Section::Source => {
                    let source = lock
                        .sources
                        .last_mut()
                        .ok_or(LockError::OutsideSection { line })?;
                    if indent == 2 {
                        in_specs = text == "specs:";
                        if let Some((key, value)) = text.split_once(':') {
                            let value = value.trim().to_string();
                            match key {
                                "remote" => source.remote = Some(value),
                                "revision" => source.revision = Some(value),
                                _ => {}
                            }
                        }
                    } else if in_specs && indent == 4 {
                        let (name, version) = split_entry(text);
                        let version = version.ok_or_else(|| LockError::Malformed {
                            line,
                            text: text.to_string(),
                        })?;
                        source.specs.push(LockedSpec {
                            name: name.to_string(),
                            version: version.to_string(),
                            dependencies: Vec::new(),
                        });
                    } else if in_specs && indent >= 6 {
                        let spec = source.specs.last_mut().ok_or_else(|| LockError::Malformed {
                            line,
                            text: text.to_string(),
                        })?;
                        let (name, _) = split_entry(text);
                        spec.dependencies.push(name.to_string());
                    }
                }
                Section::Dependencies => {
                    let (name, _) = split_entry(text);
                    let (name, pinned) = match name.strip_suffix('!') {
                        Some(name) => (name, true),
                        None => (name, false),
                    };
                    lock.dependencies.push(LockedDependency {
                        name: name.to_string(),
                        pinned,
                    });
                }
                Section::BundledWith => lock.bundled_with = Some(text.to_string()),
                Section::Ignored => {}
            }
        }

        lock.validate()?;
        Ok(lock)
    }

    fn validate(&self) -> Result<(), LockError> {
        // Platform variants of one gem share a source; across sources a name
        // must be unique.
        let mut seen = std::collections::BTreeMap::new();
        for (index, source) in self.sources.iter().enumerate() {
            if source.kind == SourceKind::Git && source.revision.is_none() {
                return Err(LockError::MissingRevision {
                    remote: source.remote.clone().unwrap_or_default(),
                });
            }
            for spec in &source.specs {
                if *seen.entry(spec.name.as_str()).or_insert(index) != index {
                    return Err(LockError::DuplicateSpec {
                        name: spec.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Iterate over every locked package with its source.
    pub fn specs(&self) -> impl Iterator<Item = (&LockedSource, &LockedSpec)> {
        self.sources
            .iter()
            .flat_map(|source| source.specs.iter().map(move |spec| (source, spec)))
    }

    /// Find a locked package and its source by name.
    ///
    /// With several platform variants, the first one listed is returned.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(&LockedSource, &LockedSpec)> {
        self.specs().find(|(_, spec)| spec.name == name)
    }

    /// Every locked variant of a package.
    pub fn variants<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = (&'a LockedSource, &'a LockedSpec)> {
        self.specs().filter(move |(_, spec)| spec.name == name)
    }
}

/// Split `name (requirement)` into its parts.
fn split_entry(text: &str) -> (&str, Option<&str>) {
    match text.split_once(" (") {
        Some((name, rest)) => (name.trim(), rest.strip_suffix(')').map(str::trim)),
        None => (text.trim(), None),
    }
}
