//! Packaging policy and where it comes from.
//!
//! A [`PackagingPolicy`] is assembled once per run from three layers, lowest
//! precedence first:
//!
//! 1. built-in defaults,
//! 2. Bundler's own settings in `.bundle/config` ([`BundleSettings`]),
//! 3. the optional `gempack.toml` next to the `Gemfile` ([`PolicyFile`]),
//!
//! plus an explicit environment snapshot for `BUNDLE_GEMFILE`. Components
//! never read the process environment themselves.
//!
//! ```toml
//! excluded-groups = ["development", "test"]
//! gem-path = "/WEB-INF/jewels"
//! gem-excludes = ["**/spec/**"]
//!
//! [resolver]
//! kind = "command"
//! program = "ruby"
//! args = ["script/resolve_graph.rb"]
//! ```

use crate::layout::ArchiveKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The policy file name.
pub const POLICY_FILE: &str = "gempack.toml";

/// Bundler's per-project settings file, relative to the project root.
pub const BUNDLE_CONFIG: &str = ".bundle/config";

/// Environment variable naming an alternate manifest.
pub const GEMFILE_ENV: &str = "BUNDLE_GEMFILE";

/// Groups left out unless the policy says otherwise.
pub const DEFAULT_EXCLUDED_GROUPS: [&str; 3] = ["development", "test", "assets"];

/// Default root directory inside application archives.
pub const DEFAULT_BASE: &str = "WEB-INF";

/// Default location of the generated bootstrap script.
pub const DEFAULT_BOOTSTRAP: &str = "META-INF/init.rb";

/// Default name of the dependency manager's own package.
pub const DEFAULT_MANAGER_PACKAGE: &str = "bundler";

/// Bundler's install path in deployment mode when none is configured.
pub const DEFAULT_DEPLOYMENT_PATH: &str = "vendor/bundle";

/// Errors that can occur while assembling a policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to read policy: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {POLICY_FILE}: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to parse {BUNDLE_CONFIG}: {0}")]
    BundleConfig(#[from] serde_yaml::Error),

    #[error("invalid gem exclude pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("invalid archive path '{0}': must not contain '..'")]
    InvalidArchivePath(String),
}

/// How the dependency graph is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ResolverConfig {
    /// Read `Gemfile.lock` and an installed gem home.
    Lockfile {
        /// Gem home holding `gems/` and `specifications/`.
        #[serde(default, rename = "gem-home")]
        gem_home: Option<PathBuf>,
    },
    /// Run an external command that prints the graph as JSON.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::Lockfile { gem_home: None }
    }
}

/// The immutable packaging policy threaded through every component.
#[derive(Debug, Clone, PartialEq)]
pub struct PackagingPolicy {
    /// Groups whose packages are left out.
    pub excluded_groups: Vec<String>,

    /// Frozen/deployment mode: locked versions only, no install cache.
    pub frozen: bool,

    /// Root directory inside application archives.
    pub base: String,

    /// Replaces `<base>/gems` as the dependency tree root.
    pub gem_path: Option<String>,

    /// When non-empty, only these packages and their requirements are active.
    pub allow_list: BTreeSet<String>,

    /// Alternate manifest location (`BUNDLE_GEMFILE`).
    pub manifest_override: Option<PathBuf>,

    /// Bundler install directory, relative to the project root.
    pub install_path: Option<PathBuf>,

    /// Archive location of the bootstrap script.
    pub bootstrap_path: String,

    /// The dependency manager's own package, always kept when resolved.
    pub manager_package: String,

    /// Files inside gem trees to leave out.
    pub gem_excludes: Vec<glob::Pattern>,

    /// Archive kind, when not detected from the project.
    pub archive_kind: Option<ArchiveKind>,

    /// How to obtain the resolved graph.
    pub resolver: ResolverConfig,
}

impl Default for PackagingPolicy {
    fn default() -> Self {
        Self {
            excluded_groups: DEFAULT_EXCLUDED_GROUPS.iter().map(|g| (*g).to_string()).collect(),
            frozen: false,
            base: DEFAULT_BASE.to_string(),
            gem_path: None,
            allow_list: BTreeSet::new(),
            manifest_override: None,
            install_path: None,
            bootstrap_path: DEFAULT_BOOTSTRAP.to_string(),
            manager_package: DEFAULT_MANAGER_PACKAGE.to_string(),
            gem_excludes: Vec::new(),
            archive_kind: None,
            resolver: ResolverConfig::default(),
        }
    }
}

impl PackagingPolicy {
    /// Create a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble the policy for a project directory.
    ///
    /// `env` is a snapshot of the environment; only `BUNDLE_GEMFILE` is used.
    ///
    /// # Errors
    ///
    /// Returns an error if `.bundle/config` or `gempack.toml` exist but are invalid.
    pub fn load<I, K, V>(project: impl AsRef<Path>, env: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let project = project.as_ref();
        let mut policy = Self::default();

        let settings_path = project.join(BUNDLE_CONFIG);
        if settings_path.is_file() {
            let settings = BundleSettings::from_path(&settings_path)?;
            policy = policy.with_bundle_settings(&settings);
        }

        let policy_path = project.join(POLICY_FILE);
        if policy_path.is_file() {
            let file = PolicyFile::from_path(&policy_path)?;
            policy = policy.with_file(file)?;
        }

        Ok(policy.with_env(env))
    }

    /// Apply Bundler's project settings.
    #[must_use]
    pub fn with_bundle_settings(mut self, settings: &BundleSettings) -> Self {
        self.frozen = settings.frozen();
        self.install_path = settings
            .path()
            .map(PathBuf::from)
            .or_else(|| settings.deployment().then(|| PathBuf::from(DEFAULT_DEPLOYMENT_PATH)));
        if let Some(gemfile) = settings.get("BUNDLE_GEMFILE") {
            self.manifest_override = Some(PathBuf::from(gemfile));
        }
        self
    }

    /// Apply a `gempack.toml`. Fields it leaves out keep their current value.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid glob or an archive path containing `..`.
    pub fn with_file(mut self, file: PolicyFile) -> Result<Self, PolicyError> {
        if let Some(groups) = file.excluded_groups {
            self.excluded_groups = groups;
        }
        if let Some(frozen) = file.frozen {
            self.frozen = frozen;
        }
        if let Some(base) = file.base {
            self.base = archive_dir(&base)?;
        }
        if let Some(gem_path) = file.gem_path {
            self.gem_path = Some(archive_dir(&gem_path)?);
        }
        if let Some(allow) = file.allow {
            self.allow_list = allow.into_iter().collect();
        }
        if let Some(bootstrap) = file.bootstrap {
            self.bootstrap_path = archive_dir(&bootstrap)?;
        }
        if let Some(manager) = file.manager_package {
            self.manager_package = manager;
        }
        for pattern in file.gem_excludes {
            self.gem_excludes.push(glob::Pattern::new(&pattern)?);
        }
        if let Some(kind) = file.archive_kind {
            self.archive_kind = Some(kind);
        }
        if let Some(resolver) = file.resolver {
            self.resolver = resolver;
        }
        Ok(self)
    }

    /// Apply an environment snapshot.
    #[must_use]
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in env {
            if key.as_ref() == GEMFILE_ENV {
                let value = value.into();
                if !value.is_empty() {
                    self.manifest_override = Some(PathBuf::from(value));
                }
            }
        }
        self
    }

    /// Replace the excluded groups.
    #[must_use]
    pub fn with_excluded_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable frozen/deployment mode.
    #[must_use]
    pub fn with_frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }

    /// Override the dependency tree root.
    ///
    /// # Errors
    ///
    /// Returns an error if the path contains `..`.
    pub fn with_gem_path(mut self, gem_path: &str) -> Result<Self, PolicyError> {
        self.gem_path = Some(archive_dir(gem_path)?);
        Ok(self)
    }

    /// Restrict packaging to these packages and their requirements.
    #[must_use]
    pub fn with_allow_list<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list = names.into_iter().map(Into::into).collect();
        self
    }

    /// Leave out gem files matching a glob.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is invalid.
    pub fn with_gem_exclude(mut self, pattern: &str) -> Result<Self, PolicyError> {
        self.gem_excludes.push(glob::Pattern::new(pattern)?);
        Ok(self)
    }

    /// Select how the graph is resolved.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    /// Force an archive kind.
    #[must_use]
    pub fn with_archive_kind(mut self, kind: ArchiveKind) -> Self {
        self.archive_kind = Some(kind);
        self
    }

    /// The `<base>/gems` default, or the overridden gem path.
    #[must_use]
    pub fn gem_root(&self, kind: ArchiveKind) -> String {
        match &self.gem_path {
            Some(path) => path.clone(),
            None => join_archive(self.base_for(kind), "gems"),
        }
    }

    /// `<base>` for application archives, the archive root otherwise.
    #[must_use]
    pub fn base_for(&self, kind: ArchiveKind) -> &str {
        match kind {
            ArchiveKind::Application => &self.base,
            ArchiveKind::Library => "",
        }
    }
}

/// Join archive path segments, skipping empty ones.
pub(crate) fn join_archive(parent: &str, child: &str) -> String {
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{parent}/{child}"),
    }
}

/// Normalize an archive directory: no leading/trailing or doubled `/`, no `..`.
fn archive_dir(path: &str) -> Result<String, PolicyError> {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.contains(&"..") {
        return Err(PolicyError::InvalidArchivePath(path.to_string()));
    }
    Ok(segments.join("/"))
}

/// The `gempack.toml` file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PolicyFile {
    /// Replaces the default excluded groups.
    #[serde(default)]
    pub excluded_groups: Option<Vec<String>>,

    /// Frozen/deployment mode; overrides `.bundle/config`.
    #[serde(default)]
    pub frozen: Option<bool>,

    /// Root directory inside application archives.
    #[serde(default)]
    pub base: Option<String>,

    /// Dependency tree root inside the archive.
    #[serde(default)]
    pub gem_path: Option<String>,

    /// Allow-list of package names.
    #[serde(default)]
    pub allow: Option<Vec<String>>,

    /// Bootstrap script location.
    #[serde(default)]
    pub bootstrap: Option<String>,

    /// Dependency manager package name.
    #[serde(default)]
    pub manager_package: Option<String>,

    /// Globs of gem files to leave out.
    #[serde(default)]
    pub gem_excludes: Vec<String>,

    /// Archive kind.
    #[serde(default)]
    pub archive_kind: Option<ArchiveKind>,

    /// Resolver selection.
    #[serde(default)]
    pub resolver: Option<ResolverConfig>,
}

impl PolicyFile {
    /// Load a policy file from a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a policy file from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or has unknown fields.
    pub fn parse(content: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(content)?)
    }
}

/// Bundler's `.bundle/config` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleSettings {
    values: BTreeMap<String, String>,
}

impl BundleSettings {
    /// Load settings from a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a YAML mapping.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse settings from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a YAML mapping.
    pub fn parse(content: &str) -> Result<Self, PolicyError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let raw: Option<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(content)?;
        let values = raw
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((key, value))
            })
            .collect();
        Ok(Self { values })
    }

    /// Get a raw setting.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// `BUNDLE_FROZEN` or `BUNDLE_DEPLOYMENT` is set.
    #[must_use]
    pub fn frozen(&self) -> bool {
        self.flag("BUNDLE_FROZEN") || self.deployment()
    }

    /// `BUNDLE_DEPLOYMENT` is set.
    #[must_use]
    pub fn deployment(&self) -> bool {
        self.flag("BUNDLE_DEPLOYMENT")
    }

    /// `BUNDLE_PATH`, the install directory.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.get("BUNDLE_PATH")
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|v| matches!(v, "1" | "true" | "yes"))
    }
}
