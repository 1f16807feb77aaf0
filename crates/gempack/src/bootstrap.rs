//! The runtime bootstrap script.
//!
//! The script runs inside the embedded runtime before the application and
//! points Bundler at the packaged manifest. Every statement is safe to run
//! twice: environment variables are only set when absent (except the frozen
//! flag, which is a constant) and the load path entry is not duplicated.

use crate::archive::ArchiveEntry;
use crate::layout::ArchiveKind;
use crate::manifest::Manifest;
use crate::policy::{join_archive, PackagingPolicy, GEMFILE_ENV};

/// Variable holding the groups Bundler skips at run time.
pub const WITHOUT_ENV: &str = "BUNDLE_WITHOUT";

/// Variable forcing Bundler's frozen mode at run time.
pub const FROZEN_ENV: &str = "BUNDLE_FROZEN";

/// A Ruby single-quoted string literal.
fn ruby_str(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Ruby expression for an archive path when running from a library archive:
/// resolved against the script's own location.
fn relative_to_script(policy: &PackagingPolicy, path: &str) -> String {
    let depth = policy.bootstrap_path.split('/').filter(|s| !s.is_empty()).count();
    let mut parts = vec![ruby_str(".."); depth];
    parts.extend(path.split('/').filter(|s| !s.is_empty()).map(ruby_str));
    format!("File.expand_path(File.join({}), __FILE__)", parts.join(", "))
}

/// Ruby expression for an archive path inside a servlet container.
fn servlet_path(path: &str) -> String {
    format!("$servlet_context.getRealPath({})", ruby_str(&format!("/{path}")))
}

/// Generate the bootstrap script.
///
/// The script sets neither `GEM_HOME` nor `GEM_PATH`. Gems under a relocated
/// gem root (`gem-path`) are only found when the host runtime points its gem
/// path there.
#[must_use]
pub fn generate(manifest: &Manifest, policy: &PackagingPolicy, kind: ArchiveKind) -> String {
    let base = policy.base_for(kind);
    let gemfile = join_archive(base, &manifest.file_name());

    let (gemfile_expr, root_expr, host_check) = match kind {
        ArchiveKind::Application => (
            servlet_path(&gemfile),
            servlet_path(base),
            "$servlet_context",
        ),
        ArchiveKind::Library => (
            relative_to_script(policy, &gemfile),
            relative_to_script(policy, base),
            "defined?(JRUBY_VERSION)",
        ),
    };

    let mut lines = vec![format!("ENV[{}] ||= {gemfile_expr}", ruby_str(GEMFILE_ENV))];
    if !policy.excluded_groups.is_empty() {
        lines.push(format!(
            "ENV[{}] ||= {}",
            ruby_str(WITHOUT_ENV),
            ruby_str(&policy.excluded_groups.join(":"))
        ));
    }
    if policy.frozen {
        lines.push(format!("ENV[{}] = '1'", ruby_str(FROZEN_ENV)));
    }
    lines.push(format!("if {host_check}"));
    lines.push(format!("  root = {root_expr}"));
    lines.push("  $LOAD_PATH.unshift root unless $LOAD_PATH.include?(root)".to_string());
    lines.push("end".to_string());

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

/// The bootstrap script as an archive entry at the policy's location.
#[must_use]
pub fn entry(manifest: &Manifest, policy: &PackagingPolicy, kind: ArchiveKind) -> ArchiveEntry {
    ArchiveEntry::bytes(
        policy.bootstrap_path.clone(),
        generate(manifest, policy, kind),
    )
}
