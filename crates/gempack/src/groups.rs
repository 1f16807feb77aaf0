//! Group filtering: which resolved packages get embedded.

use crate::graph::ResolvedGraph;
use std::collections::BTreeSet;
use tracing::debug;

/// Select the active packages of a graph.
///
/// Roots are the declarations with at least one group outside
/// `excluded_groups` (ungrouped declarations are in the `default` group),
/// narrowed to `allow_list` when it is non-empty. Every package a root
/// reaches is active, so a package required from both an excluded and an
/// included declaration stays in. `manager_package` is active whenever the
/// graph contains it.
#[must_use]
pub fn select(
    graph: &ResolvedGraph,
    excluded_groups: &[String],
    allow_list: &BTreeSet<String>,
    manager_package: &str,
) -> BTreeSet<String> {
    let included = |group: &str| !excluded_groups.iter().any(|g| g == group);

    let mut roots: Vec<&str> = graph
        .declarations
        .iter()
        .filter(|d| d.effective_groups().any(included))
        .map(|d| d.name.as_str())
        .collect();

    if !allow_list.is_empty() {
        roots.retain(|name| allow_list.contains(*name));
        // Allow-listed transitive requirements count even when undeclared.
        roots.extend(
            allow_list
                .iter()
                .map(String::as_str)
                .filter(|name| graph.get(name).is_some())
                .filter(|name| !graph.declarations.iter().any(|d| d.name == *name)),
        );
    }

    let mut active = graph.reachable_from(roots);
    if graph.get(manager_package).is_some() {
        active.insert(manager_package.to_string());
    }

    for name in graph.packages.keys().filter(|n| !active.contains(*n)) {
        debug!("excluding {name}: only required from excluded groups");
    }

    active
}
