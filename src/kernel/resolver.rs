//! Dependency resolution and ordering.
//!
//! `resolve` validates that every declared dependency is satisfiable;
//! `order` produces the start order (dependencies strictly before their
//! dependents); `shutdown_order` produces the stop order using the
//! inbound-reference heuristic with built-ins and the manager pinned last.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::kernel::descriptor::ModuleDescriptor;
use crate::types::{Error, Result};

/// Name of the manager module, pinned near the end of the shutdown order.
pub const MANAGER_MODULE: &str = "framework-manager";

/// A resolution universe: one pass's worth of descriptors, keyed by name.
///
/// `BTreeMap` keeps iteration deterministic, so ordering is stable across
/// runs for identical inputs.
pub type Universe = BTreeMap<String, ModuleDescriptor>;

/// Validate that every declared dependency in `universe` resolves to the
/// universe itself or to `satisfied` (already-running modules and registered
/// built-ins). Fails the whole pass on the first unknown name.
pub fn resolve(universe: &Universe, satisfied: &BTreeSet<String>) -> Result<()> {
    for (name, descriptor) in universe {
        for dep in &descriptor.dependencies {
            if !universe.contains_key(dep) && !satisfied.contains(dep) {
                return Err(Error::missing_dependency(format!(
                    "module [{name}] requires [{dep}]"
                )));
            }
        }
    }
    Ok(())
}

/// Compute the start order for a universe.
///
/// Descriptors with no in-universe dependencies come first; every other
/// descriptor appears strictly after all of its in-universe dependencies.
/// Dependencies satisfied outside the universe are already running and are
/// not ordered here. Cycles are rejected with the offending path named.
pub fn order(universe: &Universe) -> Result<Vec<String>> {
    let mut ordered: Vec<String> = Vec::with_capacity(universe.len());
    let mut done: BTreeSet<&str> = BTreeSet::new();

    for (name, descriptor) in universe {
        let leaf = descriptor
            .dependencies
            .iter()
            .all(|dep| !universe.contains_key(dep.as_str()));
        if leaf {
            ordered.push(name.clone());
            done.insert(name.as_str());
        }
    }

    let mut path: Vec<&str> = Vec::new();
    for name in universe.keys() {
        visit(name, universe, &mut done, &mut ordered, &mut path)?;
    }

    debug!(order = ?ordered, "computed module start order");
    Ok(ordered)
}

fn visit<'a>(
    name: &'a str,
    universe: &'a Universe,
    done: &mut BTreeSet<&'a str>,
    ordered: &mut Vec<String>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|n| *n == name) {
        let mut cycle: Vec<&str> = path[start..].to_vec();
        cycle.push(name);
        return Err(Error::dependency_cycle(cycle.join(" -> ")));
    }

    path.push(name);
    // Unknown names were already validated by resolve(); skip them here.
    if let Some(descriptor) = universe.get(name) {
        for dep in &descriptor.dependencies {
            if universe.contains_key(dep.as_str()) {
                visit(dep, universe, done, ordered, path)?;
            }
        }
    }
    path.pop();

    done.insert(name);
    ordered.push(name.to_string());
    Ok(())
}

/// Compute the stop order for the currently loaded modules.
///
/// Sorts ascending by inbound-reference count (how many other loaded
/// non-built-in modules declare a dependency on this one), so leaf consumers
/// stop first. Built-in modules are pinned last with a sentinel count, the
/// manager module just before them; declared references still add onto the
/// manager's sentinel. Ties break by name. This heuristic matches the
/// long-standing observable behavior; it is not a true reverse-topological
/// order for diamond-shaped graphs.
pub fn shutdown_order(loaded: &[ModuleDescriptor]) -> Vec<String> {
    let mut weights: BTreeMap<&str, i64> = BTreeMap::new();
    for descriptor in loaded {
        let base = if descriptor.internal {
            i64::from(i32::MAX)
        } else if descriptor.name == MANAGER_MODULE {
            i64::from(i32::MAX >> 1)
        } else {
            0
        };
        weights.insert(descriptor.name.as_str(), base);
    }
    for descriptor in loaded.iter().filter(|d| !d.internal) {
        for dep in &descriptor.dependencies {
            if let Some(count) = weights.get_mut(dep.as_str()) {
                *count += 1;
            }
        }
    }

    let mut names: Vec<&str> = weights.keys().copied().collect();
    names.sort_by(|a, b| weights[a].cmp(&weights[b]).then_with(|| a.cmp(b)));
    names.into_iter().map(str::to_string).collect()
}
