//! Module descriptors and the module contract.
//!
//! A descriptor is immutable metadata parsed from a package's embedded
//! `module.properties` (or supplied directly for built-in registrations).
//! Instances never mutate a descriptor after creation; lifecycle events
//! carry cloned snapshots.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::properties::Properties;
use crate::types::Result;

/// Descriptor resource name embedded in every module unit.
pub const DESCRIPTOR_RESOURCE: &str = "META-INF/module.properties";

/// Immutable metadata describing a module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Unique module name.
    pub name: String,

    /// Entry-point identifier, resolved through the scope symbol tables.
    pub entry: String,

    /// Declared dependency names.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Built-in flag. Built-ins run in the host scope and are pinned last
    /// in the shutdown order.
    #[serde(default)]
    pub internal: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,

    /// HTTP context path, forwarded to the httpd integration service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_path: Option<String>,

    /// Base directory override for web content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_base: Option<String>,

    /// The module needs the httpd integration service attached at start.
    #[serde(default)]
    pub require_httpd: bool,

    /// Packages this module exports for cross-module consumption.
    #[serde(default)]
    pub api_packages: Vec<String>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, entry: impl Into<String>, internal: bool) -> Self {
        Self {
            name: name.into(),
            entry: entry.into(),
            dependencies: Vec::new(),
            internal,
            version: None,
            memo: None,
            context_path: None,
            context_base: None,
            require_httpd: false,
            api_packages: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Parse a descriptor from `module.properties` contents.
    ///
    /// Returns `None` when `module.name` is absent (the unit is not a module).
    pub fn from_properties(props: &Properties, internal: bool) -> Option<Self> {
        let name = props.get("module.name")?.to_string();
        let entry = props.get("module.impl").unwrap_or_default().to_string();

        let mut descriptor = Self::new(name, entry, internal);
        if let Some(deps) = props.get("dependency") {
            descriptor.dependencies = split_names(deps);
        }
        descriptor.context_path = props.get("context.path").map(str::to_string);
        descriptor.version = props.get("module.version").map(str::to_string);
        descriptor.memo = props.get("module.memo").map(str::to_string);
        descriptor.context_base = props.get("context.base").map(str::to_string);
        descriptor.require_httpd = props.get_bool("require.httpd", false);
        if let Some(packages) = props.get("api.packages") {
            descriptor.api_packages = packages
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Some(descriptor)
    }
}

/// Split a whitespace/comma separated name list.
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Lifecycle state machine
// =============================================================================

/// Per-instance lifecycle states.
///
/// `Discovered → Resolved → Instantiated → Injected → Starting → Running →
/// Stopping → Destroyed`, with `Failed` branching off `Starting`. A failed
/// start always drains through `Stopping → Destroyed` so a half-initialized
/// instance is never reachable from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Discovered,
    Resolved,
    Instantiated,
    Injected,
    Starting,
    Running,
    Failed,
    Stopping,
    Destroyed,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Discovered, Resolved)
                | (Resolved, Instantiated)
                | (Instantiated, Injected)
                | (Injected, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Failed, Stopping)
                | (Stopping, Destroyed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Destroyed)
    }
}

// =============================================================================
// Module contract
// =============================================================================

/// A module's entry point.
///
/// Modules keep their own state behind interior mutability; `start` may block
/// for as long as it likes — the supervisor bounds it externally.
#[async_trait::async_trait]
pub trait Module: Send + Sync {
    /// Start the module. Invoked only after every declared dependency is
    /// `Running`, under the supervisor's deadline.
    async fn start(&self, context: Arc<crate::kernel::framework::ModuleContext>) -> Result<()>;

    /// Stop the module and release its resources. Errors are logged by the
    /// caller, never rethrown.
    async fn stop(&self) -> Result<()>;

    /// Component blueprints owned by this module, wired by the injector
    /// before `start` runs. Defaults to none.
    fn blueprints(
        &self,
        _context: &Arc<crate::kernel::framework::ModuleContext>,
    ) -> Vec<crate::kernel::injector::Blueprint> {
        Vec::new()
    }
}

/// Entry-point factory published in a scope's symbol table.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_properties() -> Properties {
        Properties::parse(
            "module.name=widgets\n\
             module.impl=acme.widgets.entry\n\
             dependency=database-provider, embedded-httpd\n\
             context.path=/widgets\n\
             module.version=2.1.0\n\
             module.memo=widget catalog\n\
             require.httpd=true\n\
             api.packages=acme.widgets.api, acme.widgets.model\n",
        )
    }

    #[test]
    fn test_descriptor_from_properties() {
        let descriptor = ModuleDescriptor::from_properties(&sample_properties(), false).unwrap();
        assert_eq!(descriptor.name, "widgets");
        assert_eq!(descriptor.entry, "acme.widgets.entry");
        assert_eq!(
            descriptor.dependencies,
            vec!["database-provider".to_string(), "embedded-httpd".to_string()]
        );
        assert_eq!(descriptor.context_path.as_deref(), Some("/widgets"));
        assert_eq!(descriptor.version.as_deref(), Some("2.1.0"));
        assert!(descriptor.require_httpd);
        assert!(!descriptor.internal);
        assert_eq!(descriptor.api_packages.len(), 2);
    }

    #[test]
    fn test_descriptor_requires_name() {
        let props = Properties::parse("module.impl=acme.Entry");
        assert!(ModuleDescriptor::from_properties(&props, false).is_none());
    }

    #[test]
    fn test_split_names_mixed_separators() {
        assert_eq!(
            split_names("a b,c,  d\te"),
            vec!["a", "b", "c", "d", "e"]
        );
        assert!(split_names("  ").is_empty());
    }

    #[test]
    fn test_state_transitions() {
        use LifecycleState::*;
        assert!(Discovered.can_transition_to(Resolved));
        assert!(Injected.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Destroyed));

        assert!(!Discovered.can_transition_to(Running));
        assert!(!Running.can_transition_to(Destroyed));
        assert!(!Failed.can_transition_to(Running));
        assert!(Destroyed.is_terminal());
        assert!(!Failed.is_terminal());
    }
}
