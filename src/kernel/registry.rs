//! Service registry.
//!
//! Modules publish capabilities here under unique names and under explicit
//! capability types; other modules (and the host) look them up by either
//! index. Every registration is tagged with its owning module so all of a
//! module's contributions can be reversed in one sweep at destroy time.
//!
//! Capability types are declared explicitly per registration (a `provides`
//! list) instead of being discovered by runtime introspection. A registration
//! carries one identity anchor plus one erased handle per declared capability;
//! identity comparisons go through the anchor, so the same service registered
//! under several capabilities still deduplicates correctly.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::types::{Error, Result};

/// Namespace prefixes excluded from capability indexing by default.
///
/// Standard container and IO abstractions are too generic to act as lookup
/// keys. Synchronization types are deliberately not excluded.
pub const DEFAULT_EXCLUSIONS: &[&str] = &["std::collections", "std::io", "alloc::"];

const NEVER_EXCLUDED: &[&str] = &["std::sync", "core::sync", "tokio::sync"];

/// Capability lookup key: a `TypeId` plus its human-readable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl ServiceKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// A published service: identity anchor plus one erased capability handle.
///
/// The erased handle's concrete type is `Arc<T>` for the capability type `T`
/// it was declared under; `downcast` recovers it.
#[derive(Clone)]
pub struct ServiceHandle {
    anchor: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn Any + Send + Sync>,
}

impl ServiceHandle {
    /// Recover the typed capability handle.
    pub fn downcast<T: ?Sized + 'static>(&self) -> Option<Arc<T>> {
        self.erased.downcast_ref::<Arc<T>>().cloned()
    }

    /// Identity anchor, for ownership bookkeeping and deduplication.
    pub fn anchor(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.anchor
    }

    fn is(&self, anchor: &Arc<dyn Any + Send + Sync>) -> bool {
        Arc::ptr_eq(&self.anchor, anchor)
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle").finish_non_exhaustive()
    }
}

/// A registration under construction: one service and its declared
/// capability types.
#[derive(Clone)]
pub struct ServiceRegistration {
    anchor: Arc<dyn Any + Send + Sync>,
    self_erased: Arc<dyn Any + Send + Sync>,
    bindings: Vec<(ServiceKey, Arc<dyn Any + Send + Sync>)>,
}

impl ServiceRegistration {
    pub fn new<S: Send + Sync + 'static>(service: Arc<S>) -> Self {
        Self {
            anchor: Arc::clone(&service) as Arc<dyn Any + Send + Sync>,
            self_erased: Arc::new(service),
            bindings: Vec::new(),
        }
    }

    /// Declare a capability type this service satisfies. Call with the
    /// trait-object handle: `.provides::<dyn Clock>(service.clone())`.
    pub fn provides<T: ?Sized + Send + Sync + 'static>(mut self, handle: Arc<T>) -> Self {
        self.bindings
            .push((ServiceKey::of::<T>(), Arc::new(handle)));
        self
    }

    fn handle_for(&self, erased: &Arc<dyn Any + Send + Sync>) -> ServiceHandle {
        ServiceHandle {
            anchor: Arc::clone(&self.anchor),
            erased: Arc::clone(erased),
        }
    }

    /// A handle whose capability is the service's own concrete type.
    fn self_handle(&self) -> ServiceHandle {
        self.handle_for(&self.self_erased)
    }
}

/// Capability index entry.
#[derive(Clone)]
enum TypeBinding {
    Single(ServiceHandle),
    Multiple(Vec<ServiceHandle>),
}

impl TypeBinding {
    fn push(&mut self, handle: ServiceHandle) {
        match self {
            TypeBinding::Single(existing) => {
                if !existing.is(&handle.anchor) {
                    let first = existing.clone();
                    *self = TypeBinding::Multiple(vec![first, handle]);
                }
            }
            TypeBinding::Multiple(handles) => {
                if !handles.iter().any(|h| h.is(&handle.anchor)) {
                    handles.push(handle);
                }
            }
        }
    }

    /// Remove the entry anchored at `anchor`; reports whether the binding
    /// is now empty and should be dropped.
    fn remove(&mut self, anchor: &Arc<dyn Any + Send + Sync>) -> bool {
        match self {
            TypeBinding::Single(existing) => existing.is(anchor),
            TypeBinding::Multiple(handles) => {
                handles.retain(|h| !h.is(anchor));
                handles.is_empty()
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            TypeBinding::Single(_) => 1,
            TypeBinding::Multiple(handles) => handles.len(),
        }
    }

    fn sole(&self) -> Option<&ServiceHandle> {
        match self {
            TypeBinding::Single(handle) => Some(handle),
            TypeBinding::Multiple(handles) if handles.len() == 1 => Some(&handles[0]),
            TypeBinding::Multiple(_) => None,
        }
    }
}

#[derive(Default)]
struct ContributionRecord {
    names: Vec<String>,
    types: Vec<(ServiceKey, Arc<dyn Any + Send + Sync>)>,
}

#[derive(Default)]
struct RegistryState {
    names: BTreeMap<String, ServiceHandle>,
    types: HashMap<ServiceKey, TypeBinding>,
    contributions: BTreeMap<String, ContributionRecord>,
    resolved: bool,
}

/// Name- and capability-indexed service store.
///
/// All mutation is serialized behind one writer lock; lookups share read
/// access and never observe a half-applied registration.
pub struct ServiceRegistry {
    state: RwLock<RegistryState>,
    exclusions: Vec<String>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_exclusions(DEFAULT_EXCLUSIONS.iter().map(|p| (*p).to_string()))
    }

    pub fn with_exclusions(exclusions: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            exclusions: exclusions.into_iter().collect(),
        }
    }

    fn excluded(&self, key: &ServiceKey) -> bool {
        if NEVER_EXCLUDED.iter().any(|p| key.type_name.starts_with(p)) {
            return false;
        }
        self.exclusions.iter().any(|p| key.type_name.starts_with(p))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register under a unique name and under every declared capability type.
    pub fn register(
        &self,
        owner: &str,
        name: &str,
        registration: ServiceRegistration,
    ) -> Result<()> {
        let mut state = self.write();
        if state.names.contains_key(name) {
            return Err(Error::duplicate_name(name));
        }
        state.names.insert(name.to_string(), registration.self_handle());
        state
            .contributions
            .entry(owner.to_string())
            .or_default()
            .names
            .push(name.to_string());

        self.bind_types(&mut state, owner, &registration);
        debug!(owner, name, "registered service");
        Ok(())
    }

    /// Register under capability types only (no name binding).
    pub fn register_by_type(&self, owner: &str, registration: ServiceRegistration) {
        let mut state = self.write();
        self.bind_types(&mut state, owner, &registration);
    }

    fn bind_types(&self, state: &mut RegistryState, owner: &str, registration: &ServiceRegistration) {
        for (key, erased) in &registration.bindings {
            if self.excluded(key) {
                continue;
            }
            let handle = registration.handle_for(erased);
            state
                .types
                .entry(*key)
                .and_modify(|binding| binding.push(handle.clone()))
                .or_insert_with(|| TypeBinding::Single(handle));
            state
                .contributions
                .entry(owner.to_string())
                .or_default()
                .types
                .push((*key, Arc::clone(&registration.anchor)));
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn find_by_name(&self, name: &str) -> Option<ServiceHandle> {
        self.read().names.get(name).cloned()
    }

    /// Typed name lookup; the name must have been registered with a service
    /// of concrete type `S`.
    pub fn find_named<S: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<S>> {
        self.find_by_name(name).and_then(|h| h.downcast::<S>())
    }

    /// Capability lookup. Exactly one registrant is required: zero is
    /// `InstanceNotFound`, more than one is `AmbiguousService` (use a name
    /// lookup instead).
    pub fn find_by_type<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = ServiceKey::of::<T>();
        let state = self.read();
        let Some(binding) = state.types.get(&key) else {
            return Err(Error::not_found(key.type_name));
        };
        let Some(handle) = binding.sole() else {
            return Err(Error::ambiguous(format!(
                "{} has {} registrants",
                key.type_name,
                binding.len()
            )));
        };
        handle
            .downcast::<T>()
            .ok_or_else(|| Error::internal(format!("stale binding for {}", key.type_name)))
    }

    /// All registrants under a capability type.
    pub fn find_all<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        let key = ServiceKey::of::<T>();
        let state = self.read();
        match state.types.get(&key) {
            None => Vec::new(),
            Some(TypeBinding::Single(handle)) => handle.downcast::<T>().into_iter().collect(),
            Some(TypeBinding::Multiple(handles)) => {
                handles.iter().filter_map(|h| h.downcast::<T>()).collect()
            }
        }
    }

    /// Registered names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        self.read().names.keys().cloned().collect()
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove one registrant from a capability type; the type entry itself
    /// is dropped when its last registrant goes.
    pub fn unregister<T: ?Sized + Send + Sync + 'static>(
        &self,
        anchor: &Arc<dyn Any + Send + Sync>,
    ) {
        let key = ServiceKey::of::<T>();
        let mut state = self.write();
        remove_binding(&mut state, key, anchor);
    }

    /// Reverse every contribution the owner made, names and types alike.
    /// Runs on normal stop and on startup failure.
    pub fn clean(&self, owner: &str) {
        let mut state = self.write();
        let Some(record) = state.contributions.remove(owner) else {
            return;
        };
        for name in &record.names {
            state.names.remove(name);
        }
        for (key, anchor) in &record.types {
            remove_binding(&mut state, *key, anchor);
        }
        debug!(
            owner,
            names = record.names.len(),
            types = record.types.len(),
            "cleaned registry contributions"
        );
    }

    // =========================================================================
    // Two-phase injection interaction
    // =========================================================================

    /// While a blueprint batch is being wired the registry reports
    /// unresolved; once resolved, a late registration is wired immediately
    /// by its caller instead of waiting for another batch pass.
    pub fn is_resolved(&self) -> bool {
        self.read().resolved
    }

    pub fn set_unresolved(&self) {
        self.write().resolved = false;
    }

    pub fn mark_resolved(&self) {
        self.write().resolved = true;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn remove_binding(state: &mut RegistryState, key: ServiceKey, anchor: &Arc<dyn Any + Send + Sync>) {
    if let Some(binding) = state.types.get_mut(&key) {
        if binding.remove(anchor) {
            state.types.remove(&key);
        }
    } else {
        warn!(capability = key.type_name, "unregister for unbound capability");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Clock: Send + Sync + std::fmt::Debug {
        fn now(&self) -> u64;
    }

    #[derive(Debug)]
    struct FixedClock(u64);
    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    fn clock_registration(service: &Arc<FixedClock>) -> ServiceRegistration {
        ServiceRegistration::new(Arc::clone(service))
            .provides::<dyn Clock>(Arc::clone(service) as Arc<dyn Clock>)
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = ServiceRegistry::new();
        let a = Arc::new(FixedClock(1));
        let b = Arc::new(FixedClock(2));
        registry
            .register("m1", "clock", clock_registration(&a))
            .unwrap();
        let err = registry
            .register("m2", "clock", clock_registration(&b))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
    }

    #[test]
    fn test_find_by_type_single() {
        let registry = ServiceRegistry::new();
        let clock = Arc::new(FixedClock(42));
        registry
            .register("m1", "clock", clock_registration(&clock))
            .unwrap();
        let found = registry.find_by_type::<dyn Clock>().unwrap();
        assert_eq!(found.now(), 42);
    }

    #[test]
    fn test_ambiguous_until_one_removed() {
        let registry = ServiceRegistry::new();
        let a = Arc::new(FixedClock(1));
        let b = Arc::new(FixedClock(2));
        registry.register_by_type("m1", clock_registration(&a));
        registry.register_by_type("m2", clock_registration(&b));

        let err = registry.find_by_type::<dyn Clock>().unwrap_err();
        assert!(matches!(err, Error::AmbiguousService(_)));

        let anchor: Arc<dyn std::any::Any + Send + Sync> = a;
        registry.unregister::<dyn Clock>(&anchor);
        assert_eq!(registry.find_by_type::<dyn Clock>().unwrap().now(), 2);
    }

    #[test]
    fn test_same_service_not_double_bound() {
        let registry = ServiceRegistry::new();
        let clock = Arc::new(FixedClock(7));
        registry.register_by_type("m1", clock_registration(&clock));
        registry.register_by_type("m1", clock_registration(&clock));
        // Identity dedup keeps the binding unambiguous.
        assert_eq!(registry.find_by_type::<dyn Clock>().unwrap().now(), 7);
        assert_eq!(registry.find_all::<dyn Clock>().len(), 1);
    }

    #[test]
    fn test_clean_removes_all_contributions() {
        let registry = ServiceRegistry::new();
        let a = Arc::new(FixedClock(1));
        let b = Arc::new(FixedClock(2));
        registry
            .register("widgets", "clock-a", clock_registration(&a))
            .unwrap();
        registry
            .register("widgets", "clock-b", clock_registration(&b))
            .unwrap();

        registry.clean("widgets");
        assert!(registry.find_by_name("clock-a").is_none());
        assert!(registry.find_by_name("clock-b").is_none());
        assert!(matches!(
            registry.find_by_type::<dyn Clock>(),
            Err(Error::InstanceNotFound(_))
        ));
        assert!(registry.find_all::<dyn Clock>().is_empty());
    }

    #[test]
    fn test_clean_leaves_other_owners() {
        let registry = ServiceRegistry::new();
        let a = Arc::new(FixedClock(1));
        let b = Arc::new(FixedClock(2));
        registry.register_by_type("m1", clock_registration(&a));
        registry.register_by_type("m2", clock_registration(&b));

        registry.clean("m1");
        assert_eq!(registry.find_by_type::<dyn Clock>().unwrap().now(), 2);
    }

    #[test]
    fn test_exclusion_prefixes() {
        let registry = ServiceRegistry::new();
        let store: Arc<std::collections::BTreeMap<String, String>> = Arc::new(
            [("k".to_string(), "v".to_string())].into_iter().collect(),
        );
        let registration = ServiceRegistration::new(Arc::clone(&store))
            .provides::<std::collections::BTreeMap<String, String>>(Arc::clone(&store));
        registry.register_by_type("m1", registration);
        // Standard container types never become capability keys.
        assert!(registry
            .find_all::<std::collections::BTreeMap<String, String>>()
            .is_empty());
    }

    #[test]
    fn test_sync_types_not_excluded() {
        let registry = ServiceRegistry::new();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let registration = ServiceRegistration::new(Arc::clone(&flag))
            .provides::<std::sync::atomic::AtomicBool>(Arc::clone(&flag));
        registry.register_by_type("m1", registration);
        assert!(registry
            .find_by_type::<std::sync::atomic::AtomicBool>()
            .unwrap()
            .load(std::sync::atomic::Ordering::Relaxed));
    }

    #[test]
    fn test_resolved_flag_tracks_scan_window() {
        let registry = ServiceRegistry::new();
        assert!(!registry.is_resolved());
        registry.mark_resolved();
        assert!(registry.is_resolved());
        registry.set_unresolved();
        assert!(!registry.is_resolved());
        registry.mark_resolved();
        assert!(registry.is_resolved());
    }
}
