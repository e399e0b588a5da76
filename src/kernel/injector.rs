//! Blueprint-driven dependency injection.
//!
//! Components declare their wiring explicitly in a `Blueprint`: capability
//! provisions, dependency requirements (by name or by capability type),
//! configuration bindings, value producers, and lifecycle hooks. The injector
//! validates a module's blueprints, constructs and registers every component,
//! wires dependencies from the registry, and runs post-construct hooks —
//! in that order, batch-wide, so hooks always observe a fully wired graph.
//!
//! Components keep injected dependencies behind interior mutability (a cell
//! or lock); the wiring closures receive a shared handle and assign into it.

use std::any::Any;
use std::sync::Arc;
use tracing::{debug, error};

use crate::kernel::registry::{ServiceRegistration, ServiceRegistry};
use crate::properties::Properties;
use crate::types::{Error, Result};

type AnyArc = Arc<dyn Any + Send + Sync>;
type WireStep = Box<dyn Fn(&AnyArc, &WireContext<'_>) -> Result<()> + Send + Sync>;
type ProduceStep = Box<dyn Fn(&AnyArc, &ServiceRegistry, &str) -> Result<()> + Send + Sync>;
type HookStep = Arc<dyn Fn(&AnyArc) -> Result<()> + Send + Sync>;
type ConstructStep = Box<dyn Fn() -> (AnyArc, ServiceRegistration) + Send + Sync>;

/// Resolution context handed to wiring closures.
pub struct WireContext<'a> {
    pub registry: &'a ServiceRegistry,
    pub config: &'a Properties,
}

/// Explicit wiring declaration for one component.
pub struct Blueprint {
    name: String,
    construct: ConstructStep,
    wires: Vec<WireStep>,
    producers: Vec<ProduceStep>,
    post_construct: Option<HookStep>,
    pre_destroy: Option<HookStep>,
    hook_conflicts: Vec<String>,
}

impl Blueprint {
    /// Start a blueprint for a component built by `factory`, registered
    /// under `name`.
    pub fn component<C, F>(name: impl Into<String>, factory: F) -> BlueprintBuilder<C>
    where
        C: Send + Sync + 'static,
        F: Fn() -> Arc<C> + Send + Sync + 'static,
    {
        BlueprintBuilder {
            name: name.into(),
            factory: Box::new(factory),
            provides: Vec::new(),
            wires: Vec::new(),
            producers: Vec::new(),
            post_construct: None,
            pre_destroy: None,
            hook_conflicts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

type ProvideStep<C> = Box<dyn Fn(ServiceRegistration, &Arc<C>) -> ServiceRegistration + Send + Sync>;

pub struct BlueprintBuilder<C: Send + Sync + 'static> {
    name: String,
    factory: Box<dyn Fn() -> Arc<C> + Send + Sync>,
    provides: Vec<ProvideStep<C>>,
    wires: Vec<WireStep>,
    producers: Vec<ProduceStep>,
    post_construct: Option<HookStep>,
    pre_destroy: Option<HookStep>,
    hook_conflicts: Vec<String>,
}

impl<C: Send + Sync + 'static> BlueprintBuilder<C> {
    /// Declare a capability type this component satisfies.
    pub fn provides<T, F>(mut self, cast: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Arc<C>) -> Arc<T> + Send + Sync + 'static,
    {
        self.provides.push(Box::new(move |registration, component| {
            registration.provides::<T>(cast(component))
        }));
        self
    }

    /// Require a dependency resolved by capability type. Covers both
    /// field-shaped and setter-shaped consumers; `assign` stores the handle
    /// into the component.
    pub fn require<T, F>(mut self, assign: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Arc<C>, Arc<T>) + Send + Sync + 'static,
    {
        self.wires.push(Box::new(move |anchor, ctx| {
            let component = downcast::<C>(anchor)?;
            let dependency = ctx.registry.find_by_type::<T>()?;
            assign(&component, dependency);
            Ok(())
        }));
        self
    }

    /// Require a dependency resolved by its registered name.
    pub fn require_named<S, F>(mut self, dependency: impl Into<String>, assign: F) -> Self
    where
        S: Send + Sync + 'static,
        F: Fn(&Arc<C>, Arc<S>) + Send + Sync + 'static,
    {
        let dependency = dependency.into();
        self.wires.push(Box::new(move |anchor, ctx| {
            let component = downcast::<C>(anchor)?;
            let resolved = ctx
                .registry
                .find_named::<S>(&dependency)
                .ok_or_else(|| Error::not_found(dependency.clone()))?;
            assign(&component, resolved);
            Ok(())
        }));
        self
    }

    /// Bind a configuration value. `expression` is either a `${a.b.c}`
    /// dereference or a literal. A missing required value fails the wiring;
    /// a missing optional value skips the assignment.
    pub fn config<V, F>(mut self, expression: impl Into<String>, required: bool, assign: F) -> Self
    where
        V: serde::de::DeserializeOwned + Send + Sync + 'static,
        F: Fn(&Arc<C>, V) + Send + Sync + 'static,
    {
        let expression = expression.into();
        self.wires.push(Box::new(move |anchor, ctx| {
            let component = downcast::<C>(anchor)?;
            match ctx.config.evaluate_as::<V>(&expression)? {
                Some(value) => assign(&component, value),
                None if required => {
                    return Err(Error::configuration_missing(expression.clone()));
                }
                None => {}
            }
            Ok(())
        }));
        self
    }

    /// Declare a producer: its value is captured once at registration time
    /// and published under `name` (or a name derived from the value type).
    /// A `None` production is an error.
    pub fn produce<T, F>(mut self, name: Option<&str>, produce: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Arc<C>) -> Option<Arc<T>> + Send + Sync + 'static,
    {
        let explicit = name.map(str::to_string);
        self.producers.push(Box::new(move |anchor, registry, owner| {
            let component = downcast::<C>(anchor)?;
            let published = explicit
                .clone()
                .unwrap_or_else(|| derived_name(std::any::type_name::<T>()));
            let value = produce(&component).ok_or_else(|| {
                Error::internal(format!("producer for [{published}] yielded nothing"))
            })?;
            registry.register(owner, &published, ServiceRegistration::new(value))
        }));
        self
    }

    /// Post-construct hook. At most one; a second declaration is a conflict
    /// reported at scan time.
    pub fn post_construct<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<C>) -> Result<()> + Send + Sync + 'static,
    {
        if self.post_construct.is_some() {
            self.hook_conflicts
                .push(format!("component [{}] declares multiple post-construct hooks", self.name));
        }
        self.post_construct = Some(wrap_hook(hook));
        self
    }

    /// Pre-destroy hook. At most one, same conflict rule.
    pub fn pre_destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<C>) -> Result<()> + Send + Sync + 'static,
    {
        if self.pre_destroy.is_some() {
            self.hook_conflicts
                .push(format!("component [{}] declares multiple pre-destroy hooks", self.name));
        }
        self.pre_destroy = Some(wrap_hook(hook));
        self
    }

    pub fn build(self) -> Blueprint {
        let factory = self.factory;
        let provides = self.provides;
        let construct: ConstructStep = Box::new(move || {
            let component = factory();
            let mut registration = ServiceRegistration::new(Arc::clone(&component));
            for provide in &provides {
                registration = provide(registration, &component);
            }
            (component as AnyArc, registration)
        });
        Blueprint {
            name: self.name,
            construct,
            wires: self.wires,
            producers: self.producers,
            post_construct: self.post_construct,
            pre_destroy: self.pre_destroy,
            hook_conflicts: self.hook_conflicts,
        }
    }
}

fn wrap_hook<C, F>(hook: F) -> HookStep
where
    C: Send + Sync + 'static,
    F: Fn(&Arc<C>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |anchor: &AnyArc| {
        let component = downcast::<C>(anchor)?;
        hook(&component)
    })
}

fn downcast<C: Send + Sync + 'static>(anchor: &AnyArc) -> Result<Arc<C>> {
    Arc::clone(anchor)
        .downcast::<C>()
        .map_err(|_| Error::internal("component anchor type mismatch"))
}

/// Derive a published name from a type name: last path segment, first
/// letter lower-cased.
fn derived_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let last = base.rsplit("::").next().unwrap_or(base);
    let mut chars = last.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// =============================================================================
// Wired results
// =============================================================================

/// One constructed and wired component.
pub struct WiredComponent {
    name: String,
    anchor: AnyArc,
    pre_destroy: Option<HookStep>,
}

impl WiredComponent {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the pre-destroy hook, best-effort. Errors are logged only.
    pub fn run_pre_destroy(&self) {
        if let Some(hook) = &self.pre_destroy {
            if let Err(err) = hook(&self.anchor) {
                error!(component = %self.name, %err, "pre-destroy hook failed");
            }
        }
    }
}

impl std::fmt::Debug for WiredComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiredComponent")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// All components wired for one module, in blueprint order.
#[derive(Debug, Default)]
pub struct WiredBatch {
    pub components: Vec<WiredComponent>,
}

// =============================================================================
// Injector
// =============================================================================

/// Processes blueprint batches against the shared registry.
pub struct Injector {
    registry: Arc<ServiceRegistry>,
}

impl Injector {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Wire a module's blueprints as one batch.
    ///
    /// Order: validate hooks (conflicts fail here, before anything is
    /// registered), then construct and register every component (producers
    /// publish in this phase too), then inject every component's
    /// requirements, then run post-construct hooks. The registry stays
    /// unresolved for the duration of the scan so partial graphs are never
    /// observed as wired.
    pub fn process_batch(
        &self,
        owner: &str,
        config: &Properties,
        blueprints: Vec<Blueprint>,
    ) -> Result<WiredBatch> {
        for blueprint in &blueprints {
            if let Some(conflict) = blueprint.hook_conflicts.first() {
                return Err(Error::conflict(conflict.clone()));
            }
        }

        self.registry.set_unresolved();
        let outcome = self.wire(owner, config, blueprints);
        self.registry.mark_resolved();
        outcome
    }

    /// Wire a single late blueprint after the batch phase; it is registered
    /// and injected immediately.
    pub fn process_single(
        &self,
        owner: &str,
        config: &Properties,
        blueprint: Blueprint,
    ) -> Result<WiredBatch> {
        if let Some(conflict) = blueprint.hook_conflicts.first() {
            return Err(Error::conflict(conflict.clone()));
        }
        self.wire(owner, config, vec![blueprint])
    }

    fn wire(
        &self,
        owner: &str,
        config: &Properties,
        blueprints: Vec<Blueprint>,
    ) -> Result<WiredBatch> {
        let mut batch = WiredBatch::default();
        let mut hooks: Vec<(usize, HookStep)> = Vec::new();
        let mut wires: Vec<(usize, Vec<WireStep>)> = Vec::new();

        for (index, blueprint) in blueprints.into_iter().enumerate() {
            let (anchor, registration) = (blueprint.construct)();
            self.registry.register(owner, &blueprint.name, registration)?;
            for producer in &blueprint.producers {
                producer(&anchor, &self.registry, owner)?;
            }
            if let Some(hook) = blueprint.post_construct {
                hooks.push((index, hook));
            }
            wires.push((index, blueprint.wires));
            batch.components.push(WiredComponent {
                name: blueprint.name,
                anchor,
                pre_destroy: blueprint.pre_destroy,
            });
            debug!(owner, component = %batch.components[index].name, "registered component");
        }

        let ctx = WireContext {
            registry: self.registry.as_ref(),
            config,
        };
        for (index, steps) in &wires {
            for step in steps {
                step(&batch.components[*index].anchor, &ctx)?;
            }
        }

        for (index, hook) in &hooks {
            hook(&batch.components[*index].anchor)?;
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::OnceLock;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    #[derive(Default)]
    struct EnglishGreeter;
    impl Greeter for EnglishGreeter {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    #[derive(Default)]
    struct Consumer {
        greeter: OnceLock<Arc<dyn Greeter>>,
        hooked_after_wiring: AtomicBool,
    }

    fn injector() -> Injector {
        Injector::new(Arc::new(ServiceRegistry::new()))
    }

    #[test]
    fn test_batch_wires_before_hooks() {
        let injector = injector();
        let blueprints = vec![
            // Consumer listed first: its hook still sees the greeter wired.
            Blueprint::component("consumer", || Arc::new(Consumer::default()))
                .require::<dyn Greeter, _>(|c, g| {
                    let _ = c.greeter.set(g);
                })
                .post_construct(|c| {
                    c.hooked_after_wiring
                        .store(c.greeter.get().is_some(), Ordering::SeqCst);
                    Ok(())
                })
                .build(),
            Blueprint::component("greeter", || Arc::new(EnglishGreeter))
                .provides::<dyn Greeter, _>(|g| Arc::clone(g) as Arc<dyn Greeter>)
                .build(),
        ];

        let batch = injector
            .process_batch("m1", &Properties::new(), blueprints)
            .unwrap();
        assert_eq!(batch.components.len(), 2);
        let consumer = injector.registry.find_named::<Consumer>("consumer").unwrap();
        assert!(consumer.hooked_after_wiring.load(Ordering::SeqCst));
        assert_eq!(consumer.greeter.get().unwrap().greet(), "hello");
    }

    #[test]
    fn test_late_blueprint_wired_immediately() {
        let injector = injector();
        let batch = vec![Blueprint::component("greeter", || Arc::new(EnglishGreeter))
            .provides::<dyn Greeter, _>(|g| Arc::clone(g) as Arc<dyn Greeter>)
            .build()];
        injector
            .process_batch("m1", &Properties::new(), batch)
            .unwrap();
        assert!(injector.registry.is_resolved());

        // A single blueprint arriving after the batch wires on the spot, no
        // second batch pass.
        let late = Blueprint::component("lateConsumer", || Arc::new(Consumer::default()))
            .require::<dyn Greeter, _>(|c, g| {
                let _ = c.greeter.set(g);
            })
            .post_construct(|c| {
                c.hooked_after_wiring
                    .store(c.greeter.get().is_some(), Ordering::SeqCst);
                Ok(())
            })
            .build();
        let wired = injector
            .process_single("m1", &Properties::new(), late)
            .unwrap();
        assert_eq!(wired.components.len(), 1);
        assert!(injector.registry.is_resolved());

        let consumer = injector
            .registry
            .find_named::<Consumer>("lateConsumer")
            .unwrap();
        assert!(consumer.hooked_after_wiring.load(Ordering::SeqCst));
        assert_eq!(consumer.greeter.get().unwrap().greet(), "hello");
    }

    #[test]
    fn test_hook_conflict_detected_before_registration() {
        let injector = injector();
        let blueprint = Blueprint::component("dup", || Arc::new(EnglishGreeter))
            .post_construct(|_| Ok(()))
            .post_construct(|_| Ok(()))
            .build();

        let err = injector
            .process_batch("m1", &Properties::new(), vec![blueprint])
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(injector.registry.find_by_name("dup").is_none());
    }

    #[test]
    fn test_missing_named_dependency() {
        let injector = injector();
        let blueprint = Blueprint::component("consumer", || Arc::new(Consumer::default()))
            .require_named::<EnglishGreeter, _>("absent", |c, g| {
                let _ = c.greeter.set(g as Arc<dyn Greeter>);
            })
            .build();

        let err = injector
            .process_batch("m1", &Properties::new(), vec![blueprint])
            .unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound(_)));
    }

    #[test]
    fn test_config_required_and_optional() {
        struct Tunable {
            threads: AtomicU32,
        }
        let injector = injector();
        let config = Properties::parse("pool.threads=12");

        let blueprint = Blueprint::component("tunable", || {
            Arc::new(Tunable {
                threads: AtomicU32::new(0),
            })
        })
        .config::<u32, _>("${pool.threads}", true, |t, v| {
            t.threads.store(v, Ordering::SeqCst);
        })
        .config::<u32, _>("${pool.absent}", false, |t, v| {
            t.threads.store(v, Ordering::SeqCst);
        })
        .build();

        injector.process_batch("m1", &config, vec![blueprint]).unwrap();
        let tunable = injector
            .registry
            .find_named::<Tunable>("tunable")
            .unwrap();
        assert_eq!(tunable.threads.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_config_required_missing() {
        struct Tunable;
        let injector = injector();
        let blueprint = Blueprint::component("tunable", || Arc::new(Tunable))
            .config::<u32, _>("${pool.absent}", true, |_, _| {})
            .build();

        let err = injector
            .process_batch("m1", &Properties::new(), vec![blueprint])
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationMissing(_)));
    }

    #[test]
    fn test_producer_publishes_derived_name() {
        struct WidgetStore;
        let injector = injector();
        let blueprint = Blueprint::component("factory", || Arc::new(EnglishGreeter))
            .produce::<WidgetStore, _>(None, |_| Some(Arc::new(WidgetStore)))
            .build();

        injector
            .process_batch("m1", &Properties::new(), vec![blueprint])
            .unwrap();
        assert!(injector.registry.find_by_name("widgetStore").is_some());
    }

    #[test]
    fn test_producer_yielding_nothing_is_error() {
        struct WidgetStore;
        let injector = injector();
        let blueprint = Blueprint::component("factory", || Arc::new(EnglishGreeter))
            .produce::<WidgetStore, _>(Some("store"), |_| None::<Arc<WidgetStore>>)
            .build();

        assert!(injector
            .process_batch("m1", &Properties::new(), vec![blueprint])
            .is_err());
    }

    #[test]
    fn test_derived_name() {
        assert_eq!(derived_name("acme::widgets::WidgetStore"), "widgetStore");
        assert_eq!(derived_name("Plain"), "plain");
    }

    #[test]
    fn test_pre_destroy_runs_best_effort() {
        static DESTROYED: AtomicBool = AtomicBool::new(false);
        let injector = injector();
        let blueprint = Blueprint::component("g", || Arc::new(EnglishGreeter))
            .pre_destroy(|_| {
                DESTROYED.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build();

        let batch = injector
            .process_batch("m1", &Properties::new(), vec![blueprint])
            .unwrap();
        for component in &batch.components {
            component.run_pre_destroy();
        }
        assert!(DESTROYED.load(Ordering::SeqCst));
    }
}
