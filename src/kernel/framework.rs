//! Framework orchestrator.
//!
//! Composes the kernel subsystems: registers built-ins, discovers deployed
//! modules, resolves and orders their dependencies, drives each start under
//! the supervisor, wires collaborator services (httpd, database, mqtt), and
//! owns the remote shutdown trigger. One module's startup failure is logged
//! and unwound; the boot continues with the next module in order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, LifecycleEvent};
use crate::kernel::deployer::{read_embedded_descriptor, Deployer};
use crate::kernel::descriptor::{LifecycleState, Module, ModuleDescriptor, ModuleFactory};
use crate::kernel::injector::{Blueprint, Injector, WiredBatch};
use crate::kernel::registry::{ServiceRegistration, ServiceRegistry};
use crate::kernel::resolver::{self, Universe};
use crate::kernel::scope::{self, ModuleScope, ScopeSet, SharedScope};
use crate::kernel::supervisor::{Supervised, Supervisor};
use crate::properties::Properties;
use crate::services::{
    DatabaseService, HttpIntegration, MqttEndpoint, MqttService, SystemProperties, SystemService,
};
use crate::types::{Error, FrameworkConfig, Result, PORT_FILE_NAME};

/// Exact datagram that triggers an orderly shutdown.
pub const SHUTDOWN_PAYLOAD: &[u8; 8] = b"GoodBye!";

/// Pseudo-owner for registrations made by the framework itself.
pub const FRAMEWORK_OWNER: &str = "framework";

// =============================================================================
// Module context
// =============================================================================

/// Everything one running module owns: descriptor, isolation scope, entry
/// point, configuration, and the bookkeeping needed to reverse its effects.
pub struct ModuleContext {
    descriptor: ModuleDescriptor,
    module: Arc<dyn Module>,
    registry: Arc<ServiceRegistry>,
    scope: Option<Arc<ModuleScope>>,
    config: RwLock<Properties>,
    workdir: Option<PathBuf>,
    state: RwLock<LifecycleState>,
    wired: Mutex<WiredBatch>,
    database_names: Mutex<Vec<String>>,
    mqtt_names: Mutex<Vec<String>>,
}

impl ModuleContext {
    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Snapshot of the module's current configuration.
    pub fn config(&self) -> Properties {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn scope(&self) -> Option<&Arc<ModuleScope>> {
        self.scope.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve a module resource through the scope tiers.
    pub fn read_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match &self.scope {
            Some(scope) => scope.read_resource(name),
            None => Ok(None),
        }
    }

    fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition_to(next) {
            return Err(Error::internal(format!(
                "module [{}]: invalid transition {:?} -> {:?}",
                self.descriptor.name, *state, next
            )));
        }
        debug!(module = %self.descriptor.name, from = ?*state, to = ?next, "lifecycle transition");
        *state = next;
        Ok(())
    }
}

/// Snapshot returned by `module_info`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModuleInfo {
    pub descriptor: ModuleDescriptor,
    pub state: LifecycleState,
}

struct StartTask {
    module: Arc<dyn Module>,
    context: Arc<ModuleContext>,
}

#[async_trait::async_trait]
impl Supervised for StartTask {
    async fn start(&self) -> Result<()> {
        self.module.start(Arc::clone(&self.context)).await
    }

    async fn stop(&self) -> Result<()> {
        self.module.stop().await
    }
}

// =============================================================================
// Framework
// =============================================================================

pub struct Framework {
    config: FrameworkConfig,
    registry: Arc<ServiceRegistry>,
    injector: Injector,
    supervisor: Supervisor,
    deployer: Deployer,
    scopes: ScopeSet,
    events: Arc<EventBus>,
    contexts: RwLock<BTreeMap<String, Arc<ModuleContext>>>,
    built_ins: RwLock<BTreeMap<String, ModuleDescriptor>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Framework {
    pub fn new(config: FrameworkConfig) -> Result<Self> {
        let shared = Arc::new(SharedScope::load(&config.dirs.ext_services_dir)?);
        let registry = Arc::new(ServiceRegistry::new());
        let target = config
            .dirs
            .modules_dirs
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("../modules"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            injector: Injector::new(Arc::clone(&registry)),
            supervisor: Supervisor::new(config.startup.timeout),
            deployer: Deployer::new(target, config.dirs.tmp_dir.clone()),
            scopes: ScopeSet::new(shared),
            events: Arc::new(EventBus::new()),
            contexts: RwLock::new(BTreeMap::new()),
            built_ins: RwLock::new(BTreeMap::new()),
            listener: Mutex::new(None),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            registry,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register a built-in module. Its factory lands in the host symbol
    /// table; it starts only when listed in `built_in_modules`.
    pub fn register_built_in(&self, descriptor: ModuleDescriptor, factory: ModuleFactory) {
        self.scopes.export_host(descriptor.entry.clone(), factory);
        self.write_built_ins()
            .insert(descriptor.name.clone(), descriptor);
    }

    /// Register an entry-point factory for a deployed module's descriptor.
    pub fn register_factory(&self, symbol: impl Into<String>, factory: ModuleFactory) {
        self.scopes.export_host(symbol, factory);
    }

    // =========================================================================
    // Boot and shutdown
    // =========================================================================

    /// Boot the framework: prepare directories, publish framework services,
    /// start built-ins and discovered modules in dependency order, then bind
    /// the shutdown listener. Returns the listener's UDP port.
    pub async fn startup(&self) -> Result<u16> {
        self.prepare_dirs()?;
        self.register_framework_services()?;
        self.start_built_ins().await;
        self.start_discovered().await?;
        self.registry.mark_resolved();
        let port = self.bind_shutdown_listener().await?;
        info!(port, modules = self.read_contexts().len(), "framework started");
        Ok(port)
    }

    /// Block until the shutdown trigger fires (remote datagram or
    /// `trigger_shutdown`).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop every module in heuristic shutdown order and release the
    /// listener and port file. Stop errors never interrupt the sequence.
    pub async fn shutdown(&self) {
        info!("framework shutting down");
        let loaded: Vec<ModuleDescriptor> = self
            .read_contexts()
            .values()
            .map(|c| c.descriptor.clone())
            .collect();
        for name in resolver::shutdown_order(&loaded) {
            if let Err(err) = self.stop_module(&name).await {
                warn!(module = %name, %err, "stop during shutdown failed");
            }
        }
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        let port_file = self.config.dirs.tmp_dir.join(PORT_FILE_NAME);
        if let Err(err) = std::fs::remove_file(&port_file) {
            debug!(%err, "port file already gone");
        }
        info!("framework stopped");
    }

    async fn bind_shutdown_listener(&self) -> Result<u16> {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        let port = socket.local_addr()?.port();
        std::fs::write(
            self.config.dirs.tmp_dir.join(PORT_FILE_NAME),
            port.to_string(),
        )?;

        let tx = Arc::clone(&self.shutdown_tx);
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        if len == SHUTDOWN_PAYLOAD.len()
                            && &buf[..len] == SHUTDOWN_PAYLOAD
                            && addr.ip().is_loopback()
                        {
                            info!(%addr, "shutdown trigger received");
                            let _ = tx.send(true);
                            break;
                        }
                        warn!(%addr, len, "ignoring unexpected datagram on shutdown port");
                    }
                    Err(err) => {
                        warn!(%err, "shutdown listener receive failed");
                        break;
                    }
                }
            }
        });
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        debug!(port, "shutdown listener bound");
        Ok(port)
    }

    fn prepare_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.dirs.tmp_dir)?;
        std::fs::create_dir_all(&self.config.dirs.ext_conf_dir)?;
        std::fs::create_dir_all(&self.config.dirs.ext_services_dir)?;
        for dir in &self.config.dirs.modules_dirs {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn register_framework_services(&self) -> Result<()> {
        let system = Arc::new(SystemProperties::new(self.system_properties()));
        self.registry.register(
            FRAMEWORK_OWNER,
            "systemService",
            ServiceRegistration::new(Arc::clone(&system))
                .provides::<dyn SystemService>(system),
        )?;
        self.registry.register(
            FRAMEWORK_OWNER,
            "eventBus",
            ServiceRegistration::new(Arc::clone(&self.events)),
        )?;
        Ok(())
    }

    fn system_properties(&self) -> Properties {
        let mut props = Properties::new();
        let dirs = &self.config.dirs;
        props.set("framework.tmp_dir", dirs.tmp_dir.display().to_string());
        props.set(
            "framework.ext_conf_dir",
            dirs.ext_conf_dir.display().to_string(),
        );
        props.set(
            "framework.ext_services_dir",
            dirs.ext_services_dir.display().to_string(),
        );
        props.set(
            "framework.modules_dirs",
            dirs.modules_dirs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
        props.set(
            "framework.startup_timeout_ms",
            self.supervisor.timeout().as_millis().to_string(),
        );
        props
    }

    async fn start_built_ins(&self) {
        let selected: Vec<ModuleDescriptor> = {
            let built_ins = self.read_built_ins();
            self.config
                .built_in_modules
                .iter()
                .filter_map(|name| {
                    let found = built_ins.get(name).cloned();
                    if found.is_none() {
                        warn!(module = %name, "unknown built-in module, skipping");
                    }
                    found
                })
                .collect()
        };

        let universe: Universe = selected
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        let order = match resolver::order(&universe) {
            Ok(order) => order,
            Err(err) => {
                error!(%err, "built-in ordering failed");
                return;
            }
        };
        for name in order {
            if let Some(descriptor) = universe.get(&name).cloned() {
                if let Err(err) = self.launch(descriptor, None).await {
                    error!(module = %name, %err, "built-in start failed, continuing boot");
                }
            }
        }
    }

    async fn start_discovered(&self) -> Result<()> {
        let discovered = self.discover()?;
        let universe: Universe = discovered
            .values()
            .map(|(d, _)| (d.name.clone(), d.clone()))
            .collect();

        let mut satisfied = self.running_names();
        satisfied.extend(self.read_built_ins().keys().cloned());
        resolver::resolve(&universe, &satisfied)?;

        for name in resolver::order(&universe)? {
            let Some((descriptor, workdir)) = discovered.get(&name).cloned() else {
                continue;
            };
            if let Err(err) = self.launch(descriptor, Some(workdir)).await {
                error!(module = %name, %err, "module start failed, continuing boot");
            }
        }
        Ok(())
    }

    /// Scan the module directories for deployed trees with a parseable
    /// embedded descriptor.
    fn discover(&self) -> Result<BTreeMap<String, (ModuleDescriptor, PathBuf)>> {
        let mut discovered = BTreeMap::new();
        for dir in &self.config.dirs.modules_dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(dir)? {
                let module_dir = entry?.path();
                if !module_dir.is_dir() {
                    continue;
                }
                if let Some(descriptor) = first_descriptor(&module_dir)? {
                    discovered.insert(descriptor.name.clone(), (descriptor, module_dir));
                }
            }
        }
        debug!(count = discovered.len(), "discovered deployed modules");
        Ok(discovered)
    }

    // =========================================================================
    // Per-module start and stop
    // =========================================================================

    pub async fn start_module(&self, name: &str) -> Result<()> {
        if self.read_contexts().contains_key(name) {
            return Err(Error::module_running(name));
        }
        let (descriptor, workdir) = self.lookup_descriptor(name)?;
        self.launch(descriptor, workdir).await
    }

    async fn launch(&self, descriptor: ModuleDescriptor, workdir: Option<PathBuf>) -> Result<()> {
        let name = descriptor.name.clone();
        if self.read_contexts().contains_key(&name) {
            return Err(Error::module_running(&name));
        }
        {
            let contexts = self.read_contexts();
            for dep in &descriptor.dependencies {
                let running = contexts
                    .get(dep)
                    .map(|c| c.state() == LifecycleState::Running)
                    .unwrap_or(false);
                if !running {
                    return Err(Error::missing_dependency(format!(
                        "module [{name}] requires running [{dep}]"
                    )));
                }
            }
        }

        let scope = match &workdir {
            Some(dir) if !descriptor.internal => {
                let scope = Arc::new(ModuleScope::new(
                    &name,
                    dir.clone(),
                    Arc::clone(self.scopes.shared()),
                    vec![self.config.dirs.ext_conf_dir.clone()],
                )?);
                self.scopes.insert(Arc::clone(&scope));
                Some(scope)
            }
            _ => None,
        };

        match self.launch_inner(descriptor, scope.clone(), workdir).await {
            Ok(context) => {
                self.write_contexts()
                    .insert(name.clone(), Arc::clone(&context));
                self.events
                    .publish(LifecycleEvent::Started(context.descriptor.clone()));
                info!(module = %name, "module running");
                Ok(())
            }
            Err(err) => {
                self.registry.clean(&name);
                if let Some(scope) = scope {
                    scope.teardown();
                    self.scopes.remove(&name);
                }
                Err(err)
            }
        }
    }

    async fn launch_inner(
        &self,
        descriptor: ModuleDescriptor,
        scope: Option<Arc<ModuleScope>>,
        workdir: Option<PathBuf>,
    ) -> Result<Arc<ModuleContext>> {
        let name = descriptor.name.clone();
        let factory = self
            .scopes
            .resolve_factory(scope.as_ref().map(|_| name.as_str()), &descriptor.entry)
            .ok_or_else(|| {
                Error::not_found(format!(
                    "no factory for entry [{}] of module [{name}]",
                    descriptor.entry
                ))
            })?;
        let config = self.module_config(&name, scope.as_deref())?;
        let module = factory();

        let context = Arc::new(ModuleContext {
            descriptor,
            module: Arc::clone(&module),
            registry: Arc::clone(&self.registry),
            scope: scope.clone(),
            config: RwLock::new(config),
            workdir,
            state: RwLock::new(LifecycleState::Discovered),
            wired: Mutex::new(WiredBatch::default()),
            database_names: Mutex::new(Vec::new()),
            mqtt_names: Mutex::new(Vec::new()),
        });
        context.transition(LifecycleState::Resolved)?;
        context.transition(LifecycleState::Instantiated)?;
        if let Some(scope) = &scope {
            scope.bind_owner(&context);
        }

        let blueprints = module.blueprints(&context);
        let wired = {
            let config = context.config.read().unwrap_or_else(|e| e.into_inner());
            self.injector.process_batch(&name, &config, blueprints)?
        };
        *context.wired.lock().unwrap_or_else(|e| e.into_inner()) = wired;
        context.transition(LifecycleState::Injected)?;

        if let Some(scope) = &scope {
            self.configure_database(&context, scope);
            self.configure_mqtt(&context, scope);
        }

        context.transition(LifecycleState::Starting)?;
        let task = Arc::new(StartTask {
            module: Arc::clone(&module),
            context: Arc::clone(&context),
        });
        if let Err(err) = self.supervisor.supervise(&name, task).await {
            // The supervisor already drove the module's stop routine.
            context.transition(LifecycleState::Failed)?;
            self.run_pre_destroy(&context);
            self.unregister_external(&context);
            context.transition(LifecycleState::Stopping)?;
            context.transition(LifecycleState::Destroyed)?;
            return Err(err);
        }

        if context.descriptor.require_httpd {
            self.attach_httpd(&context).await;
        }
        context.transition(LifecycleState::Running)?;
        Ok(context)
    }

    pub async fn stop_module(&self, name: &str) -> Result<()> {
        let context = self
            .write_contexts()
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("module [{name}] is not running")))?;

        context.transition(LifecycleState::Stopping)?;
        self.run_pre_destroy(&context);
        if context.descriptor.require_httpd {
            self.detach_httpd(&context).await;
        }
        if let Err(err) = context.module.stop().await {
            warn!(module = %name, %err, "module stop reported an error");
        }
        self.registry.clean(name);
        self.unregister_external(&context);
        if let Some(scope) = &context.scope {
            scope.teardown();
            self.scopes.remove(name);
        }
        context.transition(LifecycleState::Destroyed)?;
        self.events
            .publish(LifecycleEvent::Stopped(name.to_string()));
        info!(module = %name, "module stopped");
        Ok(())
    }

    fn run_pre_destroy(&self, context: &ModuleContext) {
        let wired = context.wired.lock().unwrap_or_else(|e| e.into_inner());
        for component in &wired.components {
            component.run_pre_destroy();
        }
    }

    /// Wire one late component blueprint into a running module. The boot
    /// batch is long done; the component registers, injects, and runs its
    /// post-construct hook immediately, and its pre-destroy hook joins the
    /// module's stop path.
    pub fn add_blueprint(&self, module: &str, blueprint: Blueprint) -> Result<()> {
        let context = self
            .read_contexts()
            .get(module)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("module [{module}] is not running")))?;
        let wired = {
            let config = context.config.read().unwrap_or_else(|e| e.into_inner());
            self.injector.process_single(module, &config, blueprint)?
        };
        context
            .wired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .components
            .extend(wired.components);
        Ok(())
    }

    /// Re-read a running module's configuration through the discovery tiers
    /// and broadcast the change.
    pub fn reload_module_config(&self, name: &str) -> Result<()> {
        let context = self
            .read_contexts()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("module [{name}] is not running")))?;
        let fresh = self.module_config(name, context.scope.as_deref())?;
        *context.config.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        self.events
            .publish(LifecycleEvent::ConfigChanged(context.descriptor.clone()));
        info!(module = %name, "module configuration reloaded");
        Ok(())
    }

    // =========================================================================
    // Collaborator wiring
    // =========================================================================

    async fn attach_httpd(&self, context: &Arc<ModuleContext>) {
        let Ok(httpd) = self.registry.find_by_type::<dyn HttpIntegration>() else {
            warn!(module = %context.name(), "httpd service absent, attach skipped");
            return;
        };
        let workdir = context
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if let Err(err) = httpd.attach(Arc::clone(context), &workdir).await {
            warn!(module = %context.name(), %err, "httpd attach failed");
        }
    }

    async fn detach_httpd(&self, context: &ModuleContext) {
        let Ok(httpd) = self.registry.find_by_type::<dyn HttpIntegration>() else {
            return;
        };
        if let Err(err) = httpd.detach(&context.descriptor).await {
            warn!(module = %context.name(), %err, "httpd detach failed");
        }
    }

    fn configure_database(&self, context: &ModuleContext, scope: &ModuleScope) {
        let source = match self.read_first(scope, &["database.conf", "database.properties"]) {
            Some(props) => props,
            None => return,
        };
        let Ok(service) = self.registry.find_by_type::<dyn DatabaseService>() else {
            debug!(module = %context.name(), "database config present but no database service");
            return;
        };
        let pool = source.get_or("database.name", context.name()).to_string();
        if service.contains(&pool) {
            warn!(module = %context.name(), pool = %pool, "database pool already registered, skipping");
            return;
        }
        match service.register_pool(&pool, &source) {
            Ok(()) => {
                context
                    .database_names
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(pool);
            }
            Err(err) => warn!(module = %context.name(), %err, "database pool registration failed"),
        }
    }

    fn configure_mqtt(&self, context: &ModuleContext, scope: &ModuleScope) {
        let source = match self.read_first(scope, &["mqtt.conf"]) {
            Some(props) => props,
            None => return,
        };
        let Ok(service) = self.registry.find_by_type::<dyn MqttService>() else {
            debug!(module = %context.name(), "mqtt config present but no mqtt service");
            return;
        };
        let brokers: Vec<String> = source
            .keys()
            .filter_map(|key| {
                key.strip_prefix("mqtt.")
                    .and_then(|rest| rest.strip_suffix(".url"))
            })
            .map(str::to_string)
            .collect();
        for broker in brokers {
            if service.contains(&broker) {
                warn!(module = %context.name(), broker = %broker, "mqtt broker already registered, skipping");
                continue;
            }
            let Some(url) = source.get(&format!("mqtt.{broker}.url")) else {
                continue;
            };
            let endpoint = MqttEndpoint {
                url: url.to_string(),
                user: source.get(&format!("mqtt.{broker}.user")).map(str::to_string),
                password: source
                    .get(&format!("mqtt.{broker}.password"))
                    .map(str::to_string),
                client_id: source
                    .get(&format!("mqtt.{broker}.client_id"))
                    .map(str::to_string),
            };
            match service.register_broker(&broker, endpoint) {
                Ok(()) => {
                    context
                        .mqtt_names
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(broker);
                }
                Err(err) => warn!(module = %context.name(), %err, "mqtt broker registration failed"),
            }
        }
    }

    fn unregister_external(&self, context: &ModuleContext) {
        let database_names: Vec<String> = std::mem::take(
            &mut *context
                .database_names
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if !database_names.is_empty() {
            if let Ok(service) = self.registry.find_by_type::<dyn DatabaseService>() {
                for name in database_names {
                    if let Err(err) = service.unregister_pool(&name) {
                        warn!(pool = %name, %err, "database pool unregistration failed");
                    }
                }
            }
        }
        let mqtt_names: Vec<String> = std::mem::take(
            &mut *context.mqtt_names.lock().unwrap_or_else(|e| e.into_inner()),
        );
        if !mqtt_names.is_empty() {
            if let Ok(service) = self.registry.find_by_type::<dyn MqttService>() {
                for name in mqtt_names {
                    if let Err(err) = service.unregister_broker(&name) {
                        warn!(broker = %name, %err, "mqtt broker unregistration failed");
                    }
                }
            }
        }
    }

    fn read_first(&self, scope: &ModuleScope, names: &[&str]) -> Option<Properties> {
        for name in names {
            match scope.read_resource(name) {
                Ok(Some(data)) => {
                    return Some(Properties::parse(&String::from_utf8_lossy(&data)));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(resource = name, %err, "resource read failed");
                }
            }
        }
        None
    }

    fn module_config(&self, name: &str, scope: Option<&ModuleScope>) -> Result<Properties> {
        let external = self.config.dirs.ext_conf_dir.join(format!("{name}.conf"));
        if external.is_file() {
            return Properties::load(&external);
        }
        if let Some(scope) = scope {
            if let Some(data) = scope.read_resource(&format!("{name}.conf"))? {
                return Ok(Properties::parse(&String::from_utf8_lossy(&data)));
            }
        }
        Ok(Properties::new())
    }

    // =========================================================================
    // Deployment
    // =========================================================================

    pub fn deploy(&self, package: &Path) -> Result<String> {
        let running = self.running_names();
        let name = self.deployer.deploy(package, &running)?;
        if let Some(descriptor) = first_descriptor(&self.deployer.module_dir(&name))? {
            self.events.publish(LifecycleEvent::Deployed(descriptor));
        }
        Ok(name)
    }

    pub fn undeploy(&self, name: &str) -> Result<()> {
        let running = self.running_names();
        self.deployer.undeploy(name, &running)?;
        self.events
            .publish(LifecycleEvent::Removed(name.to_string()));
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn module_info(&self, name: &str) -> Option<ModuleInfo> {
        self.read_contexts().get(name).map(|c| ModuleInfo {
            descriptor: c.descriptor.clone(),
            state: c.state(),
        })
    }

    pub fn context_names(&self) -> Vec<String> {
        self.read_contexts().keys().cloned().collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.registry.service_names()
    }

    pub fn database_configs(&self) -> Vec<String> {
        self.registry
            .find_by_type::<dyn DatabaseService>()
            .map(|s| s.pool_names())
            .unwrap_or_default()
    }

    fn running_names(&self) -> BTreeSet<String> {
        self.read_contexts()
            .iter()
            .filter(|(_, c)| c.state() == LifecycleState::Running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn lookup_descriptor(&self, name: &str) -> Result<(ModuleDescriptor, Option<PathBuf>)> {
        if let Some(descriptor) = self.read_built_ins().get(name).cloned() {
            return Ok((descriptor, None));
        }
        for dir in &self.config.dirs.modules_dirs {
            let module_dir = dir.join(name);
            if let Some(descriptor) = first_descriptor(&module_dir)? {
                return Ok((descriptor, Some(module_dir)));
            }
        }
        Err(Error::not_found(format!("no module named [{name}]")))
    }

    fn read_contexts(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<ModuleContext>>> {
        self.contexts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_contexts(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<ModuleContext>>> {
        self.contexts.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_built_ins(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ModuleDescriptor>> {
        self.built_ins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_built_ins(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ModuleDescriptor>> {
        self.built_ins.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// First parseable embedded descriptor in a module tree's `libs` directory.
fn first_descriptor(module_dir: &Path) -> Result<Option<ModuleDescriptor>> {
    for unit in scope::scan_units(&module_dir.join("libs"))? {
        if let Some(descriptor) = read_embedded_descriptor(&unit)? {
            return Ok(Some(descriptor));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DirsConfig, StartupConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingModule {
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl CountingModule {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Module for CountingModule {
        async fn start(&self, _context: Arc<ModuleContext>) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config(base: &Path) -> FrameworkConfig {
        FrameworkConfig {
            dirs: DirsConfig {
                tmp_dir: base.join("tmp"),
                modules_dirs: vec![base.join("modules")],
                ext_conf_dir: base.join("conf.d"),
                ext_services_dir: base.join("extServices"),
            },
            startup: StartupConfig {
                timeout: Duration::from_millis(500),
            },
            built_in_modules: vec!["core".to_string()],
            observability: Default::default(),
        }
    }

    fn core_descriptor() -> ModuleDescriptor {
        ModuleDescriptor::new("core", "core.entry", true)
    }

    #[tokio::test]
    async fn test_boot_and_remote_shutdown() {
        let base = tempfile::tempdir().unwrap();
        let framework = Framework::new(test_config(base.path())).unwrap();
        let mut events = framework.events().subscribe("test");

        let module = CountingModule::new();
        let instance = Arc::clone(&module);
        framework.register_built_in(
            core_descriptor(),
            Arc::new(move || Arc::clone(&instance) as Arc<dyn Module>),
        );

        let port = framework.startup().await.unwrap();
        assert_eq!(module.starts.load(Ordering::SeqCst), 1);
        assert_eq!(framework.context_names(), vec!["core"]);
        let info = framework.module_info("core").unwrap();
        assert_eq!(info.state, LifecycleState::Running);

        let port_file = base.path().join("tmp").join(PORT_FILE_NAME);
        assert_eq!(
            std::fs::read_to_string(&port_file).unwrap(),
            port.to_string()
        );

        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        sender
            .send_to(SHUTDOWN_PAYLOAD, ("127.0.0.1", port))
            .await
            .unwrap();
        framework.wait_for_shutdown().await;
        framework.shutdown().await;

        assert_eq!(module.stops.load(Ordering::SeqCst), 1);
        assert!(framework.context_names().is_empty());
        assert!(!port_file.exists());

        let started = events.recv().await.unwrap();
        assert!(matches!(started.event, LifecycleEvent::Started(_)));
        let stopped = events.recv().await.unwrap();
        assert!(matches!(stopped.event, LifecycleEvent::Stopped(_)));
    }

    #[tokio::test]
    async fn test_start_requires_running_dependencies() {
        let base = tempfile::tempdir().unwrap();
        let framework = Framework::new(test_config(base.path())).unwrap();
        framework.register_built_in(
            ModuleDescriptor::new("leaf", "leaf.entry", true).with_dependencies(&["ghost"]),
            Arc::new(|| CountingModule::new() as Arc<dyn Module>),
        );

        let err = framework.start_module("leaf").await.unwrap_err();
        assert!(matches!(err, Error::MissingDependency(_)));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let base = tempfile::tempdir().unwrap();
        let framework = Framework::new(test_config(base.path())).unwrap();
        framework.register_built_in(
            core_descriptor(),
            Arc::new(|| CountingModule::new() as Arc<dyn Module>),
        );
        framework.prepare_dirs().unwrap();
        framework.start_module("core").await.unwrap();

        let err = framework.start_module("core").await.unwrap_err();
        assert!(matches!(err, Error::ModuleRunning(_)));
    }

    #[tokio::test]
    async fn test_stop_unknown_module() {
        let base = tempfile::tempdir().unwrap();
        let framework = Framework::new(test_config(base.path())).unwrap();
        let err = framework.stop_module("ghost").await.unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_start_unwinds_registry() {
        struct FailingModule;

        #[async_trait::async_trait]
        impl Module for FailingModule {
            async fn start(&self, context: Arc<ModuleContext>) -> Result<()> {
                context.registry().register(
                    context.name(),
                    "doomed",
                    ServiceRegistration::new(Arc::new(42u32)),
                )?;
                Err(Error::internal("refusing to start"))
            }

            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        let base = tempfile::tempdir().unwrap();
        let framework = Framework::new(test_config(base.path())).unwrap();
        framework.register_built_in(
            ModuleDescriptor::new("broken", "broken.entry", true),
            Arc::new(|| Arc::new(FailingModule) as Arc<dyn Module>),
        );
        framework.prepare_dirs().unwrap();

        let err = framework.start_module("broken").await.unwrap_err();
        assert!(matches!(err, Error::StartupFailed(_)));
        assert!(framework.module_info("broken").is_none());
        assert!(framework.registry().find_by_name("doomed").is_none());
    }

    #[tokio::test]
    async fn test_late_blueprint_joins_running_module() {
        let base = tempfile::tempdir().unwrap();
        let framework = Framework::new(test_config(base.path())).unwrap();
        framework.register_built_in(
            core_descriptor(),
            Arc::new(|| CountingModule::new() as Arc<dyn Module>),
        );
        framework.prepare_dirs().unwrap();
        framework.start_module("core").await.unwrap();

        let sweeps = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&sweeps);
        let blueprint = Blueprint::component("lateGauge", || Arc::new(AtomicU32::new(7)))
            .pre_destroy(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();
        framework.add_blueprint("core", blueprint).unwrap();
        let gauge = framework
            .registry()
            .find_named::<AtomicU32>("lateGauge")
            .unwrap();
        assert_eq!(gauge.load(Ordering::SeqCst), 7);

        let err = framework
            .add_blueprint("ghost", Blueprint::component("orphan", || Arc::new(0u32)).build())
            .unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound(_)));

        // The late component's teardown and registration ride the module's
        // stop path.
        framework.stop_module("core").await.unwrap();
        assert_eq!(sweeps.load(Ordering::SeqCst), 1);
        assert!(framework.registry().find_by_name("lateGauge").is_none());
    }

    #[tokio::test]
    async fn test_config_reload_publishes_event() {
        let base = tempfile::tempdir().unwrap();
        let framework = Framework::new(test_config(base.path())).unwrap();
        framework.register_built_in(
            core_descriptor(),
            Arc::new(|| CountingModule::new() as Arc<dyn Module>),
        );
        framework.prepare_dirs().unwrap();
        framework.start_module("core").await.unwrap();
        let mut events = framework.events().subscribe("test");

        std::fs::write(base.path().join("conf.d/core.conf"), "core.mode=replay").unwrap();
        framework.reload_module_config("core").unwrap();

        let context = framework.read_contexts().get("core").cloned().unwrap();
        let snapshot = context.config();
        assert_eq!(snapshot.get("core.mode"), Some("replay"));

        let envelope = events.recv().await.unwrap();
        assert!(matches!(envelope.event, LifecycleEvent::ConfigChanged(_)));
        assert_eq!(envelope.event.module_name(), "core");

        assert!(matches!(
            framework.reload_module_config("ghost"),
            Err(Error::InstanceNotFound(_))
        ));
    }
}
