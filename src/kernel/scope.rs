//! Module isolation scopes.
//!
//! Each non-built-in module owns a `ModuleScope`: its working directory, its
//! bundled unit archives, and an export table of entry-point factories.
//! Resource lookup walks a fixed tier order: module workdir (relative names
//! only), the module's own bundled units, the shared extra-services scope,
//! then the host directories. Factory resolution is context-aware: the
//! current module's exports are consulted first, then every other loaded
//! scope, then the host table — cross-module visibility of exported symbols
//! is intentional.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::kernel::descriptor::ModuleFactory;
use crate::kernel::framework::ModuleContext;
use crate::types::Result;

/// Collect unit archives (`*.jar` / `*.zip`) under a `libs` directory,
/// sorted for determinism.
pub fn scan_units(libs_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut units = Vec::new();
    if !libs_dir.is_dir() {
        return Ok(units);
    }
    for entry in std::fs::read_dir(libs_dir)? {
        let path = entry?.path();
        if is_unit(&path) {
            units.push(path);
        }
    }
    units.sort();
    Ok(units)
}

pub fn is_unit(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("jar") | Some("zip")
        )
}

fn read_archive_entry(unit: &Path, entry: &str) -> Result<Option<Vec<u8>>> {
    let file = std::fs::File::open(unit)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let result = match archive.by_name(entry) {
        Ok(mut found) => {
            let mut buf = Vec::new();
            found.read_to_end(&mut buf)?;
            Ok(Some(buf))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(err.into()),
    };
    result
}

// =============================================================================
// Shared scope
// =============================================================================

/// Units loaded once from the extra-services directory and visible to every
/// module scope, never duplicated per module.
#[derive(Default)]
pub struct SharedScope {
    units: Vec<PathBuf>,
    exports: RwLock<BTreeMap<String, ModuleFactory>>,
}

impl SharedScope {
    pub fn load(dir: &Path) -> Result<Self> {
        let units = scan_units(dir)?;
        debug!(dir = %dir.display(), units = units.len(), "loaded shared scope");
        Ok(Self {
            units,
            exports: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn export(&self, symbol: impl Into<String>, factory: ModuleFactory) {
        self.exports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.into(), factory);
    }

    fn factory(&self, symbol: &str) -> Option<ModuleFactory> {
        self.exports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .cloned()
    }

    pub fn read_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        for unit in &self.units {
            if let Some(data) = read_unit_resource(unit, name)? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }
}

fn read_unit_resource(unit: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    if let Some(data) = read_archive_entry(unit, name)? {
        return Ok(Some(data));
    }
    read_archive_entry(unit, &format!("META-INF/{name}"))
}

// =============================================================================
// Module scope
// =============================================================================

struct ScopeState {
    exports: BTreeMap<String, ModuleFactory>,
    units: Vec<PathBuf>,
    owner: Option<Weak<ModuleContext>>,
}

/// One module's isolation boundary.
pub struct ModuleScope {
    id: Uuid,
    module: String,
    workdir: PathBuf,
    shared: Arc<SharedScope>,
    host_dirs: Vec<PathBuf>,
    state: RwLock<ScopeState>,
}

impl ModuleScope {
    pub fn new(
        module: impl Into<String>,
        workdir: PathBuf,
        shared: Arc<SharedScope>,
        host_dirs: Vec<PathBuf>,
    ) -> Result<Self> {
        let module = module.into();
        let units = scan_units(&workdir.join("libs"))?;
        Ok(Self {
            id: Uuid::new_v4(),
            module,
            workdir,
            shared,
            host_dirs,
            state: RwLock::new(ScopeState {
                exports: BTreeMap::new(),
                units,
                owner: None,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Publish an entry-point factory under this scope.
    pub fn export(&self, symbol: impl Into<String>, factory: ModuleFactory) {
        self.write().exports.insert(symbol.into(), factory);
    }

    fn factory(&self, symbol: &str) -> Option<ModuleFactory> {
        self.read().exports.get(symbol).cloned()
    }

    /// Attach the back-reference to the owning context.
    pub fn bind_owner(&self, owner: &Arc<ModuleContext>) {
        self.write().owner = Some(Arc::downgrade(owner));
    }

    pub fn owner(&self) -> Option<Arc<ModuleContext>> {
        self.read().owner.as_ref().and_then(Weak::upgrade)
    }

    /// Resolve a resource through the tier chain. Relative names consult the
    /// module workdir first; bundled units, the shared scope, and host
    /// directories follow in order.
    pub fn read_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if !name.starts_with('/') {
            let local = self.workdir.join(name);
            if local.is_file() {
                trace!(module = %self.module, resource = name, "resolved from workdir");
                return Ok(Some(std::fs::read(local)?));
            }
        }
        let name = name.trim_start_matches('/');
        for unit in &self.read().units {
            if let Some(data) = read_unit_resource(unit, name)? {
                trace!(module = %self.module, resource = name, "resolved from bundled unit");
                return Ok(Some(data));
            }
        }
        if let Some(data) = self.shared.read_resource(name)? {
            return Ok(Some(data));
        }
        for dir in &self.host_dirs {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(Some(std::fs::read(candidate)?));
            }
        }
        Ok(None)
    }

    /// Release unit handles, exports, and the owner back-reference.
    pub fn teardown(&self) {
        let mut state = self.write();
        state.exports.clear();
        state.units.clear();
        state.owner = None;
        debug!(module = %self.module, "scope torn down");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ScopeState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ScopeState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Scope set
// =============================================================================

/// All loaded scopes plus the host symbol table.
pub struct ScopeSet {
    host: RwLock<BTreeMap<String, ModuleFactory>>,
    shared: Arc<SharedScope>,
    scopes: RwLock<BTreeMap<String, Arc<ModuleScope>>>,
}

impl ScopeSet {
    pub fn new(shared: Arc<SharedScope>) -> Self {
        Self {
            host: RwLock::new(BTreeMap::new()),
            shared,
            scopes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn shared(&self) -> &Arc<SharedScope> {
        &self.shared
    }

    /// Register a factory in the host table (built-in modules land here).
    pub fn export_host(&self, symbol: impl Into<String>, factory: ModuleFactory) {
        self.host
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.into(), factory);
    }

    pub fn insert(&self, scope: Arc<ModuleScope>) {
        self.scopes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scope.module().to_string(), scope);
    }

    pub fn remove(&self, module: &str) -> Option<Arc<ModuleScope>> {
        self.scopes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(module)
    }

    pub fn get(&self, module: &str) -> Option<Arc<ModuleScope>> {
        self.scopes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .cloned()
    }

    /// Resolve an entry-point factory: the current module's scope first,
    /// then every other loaded scope, then the shared scope, then the host
    /// table.
    pub fn resolve_factory(&self, current: Option<&str>, symbol: &str) -> Option<ModuleFactory> {
        let scopes = self.scopes.read().unwrap_or_else(|e| e.into_inner());
        if let Some(name) = current {
            if let Some(factory) = scopes.get(name).and_then(|s| s.factory(symbol)) {
                return Some(factory);
            }
        }
        for (name, scope) in scopes.iter() {
            if Some(name.as_str()) == current {
                continue;
            }
            if let Some(factory) = scope.factory(symbol) {
                trace!(symbol, scope = %name, "factory resolved from foreign scope");
                return Some(factory);
            }
        }
        drop(scopes);
        if let Some(factory) = self.shared.factory(symbol) {
            return Some(factory);
        }
        self.host
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::descriptor::Module;
    use std::io::Write;

    struct NoopModule;

    #[async_trait::async_trait]
    impl Module for NoopModule {
        async fn start(&self, _context: Arc<ModuleContext>) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn noop_factory() -> ModuleFactory {
        Arc::new(|| Arc::new(NoopModule) as Arc<dyn Module>)
    }

    fn write_unit(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn scope_in(dir: &Path) -> ModuleScope {
        ModuleScope::new(
            "widgets",
            dir.to_path_buf(),
            Arc::new(SharedScope::default()),
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_workdir_resource_wins_over_bundled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("libs")).unwrap();
        std::fs::write(dir.path().join("widgets.conf"), "from=workdir").unwrap();
        write_unit(
            &dir.path().join("libs/widgets.jar"),
            &[("widgets.conf", "from=unit")],
        );

        let scope = scope_in(dir.path());
        let data = scope.read_resource("widgets.conf").unwrap().unwrap();
        assert_eq!(data, b"from=workdir");
    }

    #[test]
    fn test_bundled_unit_resource_with_meta_inf_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("libs")).unwrap();
        write_unit(
            &dir.path().join("libs/widgets.jar"),
            &[("META-INF/module.properties", "module.name=widgets")],
        );

        let scope = scope_in(dir.path());
        let data = scope.read_resource("module.properties").unwrap().unwrap();
        assert_eq!(data, b"module.name=widgets");
        assert!(scope.read_resource("absent.conf").unwrap().is_none());
    }

    #[test]
    fn test_factory_resolution_order() {
        let shared = Arc::new(SharedScope::default());
        let set = ScopeSet::new(Arc::clone(&shared));

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let scope_a = Arc::new(
            ModuleScope::new("a", dir_a.path().to_path_buf(), Arc::clone(&shared), Vec::new())
                .unwrap(),
        );
        let scope_b = Arc::new(
            ModuleScope::new("b", dir_b.path().to_path_buf(), Arc::clone(&shared), Vec::new())
                .unwrap(),
        );
        set.insert(Arc::clone(&scope_a));
        set.insert(Arc::clone(&scope_b));

        scope_b.export("acme.entry", noop_factory());
        set.export_host("acme.entry", noop_factory());

        // Current scope lacks the symbol: foreign scopes are scanned before
        // the host table.
        assert!(set.resolve_factory(Some("a"), "acme.entry").is_some());
        assert!(set.resolve_factory(None, "unknown.entry").is_none());

        set.remove("b");
        // Host fallback still resolves.
        assert!(set.resolve_factory(Some("a"), "acme.entry").is_some());
    }

    #[test]
    fn test_teardown_clears_exports() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_in(dir.path());
        scope.export("acme.entry", noop_factory());
        assert!(scope.factory("acme.entry").is_some());

        scope.teardown();
        assert!(scope.factory("acme.entry").is_none());
        assert!(scope.owner().is_none());
    }
}
