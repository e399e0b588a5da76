//! Orchestration kernel.
//!
//! The `Framework` owns all mutable state; subsystems (resolver, registry,
//! injector, scopes, supervisor, deployer) are plain structs it composes,
//! not separate actors. Modules interact with the kernel only through their
//! `ModuleContext` and the shared `ServiceRegistry`.

pub mod deployer;
pub mod descriptor;
pub mod framework;
pub mod injector;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod supervisor;

pub use deployer::Deployer;
pub use descriptor::{LifecycleState, Module, ModuleDescriptor, ModuleFactory};
pub use framework::{Framework, ModuleContext, ModuleInfo, FRAMEWORK_OWNER, SHUTDOWN_PAYLOAD};
pub use injector::{Blueprint, Injector, WiredBatch, WiredComponent};
pub use registry::{ServiceHandle, ServiceKey, ServiceRegistration, ServiceRegistry};
pub use scope::{ModuleScope, ScopeSet, SharedScope};
pub use supervisor::{Supervised, Supervisor, STARTUP_GRACE};
