//! # Modulith - In-Process Module Runtime
//!
//! Rust implementation of a module/plugin runtime kernel providing:
//! - Descriptor and dependency modeling with topological start ordering
//! - Per-module isolation scopes with tiered resource resolution
//! - A name- and capability-indexed service registry with contribution cleanup
//! - Blueprint-driven dependency injection with lifecycle hooks
//! - Timeout-bounded startup supervision with guaranteed unwinding
//! - Module package deployment (single units and archives)
//! - An orchestrator with lifecycle events and a remote shutdown trigger
//!
//! ## Architecture
//!
//! The `Framework` owns all mutable state and composes the subsystems:
//! ```text
//!                 ┌────────────────────────────────────┐
//!   operations →  │            Framework               │
//!                 │  ┌────────┐ ┌────────┐ ┌────────┐  │
//!                 │  │Resolver│ │Registry│ │Injector│  │
//!                 │  └────────┘ └────────┘ └────────┘  │
//!                 │  ┌────────┐ ┌────────┐ ┌────────┐  │
//!                 │  │ Scopes │ │Supervsr│ │Deployer│  │
//!                 │  └────────┘ └────────┘ └────────┘  │
//!                 └────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod events;
pub mod kernel;
pub mod properties;
pub mod services;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::{Framework, Module, ModuleContext, ModuleDescriptor};
pub use types::{Error, FrameworkConfig, Result};
