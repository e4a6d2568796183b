//! # Struct Bridge
//!
//! A reflection and binding engine that exposes a host program's native data
//! layouts to an embedded Lua runtime and to hot-reloadable native plugins.
//!
//! ## Features
//!
//! - **Type Registry**: Primitive, struct, class, union, enum, bitfield, container
//!   and function identities with single inheritance and virtual class resolution
//! - **Field Bindings**: Per-type binding tables built lazily and cached
//! - **Object Access**: Typed reads, writes, assignment, casts and displacement over host memory
//! - **Scripting**: Lua proxies for references and types, structured errors, timers and a prompt
//! - **Plugins**: Dynamic libraries with commands, functions and events, unloadable while in use
//!
//! ## Architecture Design
//!
//! - **Runtime**: Owns the type registry, binding cache, host memory, globals and plugins
//! - **Suspend Lock**: Recursive lock serializing every access to host objects
//! - **Interrupt Flag**: Cooperative cancellation of long-running scripts
//!
//! ### Example
//!
//! ```ignore
//! use struct_bridge::core::Runtime;
//! use struct_bridge::scripting::ScriptBridge;
//!
//! let runtime = Runtime::builder().types(registry).build()?;
//! let bridge = ScriptBridge::new(runtime)?;
//! bridge.exec("print(host.globals.world.units[0].hp)", "=demo")?;
//! ```
//!
//! ## Modules
//!
//! - [`core`]: Runtime, errors, locking and scheduling
//! - [`types`]: Type identities and the registry
//! - [`binding`]: Lazily built binding tables
//! - [`fields`]: Field, container and union access
//! - [`access`]: Values, references and native calls
//! - [`scripting`]: Lua bridge
//! - [`plugins`]: Plugin loading, unloading and hot reload

/// Runtime, errors, locking and scheduling
pub mod core;
/// Typed values and object references
pub mod access;
/// Per-type binding tables
pub mod binding;
/// Configuration system
pub mod config;
/// Field, container and union access
pub mod fields;
/// Host memory abstraction
pub mod memory;
/// Native plugin lifecycle
pub mod plugins;
/// Lua scripting bridge
pub mod scripting;
/// Type identities and registry
pub mod types;
