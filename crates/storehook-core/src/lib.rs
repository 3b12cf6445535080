//! Core types for storehook.
//!
//! This crate provides the plugin records persisted by the storefront, the
//! row-level contract every plugin store implements, an in-memory store, and
//! the [`Registry`] that translates rows into records and back.

mod error;
mod memory;
mod model;
mod registry;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use model::{
    DataEntry, ModuleScope, Plugin, PluginBuilder, PluginBuilderError, PluginDependency,
    PluginEvent, PluginHook, PluginManifest, PluginModule, PluginStatus, SecurityLevel,
    TenantOverride, UiSurface,
};
pub use registry::Registry;
pub use store::{Column, ColumnKind, PluginStore, Query, Row, Table};
