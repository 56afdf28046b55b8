//! emk - a hierarchical, incremental, parallel build engine
//!
//! Build descriptions declare rules that map product paths to dependency
//! paths and build functions. The engine visits directories, collects
//! rules across a multi-phase configuration, reconciles the dependency
//! graph between phases, and executes rules in dependency order on a
//! worker pool, reusing per-directory persistent caches to skip rules
//! whose inputs are unchanged.

pub mod api;
pub mod cache;
pub mod clean;
pub mod engine;
pub mod error;
pub mod exec;
pub mod graph;
pub mod loader;
pub mod module;
pub mod paths;
pub mod scope;
mod trace;

// Re-exports for convenience
pub use api::{Args, DeferredFn, Emk, RuleContext, RuleFn, RuleOpts};
pub use cache::{Change, ChangeFn, DirCache, FileStamp};
pub use engine::{Engine, EngineConfig};
pub use error::{BuildError, ErrorKind, Result};
pub use loader::{ConfigSource, ScriptRegistry, default_config_dirs};
pub use module::{Module, ModuleRegistry, NewScope};
pub use paths::{ALWAYS_BUILD, BUILD_PLACEHOLDER, DepPath, PROJ_PLACEHOLDER};
pub use scope::ScopeKind;
