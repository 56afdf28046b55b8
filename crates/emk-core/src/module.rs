//! The module host
//!
//! Modules are named, hierarchical configuration objects. A scope acquires
//! a module instance either from its parent (via [`Module::new_scope`]) or
//! from the process-wide name registry. Bindings are *strong* by default;
//! a *weak* binding behaves identically for lookup but does not receive
//! `post` lifecycle hooks, and is promoted in place by a later strong
//! lookup in the same scope.
//!
//! There is no runtime code import: module definitions are linked into the
//! binary and registered by name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::api::Emk;
use crate::scope::ScopeKind;

/// A module's capability surface.
///
/// All hooks are optional; `new_scope` decides how the module propagates
/// into child scopes.
pub trait Module: Send {
    /// Called when the module is first bound into a scope of `kind`.
    fn load(&mut self, emk: &Emk<'_>, kind: ScopeKind) -> anyhow::Result<()> {
        let _ = (emk, kind);
        Ok(())
    }

    /// Called after the configuration file for a scope of `kind` has
    /// finished loading (strong bindings only).
    fn post(&mut self, emk: &Emk<'_>, kind: ScopeKind) -> anyhow::Result<()> {
        let _ = (emk, kind);
        Ok(())
    }

    /// Produce this module's counterpart for a child scope of `kind`.
    fn new_scope(&mut self, kind: ScopeKind) -> NewScope;
}

/// The result of [`Module::new_scope`].
pub enum NewScope {
    /// The child scope shares this very instance.
    Shared,
    /// The child scope gets a fresh instance.
    Instance(Box<dyn Module>),
}

impl std::fmt::Debug for NewScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => f.write_str("Shared"),
            Self::Instance(_) => f.write_str("Instance(..)"),
        }
    }
}

/// A shareable, lockable module instance.
pub type ModuleHandle = Arc<Mutex<Box<dyn Module>>>;

/// A named module instance bound into a scope.
#[derive(Clone)]
pub struct ModuleBinding {
    /// The binding name.
    pub name: String,
    /// The instance.
    pub handle: ModuleHandle,
}

impl std::fmt::Debug for ModuleBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleBinding")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ModuleBinding {
    /// Wrap a fresh instance.
    pub fn new(name: impl Into<String>, instance: Box<dyn Module>) -> Self {
        Self {
            name: name.into(),
            handle: Arc::new(Mutex::new(instance)),
        }
    }

    /// Materialize the result of `new_scope` into a binding for the child.
    pub fn spawn_child(&self, spawned: NewScope) -> Self {
        match spawned {
            NewScope::Shared => self.clone(),
            NewScope::Instance(instance) => Self::new(self.name.clone(), instance),
        }
    }
}

/// Constructor for a module instance, given the kind of the scope that is
/// loading it.
pub type ModuleFactory = Arc<dyn Fn(ScopeKind) -> Box<dyn Module> + Send + Sync>;

/// The process-wide module name registry. This replaces an on-disk module
/// search path: definitions are linked statically and looked up by name.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleRegistry {
    /// Register a module definition under `name`. A later registration
    /// under the same name replaces the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ScopeKind) -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&ModuleFactory> {
        self.factories.get(name)
    }
}
