//! The control surface exposed to build descriptions and rule bodies
//!
//! [`Emk`] is the handle a build description receives: it is bound to the
//! scope being configured and exposes rule/alias/dependency declaration,
//! module loading, deferred functions, and scope settings. [`RuleContext`]
//! is the handle a rule body receives while executing: product and
//! requirement access, virtual/untouched marking, and the rule's persistent
//! cache.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{BlobMap, RuleCache};
use crate::engine::EngineShared;
use crate::error::{Origin, Result};
use crate::graph::RuleSpec;
use crate::module::{Module, ModuleHandle};
use crate::paths::{self, DepPath, PathContext};
use crate::scope::{ScopeId, ScopeKind};

/// Opaque arguments forwarded to a rule's build function.
pub type Args = Arc<dyn Any + Send + Sync>;

/// A rule's build function.
pub type RuleFn = Arc<dyn Fn(&mut RuleContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// A deferred configuration closure (`do_later`, `do_prebuild`,
/// `do_postbuild`).
pub type DeferredFn = Box<dyn FnOnce(&Emk<'_>) -> anyhow::Result<()> + Send>;

/// Optional settings for [`Emk::rule`].
#[derive(Clone, Default)]
pub struct RuleOpts {
    /// The rule may run in parallel without holding the process working
    /// directory.
    pub cwd_safe: bool,
    /// The rule tolerates partial execution under interruption.
    pub ex_safe: bool,
    /// A custom change detector for this rule's paths.
    pub has_changed: Option<crate::cache::ChangeFn>,
    /// Opaque arguments forwarded to the build function.
    pub args: Option<Args>,
}

impl std::fmt::Debug for RuleOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleOpts")
            .field("cwd_safe", &self.cwd_safe)
            .field("ex_safe", &self.ex_safe)
            .field("has_changed", &self.has_changed.is_some())
            .field("args", &self.args.is_some())
            .finish()
    }
}

impl RuleOpts {
    /// A cwd-safe rule.
    pub fn cwd_safe() -> Self {
        Self {
            cwd_safe: true,
            ..Self::default()
        }
    }
}

/// The engine handle bound to one scope.
#[derive(Clone, Copy)]
pub struct Emk<'e> {
    pub(crate) engine: &'e EngineShared,
    pub(crate) scope: ScopeId,
}

impl std::fmt::Debug for Emk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emk").field("scope", &self.scope).finish()
    }
}

impl<'e> Emk<'e> {
    fn path_ctx(&self) -> PathContext {
        self.engine.with_state(|st| st.scopes.get(self.scope).path_context())
    }

    /// The current scope's directory.
    pub fn scope_dir(&self) -> PathBuf {
        self.engine.with_state(|st| st.scopes.get(self.scope).dir.clone())
    }

    /// The current scope's project directory.
    pub fn proj_dir(&self) -> PathBuf {
        self.engine
            .with_state(|st| st.scopes.get(self.scope).proj_dir.clone())
    }

    /// The current scope's kind.
    pub fn scope_kind(&self) -> ScopeKind {
        self.engine.with_state(|st| st.scopes.get(self.scope).kind)
    }

    /// The current build-directory setting.
    pub fn build_dir(&self) -> String {
        self.engine
            .with_state(|st| st.scopes.get(self.scope).build_dir.clone())
    }

    /// Set the build directory for this scope (and scopes that inherit it).
    pub fn set_build_dir(&self, dir: &str) {
        self.engine
            .with_state(|st| st.scopes.get_mut(self.scope).build_dir = dir.to_string());
    }

    /// Modules loaded when a directory has no rules description.
    pub fn default_modules(&self) -> Vec<String> {
        self.engine
            .with_state(|st| st.scopes.get(self.scope).default_modules.clone())
    }

    /// Replace the default-module list for this scope.
    pub fn set_default_modules(&self, names: &[&str]) {
        self.engine.with_state(|st| {
            st.scopes.get_mut(self.scope).default_modules =
                names.iter().map(|s| s.to_string()).collect();
        });
    }

    /// Modules loaded before the rules description.
    pub fn pre_modules(&self) -> Vec<String> {
        self.engine
            .with_state(|st| st.scopes.get(self.scope).pre_modules.clone())
    }

    /// Replace the pre-module list for this scope.
    pub fn set_pre_modules(&self, names: &[&str]) {
        self.engine.with_state(|st| {
            st.scopes.get_mut(self.scope).pre_modules =
                names.iter().map(|s| s.to_string()).collect();
        });
    }

    /// Whether this run is cleaning.
    pub fn cleaning(&self) -> bool {
        self.engine.config.cleaning
    }

    /// Whether the executor is currently running rules.
    pub fn building(&self) -> bool {
        self.engine.with_state(|st| st.building)
    }

    /// The option map parsed from the command line.
    pub fn options(&self) -> BTreeMap<String, String> {
        self.engine.config.options.clone()
    }

    /// One command-line option.
    pub fn option(&self, key: &str) -> Option<String> {
        self.engine.config.options.get(key).cloned()
    }

    /// The still-unresolved explicit targets.
    pub fn explicit_targets(&self) -> Vec<String> {
        self.engine.with_state(|st| {
            if st.explicit_fixed {
                st.explicit_targets
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect()
            } else {
                st.explicit_targets_raw.clone()
            }
        })
    }

    /// Targets declared in this scope, by their user-supplied path.
    pub fn local_targets(&self) -> Vec<(String, PathBuf)> {
        self.engine.with_state(|st| {
            let scope = st.scopes.get(self.scope);
            scope
                .local_targets
                .iter()
                .filter_map(|(orig, id)| {
                    st.graph
                        .target(*id)
                        .path
                        .as_path()
                        .map(|p| (orig.clone(), p.to_path_buf()))
                })
                .collect()
        })
    }

    /// Expand placeholders and resolve `path` against this scope.
    pub fn abspath(&self, path: &str) -> PathBuf {
        paths::target_abspath(path, &self.path_ctx())
    }

    /// Declare a rule producing `produces` from `requires`.
    ///
    /// Only valid in a rules scope. Fails if a product is already produced
    /// by another rule or was declared as an alias. Empty path strings are
    /// ignored; duplicate products within the call collapse to one.
    #[track_caller]
    pub fn rule<F>(&self, produces: &[&str], requires: &[&str], func: F, opts: RuleOpts) -> Result<()>
    where
        F: Fn(&mut RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let origin = Origin::here();
        self.rule_impl(produces, requires, Arc::new(func), opts, origin)
    }

    /// [`rule`](Self::rule) for an already-shared build function, as used
    /// when one function backs many rules.
    #[track_caller]
    pub fn make_rule(
        &self,
        produces: &[&str],
        requires: &[&str],
        func: RuleFn,
        opts: RuleOpts,
    ) -> Result<()> {
        let origin = Origin::here();
        self.rule_impl(produces, requires, func, opts, origin)
    }

    pub(crate) fn rule_impl(
        &self,
        produces: &[&str],
        requires: &[&str],
        func: RuleFn,
        opts: RuleOpts,
        origin: Origin,
    ) -> Result<()> {
        let kind = self.scope_kind();
        if kind != ScopeKind::Rules {
            tracing::warn!(
                "Cannot create rules when not in 'rules' scope (current scope = '{kind}')"
            );
            return Ok(());
        }
        let ctx = self.path_ctx();

        let mut seen = std::collections::HashSet::new();
        let mut fixed_produces = Vec::new();
        for p in produces {
            if !p.is_empty() && *p != paths::ALWAYS_BUILD && seen.insert(p.to_string()) {
                fixed_produces.push((p.to_string(), paths::target_abspath(p, &ctx)));
            }
        }
        let fixed_requires: Vec<DepPath> = requires
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| paths::require_abspath(r, &ctx))
            .collect();

        let has_changed = opts
            .has_changed
            .unwrap_or_else(crate::cache::default_change_fn);

        self.engine.with_state(|st| {
            let rule = st.graph.push_rule(
                func,
                opts.args,
                opts.cwd_safe,
                opts.ex_safe,
                has_changed,
                self.scope,
                origin,
                fixed_requires.clone(),
            );
            for (orig, abs) in fixed_produces {
                tracing::debug!("Adding target {} <= {:?}", abs.display(), fixed_requires);
                let id = st.graph.add_product(rule, orig.clone(), abs)?;
                st.scopes
                    .get_mut(self.scope)
                    .local_targets
                    .insert(orig, id);
                st.added_rule = true;
            }
            Ok(())
        })
    }

    /// Declare `alias` as another name for `target`.
    #[track_caller]
    pub fn alias(&self, target: &str, alias: &str) -> Result<()> {
        let ctx = self.path_ctx();
        let abs_target = paths::target_abspath(target, &ctx);
        let abs_alias = paths::target_abspath(alias, &ctx);
        self.engine.with_state(|st| {
            st.graph.add_alias(abs_alias, abs_target)?;
            st.added_rule = true;
            Ok(())
        })
    }

    /// Add secondary dependencies to the (present or future) rule that
    /// produces `target`.
    pub fn depend(&self, target: &str, deps: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<DepPath> = deps
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| paths::require_abspath(d, &ctx))
            .collect();
        if fixed.is_empty() {
            return;
        }
        let abs = paths::target_abspath(target, &ctx);
        tracing::debug!("Adding {fixed:?} as dependencies of target {}", abs.display());
        self.engine.with_state(|st| {
            st.graph.secondary_pending.entry(abs).or_default().extend(fixed);
        });
    }

    /// Add weak dependencies: they must be built only if some rule produces
    /// them, and their absence is acceptable.
    pub fn weak_depend(&self, target: &str, deps: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<DepPath> = deps
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| paths::require_abspath(d, &ctx))
            .collect();
        if fixed.is_empty() {
            return;
        }
        let abs = paths::target_abspath(target, &ctx);
        tracing::debug!(
            "Adding {fixed:?} as weak dependencies of target {}",
            abs.display()
        );
        self.engine.with_state(|st| {
            st.graph.weak_pending.entry(abs).or_default().extend(fixed);
        });
    }

    /// Attach `others` to `target`: they are built whenever `target` is,
    /// with no ordering between them.
    pub fn attach(&self, target: &str, others: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<DepPath> = others
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| paths::require_abspath(d, &ctx))
            .collect();
        let abs = paths::target_abspath(target, &ctx);
        tracing::debug!("Attaching {fixed:?} to target {}", abs.display());
        self.engine.with_state(|st| {
            st.graph.attached_pending.entry(abs).or_default().extend(fixed);
        });
    }

    /// Mark paths for automatic building when no explicit target names them.
    pub fn autobuild(&self, targets: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<PathBuf> = targets
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| paths::target_abspath(t, &ctx))
            .collect();
        self.engine.with_state(|st| {
            for path in fixed {
                tracing::debug!("Marking {} for automatic build", path.display());
                st.graph.auto_targets.insert(path);
            }
        });
    }

    /// Require the given paths to be produced by some rule.
    pub fn require_rule(&self, targets: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<DepPath> = targets
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| paths::require_abspath(t, &ctx))
            .collect();
        self.engine.with_state(|st| {
            for path in fixed {
                tracing::debug!(
                    "Requiring {} to be built by an explicit rule",
                    path.display_string()
                );
                st.graph.requires_rule.insert(path);
            }
        });
    }

    /// Opt the given products into external-mutation detection.
    pub fn rebuild_if_changed(&self, targets: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<PathBuf> = targets
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| paths::target_abspath(t, &ctx))
            .collect();
        self.engine.with_state(|st| {
            for path in fixed {
                tracing::debug!("Requiring {} to be rebuilt if it has changed", path.display());
                st.graph.rebuild_if_changed.insert(path);
            }
        });
    }

    /// Ask the engine to visit the given directories.
    pub fn recurse(&self, dirs: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<PathBuf> = dirs
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| paths::target_abspath(d, &ctx))
            .collect();
        self.engine.with_state(|st| {
            let scope = st.scopes.get_mut(self.scope);
            for dir in fixed {
                tracing::debug!("Adding recurse directory {}", dir.display());
                scope.recurse_dirs.insert(dir);
            }
        });
    }

    /// Like [`recurse`](Self::recurse), and additionally attach each child
    /// directory's `clean` target to this scope's `clean`.
    pub fn subdir(&self, dirs: &[&str]) {
        self.recurse(dirs);
        for dir in dirs {
            if dir.is_empty() {
                continue;
            }
            let sub_clean = format!("{}/clean", dir.trim_end_matches('/'));
            self.attach("clean", &[sub_clean.as_str()]);
        }
    }

    /// Defer `func` until the current configuration stage finishes loading.
    pub fn do_later<F>(&self, func: F)
    where
        F: FnOnce(&Emk<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.engine.with_state(|st| {
            st.scopes.get_mut(self.scope).do_later.push(Box::new(func));
        });
    }

    /// Run `func` before the next build phase's executor starts.
    pub fn do_prebuild<F>(&self, func: F)
    where
        F: FnOnce(&Emk<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.engine.with_state(|st| {
            st.prebuild.push((self.scope, Box::new(func)));
        });
    }

    /// Run `func` after the next build phase's executor finishes.
    pub fn do_postbuild<F>(&self, func: F)
    where
        F: FnOnce(&Emk<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.engine.with_state(|st| {
            st.postbuild.push((self.scope, Box::new(func)));
        });
    }

    /// Load a module (strong binding) into this scope.
    pub fn module(&self, name: &str) -> Result<Option<ModuleHandle>> {
        crate::engine::load_module(self.engine, self.scope, name, false)
    }

    /// Load a module with a weak binding: lookup behaves the same, but
    /// `post` hooks do not fire for this scope unless a later strong
    /// lookup promotes the binding.
    pub fn weak_module(&self, name: &str) -> Result<Option<ModuleHandle>> {
        crate::engine::load_module(self.engine, self.scope, name, true)
    }

    /// Bind a pre-built module instance into this scope (weakly). Refused
    /// with a warning if the name is already bound.
    pub fn insert_module(
        &self,
        name: &str,
        instance: Box<dyn Module>,
    ) -> Result<Option<ModuleHandle>> {
        crate::engine::insert_module(self.engine, self.scope, name, instance)
    }

    /// Record paths to run the dependency tracer on after the build.
    pub fn trace(&self, targets: &[&str]) {
        let ctx = self.path_ctx();
        let fixed: Vec<PathBuf> = targets
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| paths::target_abspath(t, &ctx))
            .collect();
        self.engine.with_state(|st| st.traced.extend(fixed));
    }

    /// Access this scope's persistent module-private storage under `key`.
    /// No-op (with a warning) outside a scope that owns a cache.
    pub fn scope_cache<R>(&self, key: &str, f: impl FnOnce(&mut BlobMap) -> R) -> Option<R> {
        self.engine.with_state(|st| {
            let scope = st.scopes.get_mut(self.scope);
            match scope.cache.as_mut() {
                Some(cache) => Some(f(cache.other.entry(key.to_string()).or_default())),
                None => {
                    tracing::warn!(
                        "Scope {} has no cache; scope_cache({key}) ignored",
                        scope.dir.display()
                    );
                    None
                }
            }
        })
    }
}

/// String key used for a path inside a rule's cache sub-map.
pub(crate) fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The handle a rule body receives while it executes.
pub struct RuleContext<'e> {
    pub(crate) engine: &'e EngineShared,
    pub(crate) spec: &'e Arc<RuleSpec>,
    pub(crate) produces: Vec<PathBuf>,
    pub(crate) requires: Vec<DepPath>,
    pub(crate) path_ctx: PathContext,
    pub(crate) cache: RuleCache,
    pub(crate) untouched: std::collections::HashSet<String>,
    pub(crate) deferred: Vec<DeferredFn>,
}

impl std::fmt::Debug for RuleContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleContext")
            .field("produces", &self.produces)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

impl<'e> RuleContext<'e> {
    /// The rule's product paths, in declaration order.
    pub fn produces(&self) -> &[PathBuf] {
        &self.produces
    }

    /// The rule's resolved primary requirements.
    pub fn requires(&self) -> &[DepPath] {
        &self.requires
    }

    /// The requirement paths, skipping the always-build sentinel.
    pub fn require_paths(&self) -> impl Iterator<Item = &Path> {
        self.requires.iter().filter_map(DepPath::as_path)
    }

    /// Downcast the rule's opaque arguments.
    pub fn args<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.spec.args.as_ref()?.downcast_ref::<T>()
    }

    /// The owning scope's directory.
    pub fn scope_dir(&self) -> &Path {
        &self.path_ctx.dir
    }

    /// The owning scope's project directory.
    pub fn proj_dir(&self) -> &Path {
        &self.path_ctx.proj_dir
    }

    /// The owning scope's build directory, as an absolute path.
    pub fn build_dir(&self) -> PathBuf {
        self.path_ctx.abs_build_dir()
    }

    /// Expand placeholders and resolve `path` against the owning scope.
    pub fn abspath(&self, path: &str) -> PathBuf {
        paths::target_abspath(path, &self.path_ctx)
    }

    /// The engine handle, bound to the owning scope, for declaration
    /// operations from inside the rule body.
    pub fn emk(&self) -> Emk<'e> {
        Emk {
            engine: self.engine,
            scope: self.spec.scope,
        }
    }

    /// Mark products as virtual: they have no on-disk file, and change
    /// tracking uses a logical modification time instead.
    pub fn mark_virtual(&mut self, targets: &[&str]) {
        for t in targets {
            let abs = paths::target_abspath(t, &self.path_ctx);
            let key = cache_key(&abs);
            match self.cache.get_mut(&key) {
                Some(entry) => {
                    tracing::debug!("Marking {} as virtual", abs.display());
                    entry.is_virtual = true;
                }
                None => {
                    tracing::debug!(
                        "Cannot mark {} as virtual since it is not a rule product",
                        abs.display()
                    );
                }
            }
        }
    }

    /// Declare that the rule executed but did not actually modify the given
    /// products, so their stored modification times are left unchanged.
    pub fn mark_untouched(&mut self, targets: &[&str]) {
        for t in targets {
            let abs = paths::target_abspath(t, &self.path_ctx);
            tracing::debug!("Marking {} as untouched", abs.display());
            self.untouched.insert(cache_key(&abs));
        }
    }

    /// The rule's persistent storage under `key`, kept between invocations
    /// in the rule's cache sub-map.
    pub fn rule_cache(&mut self, key: &str) -> &mut BlobMap {
        &mut self.cache.entry(key.to_string()).or_default().extra
    }

    /// The owning scope's persistent module-private storage under `key`.
    pub fn scope_cache<R>(&self, key: &str, f: impl FnOnce(&mut BlobMap) -> R) -> Option<R> {
        self.emk().scope_cache(key, f)
    }

    /// Defer `func` until after this rule's body returns.
    pub fn do_later<F>(&mut self, func: F)
    where
        F: FnOnce(&Emk<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.deferred.push(Box::new(func));
    }
}
