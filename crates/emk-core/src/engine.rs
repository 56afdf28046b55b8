//! The build engine
//!
//! One [`Engine`] owns all build state behind a single mutex: the rule
//! graph, the scope tree, visited directories, and the pending tables. A
//! run proceeds in phases: run prebuild functions, reconcile the graph
//! (aliases, late dependencies, attachments), examine the wanted targets,
//! execute ready rules on the worker pool, run postbuild functions, and
//! recurse into newly requested directories. Phases repeat while new work
//! keeps appearing; caches are written out at the end even when the build
//! failed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::api::{DeferredFn, Emk, RuleContext, cache_key};
use crate::cache::{Change, DirCache, FileStamp, RuleCache, cache_file_name, rule_key};
use crate::clean::CleanModule;
use crate::error::{BuildError, ErrorKind, Result, anyhow_info, rule_origin_info};
use crate::exec::{RuleQueue, Task};
use crate::graph::{Graph, RuleId, RuleSpec, TargetId};
use crate::loader::{ConfigSource, find_project_dir};
use crate::module::{Module, ModuleBinding, ModuleHandle, ModuleRegistry};
use crate::paths::{self, DepPath, PathContext};
use crate::scope::{ScopeId, ScopeKind, Scopes};
use crate::trace;

/// Engine-wide configuration, normally derived from the command line.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker thread count.
    pub threads: usize,
    /// Cleaning mode: caches are neither read nor written, and build
    /// directories are not created.
    pub cleaning: bool,
    /// Developer mode (verbose internal reporting).
    pub emk_dev: bool,
    /// Explicit targets from the command line.
    pub explicit_targets: Vec<String>,
    /// The full option map, recognized options included.
    pub options: BTreeMap<String, String>,
    /// Paths to run the dependency tracer on after a successful build.
    pub trace: Vec<String>,
    /// Whether the tracer shows up-to-date subtrees.
    pub trace_unchanged: bool,
    /// Directories searched for the global configuration.
    pub config_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            cleaning: false,
            emk_dev: false,
            explicit_targets: Vec::new(),
            options: BTreeMap::new(),
            trace: Vec::new(),
            trace_unchanged: false,
            config_dirs: Vec::new(),
        }
    }
}

/// All mutable engine state, behind the engine mutex.
pub(crate) struct State {
    pub(crate) graph: Graph,
    pub(crate) scopes: Scopes,
    pub(crate) building: bool,
    pub(crate) did_run: bool,
    pub(crate) explicit_targets_raw: Vec<String>,
    pub(crate) explicit_targets: HashSet<PathBuf>,
    pub(crate) explicit_fixed: bool,
    pub(crate) prebuild: Vec<(ScopeId, DeferredFn)>,
    pub(crate) postbuild: Vec<(ScopeId, DeferredFn)>,
    pub(crate) visited_dirs: HashMap<PathBuf, ScopeId>,
    pub(crate) visit_order: Vec<PathBuf>,
    pub(crate) stored_subproj_scopes: HashMap<PathBuf, ScopeId>,
    pub(crate) known_build_dirs: HashMap<PathBuf, String>,
    pub(crate) toplevel_examined: BTreeSet<TargetId>,
    pub(crate) added_rule: bool,
    pub(crate) done_build: bool,
    pub(crate) need_undefined_rule: bool,
    pub(crate) bad_rules: Vec<RuleId>,
    pub(crate) traced: Vec<PathBuf>,
    pub(crate) cache_io: Duration,
}

impl State {
    fn new() -> Self {
        Self {
            graph: Graph::default(),
            scopes: Scopes::new(PathBuf::new(), PathBuf::new()),
            building: false,
            did_run: false,
            explicit_targets_raw: Vec::new(),
            explicit_targets: HashSet::new(),
            explicit_fixed: false,
            prebuild: Vec::new(),
            postbuild: Vec::new(),
            visited_dirs: HashMap::new(),
            visit_order: Vec::new(),
            stored_subproj_scopes: HashMap::new(),
            known_build_dirs: HashMap::new(),
            toplevel_examined: BTreeSet::new(),
            added_rule: false,
            done_build: false,
            need_undefined_rule: false,
            bad_rules: Vec::new(),
            traced: Vec::new(),
            cache_io: Duration::ZERO,
        }
    }
}

/// The engine internals shared between the coordinator, the API handles,
/// and the worker threads.
pub(crate) struct EngineShared {
    pub(crate) state: Mutex<State>,
    pub(crate) source: Arc<dyn ConfigSource>,
    pub(crate) registry: ModuleRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) interrupted: AtomicBool,
    pub(crate) queue: Mutex<Option<Arc<RuleQueue>>>,
}

impl EngineShared {
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    fn emk(&self, scope: ScopeId) -> Emk<'_> {
        Emk {
            engine: self,
            scope,
        }
    }
}

/// The build engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine over a configuration source and module registry.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn ConfigSource>,
        registry: ModuleRegistry,
    ) -> Self {
        let threads = config.threads.max(1);
        let mut config = config;
        config.threads = threads;
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(State::new()),
                source,
                registry,
                config,
                interrupted: AtomicBool::new(false),
                queue: Mutex::new(None),
            }),
        }
    }

    /// Interrupt the build: the executor enters its errored state, waits
    /// for in-flight rules, and the run fails with an interrupt error.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::SeqCst);
        let queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(queue) = queue {
            queue.error(BuildError::new(ErrorKind::Interrupted, "Interrupted"));
        }
    }

    /// Execute the build process rooted at `start`.
    pub fn run(&self, start: &Path) -> Result<()> {
        let shared = &*self.shared;
        shared.with_state(|st| {
            if st.did_run {
                return Err(BuildError::new(
                    ErrorKind::ConfigurationFailure,
                    "Cannot call run() again",
                ));
            }
            st.did_run = true;
            Ok(())
        })?;

        let root = paths::canonical_path(start);
        let proj_dir = find_project_dir(&root, &*shared.source);
        shared.with_state(|st| {
            st.explicit_targets_raw = shared.config.explicit_targets.clone();
            let scope = st.scopes.get_mut(ScopeId::ROOT);
            scope.dir = root.clone();
            scope.proj_dir = proj_dir;
        });

        tracing::info!(
            "Using {} {}",
            shared.config.threads,
            if shared.config.threads == 1 {
                "thread"
            } else {
                "threads"
            }
        );

        // The clean module is always present: inserted at the root and
        // prepended to the pre-module list so every rules scope gets a
        // `clean` target.
        shared
            .emk(ScopeId::ROOT)
            .insert_module("clean", Box::new(CleanModule::default()))?;
        shared.with_state(|st| {
            st.scopes
                .get_mut(ScopeId::ROOT)
                .pre_modules
                .insert(0, "clean".to_string());
        });

        let start_time = Instant::now();
        let result = self.run_inner(&root, start_time);
        let write_result = self.write_caches();

        let result = result.and(write_result);
        match result {
            Ok(()) => {
                self.render_traces();
                shared.with_state(|st| {
                    if !shared.config.cleaning {
                        tracing::info!(
                            "Load/store caches: {:.3} seconds",
                            st.cache_io.as_secs_f64()
                        );
                    }
                });
                tracing::info!("Finished in {:.3} seconds", start_time.elapsed().as_secs_f64());
                Ok(())
            }
            Err(mut err) => {
                self.attach_bad_rules(&mut err);
                Err(err)
            }
        }
    }

    fn run_inner(&self, root: &Path, start_time: Instant) -> Result<()> {
        let shared = &*self.shared;

        self.load_global_config()?;
        self.handle_dir(root, true)?;

        let mut phase = 1u32;
        let mut phase_start = start_time;
        loop {
            let go = shared.with_state(|st| {
                (st.graph.have_unbuilt(&st.toplevel_examined) || !st.explicit_targets.is_empty())
                    && (st.added_rule || !st.prebuild.is_empty() || !st.postbuild.is_empty())
                    || !st.graph.must_build.is_empty()
                    || (!st.done_build
                        && (!st.graph.auto_targets.is_empty()
                            || !st.prebuild.is_empty()
                            || !st.postbuild.is_empty()))
            });
            if !go {
                break;
            }

            self.run_prebuild_funcs()?;
            self.reconcile()?;
            self.do_build()?;
            shared.with_state(|st| st.graph.must_build.clear());
            self.run_postbuild_funcs()?;

            let now = Instant::now();
            tracing::info!(
                "Build phase {phase}: {:.3} seconds",
                now.duration_since(phase_start).as_secs_f64()
            );
            phase_start = now;
            phase += 1;

            // Recurse into directories requested during the phase.
            loop {
                let pending: Vec<PathBuf> = shared.with_state(|st| {
                    let mut dirs = Vec::new();
                    for id in st.scopes.ids().collect::<Vec<_>>() {
                        let scope = st.scopes.get_mut(id);
                        if !scope.recurse_dirs.is_empty() {
                            dirs.extend(std::mem::take(&mut scope.recurse_dirs));
                        }
                    }
                    dirs
                });
                if pending.is_empty() {
                    break;
                }
                for dir in pending {
                    self.handle_dir(&dir, false)?;
                }
            }
        }

        // Anything examined but unbuilt is an error; so are explicit
        // targets that never matched a rule, a file, or an alias.
        let unbuilt_lines = shared.with_state(|st| {
            let unbuilt: BTreeSet<TargetId> = st
                .graph
                .live_targets()
                .filter(|id| {
                    let t = st.graph.target(*id);
                    t.visited && !t.built
                })
                .collect();
            let mut lines = Vec::new();
            for id in &unbuilt {
                let target = st.graph.target(*id);
                match target.rule {
                    Some(rid) => {
                        let rule = st.graph.rule(rid);
                        let deps: Vec<String> = rule
                            .required
                            .iter()
                            .filter(|(dep, weak)| {
                                let d = st.graph.target(*dep);
                                (d.rule.is_some() || !weak) && unbuilt.contains(dep)
                            })
                            .map(|(dep, _)| st.graph.target(*dep).path.display_string())
                            .collect();
                        lines.push(format!(
                            "{} depends on unbuilt {:?}",
                            target.path.display_string(),
                            deps
                        ));
                    }
                    None => lines.push(format!(
                        "No rule produces {}, and it does not exist",
                        target.path.display_string()
                    )),
                }
            }
            lines
        });
        if !unbuilt_lines.is_empty() {
            return Err(BuildError::with_info(
                ErrorKind::UnbuildableTargets,
                "Some targets could not be built",
                unbuilt_lines,
            ));
        }

        let leftover = shared.with_state(|st| {
            st.explicit_targets
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        });
        if !leftover.is_empty() {
            return Err(BuildError::with_info(
                ErrorKind::UnknownExplicitTarget,
                "No rule creates these explicitly specified targets",
                leftover,
            ));
        }

        Ok(())
    }

    /// Load the optional global configuration from the first config dir
    /// that has one.
    fn load_global_config(&self) -> Result<()> {
        let shared = &*self.shared;
        for dir in &shared.config.config_dirs {
            if !shared.source.probe(dir, ScopeKind::Global) {
                continue;
            }
            let emk = shared.emk(ScopeId::ROOT);
            shared
                .source
                .load(&emk, dir, ScopeKind::Global)
                .map_err(|err| {
                    BuildError::with_info(
                        ErrorKind::ConfigurationFailure,
                        format!("Error loading global config from {}", dir.display()),
                        anyhow_info(&err),
                    )
                })?;
            self.run_module_post_functions(ScopeId::ROOT)?;
            self.run_do_later(ScopeId::ROOT)?;
            break;
        }
        Ok(())
    }

    /// Visit a directory: establish its parent scopes, load its rules
    /// description (or default modules), record its build dir, and recurse.
    fn handle_dir(&self, dir: &Path, first_dir: bool) -> Result<()> {
        let shared = &*self.shared;
        let path = paths::canonical_path(dir);

        let already = shared.with_state(|st| st.visited_dirs.contains_key(&path));
        if already {
            return Ok(());
        }
        if !path.is_dir() {
            tracing::warn!("Failed to enter directory {}", path.display());
            return Ok(());
        }
        tracing::info!("Entering directory {}", path.display());

        let (parent, proj_dir) = self.load_parent_scope(&path)?;
        let rules_scope =
            shared.with_state(|st| st.scopes.push_child(parent, ScopeKind::Rules, &path, &proj_dir));
        let emk = shared.emk(rules_scope);

        // Pre-modules, then the rules description (or the default modules
        // when there is none), then every module's post hook.
        for name in emk.pre_modules() {
            emk.module(&name)?;
        }
        if shared.source.probe(&path, ScopeKind::Rules) {
            shared
                .source
                .load(&emk, &path, ScopeKind::Rules)
                .map_err(|err| {
                    BuildError::with_info(
                        ErrorKind::ConfigurationFailure,
                        format!("Error loading build rules in {}", path.display()),
                        anyhow_info(&err),
                    )
                })?;
        } else {
            for name in emk.default_modules() {
                emk.module(&name)?;
            }
        }
        self.run_do_later(rules_scope)?;
        self.run_module_post_functions(rules_scope)?;
        self.run_do_later(rules_scope)?;

        let recurse_dirs = shared.with_state(|st| -> Result<BTreeSet<PathBuf>> {
            let scope = st.scopes.get(rules_scope);
            let build_dir = scope.build_dir.clone();
            let abs_build_dir = scope.path_context().abs_build_dir();
            st.known_build_dirs.insert(path.clone(), build_dir);

            let io_start = Instant::now();
            if shared.config.cleaning {
                st.scopes.get_mut(rules_scope).cache = Some(DirCache::default());
            } else {
                std::fs::create_dir_all(&abs_build_dir).map_err(|err| {
                    BuildError::new(
                        ErrorKind::ConfigurationFailure,
                        format!(
                            "Could not create build directory {}: {err}",
                            abs_build_dir.display()
                        ),
                    )
                })?;
                let cache_path = abs_build_dir.join(cache_file_name(&path));
                st.scopes.get_mut(rules_scope).cache = Some(DirCache::load(&cache_path));
            }
            st.cache_io += io_start.elapsed();

            if first_dir {
                let ctx = st.scopes.get(rules_scope).path_context();
                let fixed: HashSet<PathBuf> = st
                    .explicit_targets_raw
                    .iter()
                    .map(|t| paths::target_abspath(t, &ctx))
                    .collect();
                st.explicit_targets = fixed;
                st.explicit_fixed = true;
            }

            st.visited_dirs.insert(path.clone(), rules_scope);
            st.visit_order.push(path.clone());
            Ok(std::mem::take(
                &mut st.scopes.get_mut(rules_scope).recurse_dirs,
            ))
        })?;

        for d in recurse_dirs {
            self.handle_dir(&d, false)?;
        }
        Ok(())
    }

    /// Walk up from `path` to find (and create, at most once per process)
    /// its project and subproject scopes.
    fn load_parent_scope(&self, path: &Path) -> Result<(ScopeId, PathBuf)> {
        let shared = &*self.shared;

        let mut parent = ScopeId::ROOT;
        let mut proj_dir: Option<PathBuf> = None;
        let mut walked: Vec<(PathBuf, bool)> = Vec::new();

        let mut d = path.to_path_buf();
        loop {
            if let Some(stored) =
                shared.with_state(|st| st.stored_subproj_scopes.get(&d).copied())
            {
                parent = stored;
                break;
            }
            walked.push((d.clone(), shared.source.probe(&d, ScopeKind::Subproject)));
            if shared.source.probe(&d, ScopeKind::Project) {
                proj_dir = Some(d.clone());
                break;
            }
            match d.parent() {
                Some(p) if p != d => d = p.to_path_buf(),
                _ => break,
            }
        }

        let proj_dir = match proj_dir {
            Some(pd) => {
                let scope = shared.with_state(|st| {
                    st.scopes
                        .push_child(ScopeId::ROOT, ScopeKind::Project, &pd, &pd)
                });
                self.load_described_scope(scope, &pd, ScopeKind::Project)?;
                parent = scope;
                pd
            }
            None => shared.with_state(|st| st.scopes.get(parent).proj_dir.clone()),
        };

        for (d, has_subproj) in walked.into_iter().rev() {
            if has_subproj {
                let scope = shared.with_state(|st| {
                    st.scopes
                        .push_child(parent, ScopeKind::Subproject, &d, &proj_dir)
                });
                self.load_described_scope(scope, &d, ScopeKind::Subproject)?;
                shared.with_state(|st| st.stored_subproj_scopes.insert(d, scope));
                parent = scope;
            } else {
                shared.with_state(|st| st.stored_subproj_scopes.insert(d, parent));
            }
        }

        Ok((parent, proj_dir))
    }

    /// Load a project or subproject description into a fresh scope.
    fn load_described_scope(&self, scope: ScopeId, dir: &Path, kind: ScopeKind) -> Result<()> {
        let shared = &*self.shared;
        let emk = shared.emk(scope);
        shared.source.load(&emk, dir, kind).map_err(|err| {
            BuildError::with_info(
                ErrorKind::ConfigurationFailure,
                format!("Error loading {kind} description in {}", dir.display()),
                anyhow_info(&err),
            )
        })?;
        self.run_module_post_functions(scope)?;
        self.run_do_later(scope)
    }

    /// Run every strong module's `post` hook for a scope.
    fn run_module_post_functions(&self, scope: ScopeId) -> Result<()> {
        let shared = &*self.shared;
        let (kind, bindings) = shared.with_state(|st| {
            let s = st.scopes.get(scope);
            (s.kind, s.modules.values().cloned().collect::<Vec<_>>())
        });
        let emk = shared.emk(scope);
        for binding in bindings {
            let result = binding
                .handle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .post(&emk, kind);
            result.map_err(|err| {
                BuildError::with_info(
                    ErrorKind::ConfigurationFailure,
                    format!("Error running {}.post_{kind}()", binding.name),
                    anyhow_info(&err),
                )
            })?;
        }
        Ok(())
    }

    /// Run a scope's deferred functions to a fixed point.
    fn run_do_later(&self, scope: ScopeId) -> Result<()> {
        let shared = &*self.shared;
        loop {
            let funcs =
                shared.with_state(|st| std::mem::take(&mut st.scopes.get_mut(scope).do_later));
            if funcs.is_empty() {
                return Ok(());
            }
            let emk = shared.emk(scope);
            let dir = shared.with_state(|st| st.scopes.get(scope).dir.clone());
            for f in funcs {
                f(&emk).map_err(|err| {
                    BuildError::with_info(
                        ErrorKind::ConfigurationFailure,
                        format!("Error running do_later function (in {})", dir.display()),
                        anyhow_info(&err),
                    )
                })?;
            }
        }
    }

    /// Run pending prebuild functions (which may add more, and may recurse
    /// into new directories).
    fn run_prebuild_funcs(&self) -> Result<()> {
        let shared = &*self.shared;
        loop {
            let funcs = shared.with_state(|st| std::mem::take(&mut st.prebuild));
            if funcs.is_empty() {
                return Ok(());
            }
            for (scope, f) in funcs {
                let emk = shared.emk(scope);
                let dir = shared.with_state(|st| st.scopes.get(scope).dir.clone());
                f(&emk).map_err(|err| {
                    BuildError::with_info(
                        ErrorKind::ConfigurationFailure,
                        format!("Error running prebuild function (in {})", dir.display()),
                        anyhow_info(&err),
                    )
                })?;
                self.run_do_later(scope)?;

                let recurse =
                    shared.with_state(|st| {
                        std::mem::take(&mut st.scopes.get_mut(scope).recurse_dirs)
                    });
                for d in recurse {
                    self.handle_dir(&d, false)?;
                }
            }
        }
    }

    /// Run pending postbuild functions (one batch).
    fn run_postbuild_funcs(&self) -> Result<()> {
        let shared = &*self.shared;
        let funcs = shared.with_state(|st| std::mem::take(&mut st.postbuild));
        for (scope, f) in funcs {
            let emk = shared.emk(scope);
            let dir = shared.with_state(|st| st.scopes.get(scope).dir.clone());
            f(&emk).map_err(|err| {
                BuildError::with_info(
                    ErrorKind::ConfigurationFailure,
                    format!("Error running postbuild function (in {})", dir.display()),
                    anyhow_info(&err),
                )
            })?;
            self.run_do_later(scope)?;
        }
        Ok(())
    }

    /// Inter-phase reconciliation: aliases, late dependencies, attachments,
    /// autobuilds, requires-rule, rebuild-if-changed.
    fn reconcile(&self) -> Result<()> {
        self.shared.with_state(|st| {
            st.graph.remove_artificial_targets();
            st.graph.fix_aliases();
            fix_depends(st)?;
            fix_weak_depends(st)?;
            for rule in st.graph.rule_ids().collect::<Vec<_>>() {
                fix_requires(st, rule)?;
            }
            fix_attached(st)?;
            fix_auto_targets(st);
            fix_requires_rule(st)?;
            fix_rebuild_if_changed(st);
            st.added_rule = false;
            Ok(())
        })
    }

    /// One executor pass: examine wanted targets, then run ready rules to
    /// completion on the worker pool.
    fn do_build(&self) -> Result<()> {
        let shared = &*self.shared;
        let queue = Arc::new(RuleQueue::new(shared.config.threads));
        *shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(queue.clone());
        if shared.interrupted.load(Ordering::SeqCst) {
            queue.error(BuildError::new(ErrorKind::Interrupted, "Interrupted"));
        }

        shared.with_state(|st| {
            st.building = true;

            // Unbuilt targets are re-examined from scratch each phase.
            for id in st.graph.live_targets().collect::<Vec<_>>() {
                let target = st.graph.target(id);
                if !target.built {
                    let rule = target.rule;
                    st.graph.target_mut(id).visited = false;
                    if let Some(rid) = rule {
                        st.graph.rule_mut(rid).want_build = false;
                    }
                }
            }
            st.need_undefined_rule = false;

            let previously_examined: Vec<TargetId> = st.toplevel_examined.iter().copied().collect();
            for id in previously_examined {
                if !st.graph.target(id).built {
                    examine_target(st, &queue, id, false);
                }
            }
            for id in std::mem::take(&mut st.graph.must_build) {
                toplevel_examine(st, &queue, id);
            }

            if !st.done_build {
                let mut leftover: HashSet<PathBuf> = HashSet::new();
                let explicit: Vec<PathBuf> = st.explicit_targets.iter().cloned().collect();
                let had_explicit = !explicit.is_empty();
                for path in explicit {
                    match st.graph.lookup(&DepPath::Path(path.clone())) {
                        Some(id) => toplevel_examine(st, &queue, id),
                        None => {
                            leftover.insert(path);
                        }
                    }
                }
                if !had_explicit || !leftover.is_empty() || st.need_undefined_rule {
                    for id in st.graph.fixed_auto_targets.clone() {
                        toplevel_examine(st, &queue, id);
                    }
                }
                if had_explicit && leftover.is_empty() {
                    st.done_build = true;
                }
                st.explicit_targets = leftover;
            }
        });

        let threads = shared.config.threads;
        std::thread::scope(|scope| {
            scope.spawn(|| build_thread(shared, &queue, true));
            for _ in 1..threads {
                scope.spawn(|| build_thread(shared, &queue, false));
            }
            queue.join();
            queue.stop();
        });

        *shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        shared.with_state(|st| st.building = false);

        let mut errors = queue.take_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            let mut first = errors.remove(0);
            for other in errors {
                first.push_info(String::new());
                first.push_info(other.message().to_string());
                for line in other.extra_info() {
                    first.push_info(line.clone());
                }
            }
            Err(first)
        }
    }

    /// Serialize every visited directory's cache (skipped when cleaning).
    fn write_caches(&self) -> Result<()> {
        let shared = &*self.shared;
        if shared.config.cleaning {
            return Ok(());
        }
        shared.with_state(|st| {
            let io_start = Instant::now();
            for dir in st.visit_order.clone() {
                let Some(&scope_id) = st.visited_dirs.get(&dir) else {
                    continue;
                };
                let scope = st.scopes.get(scope_id);
                let Some(cache) = scope.cache.clone() else {
                    continue;
                };
                let cache_path = scope
                    .path_context()
                    .abs_build_dir()
                    .join(cache_file_name(&dir));
                if let Err(err) = cache.store(&cache_path) {
                    tracing::error!("Failed to write cache file {}: {err}", cache_path.display());
                }
            }
            st.cache_io += io_start.elapsed();
        });
        Ok(())
    }

    /// Append the partial-execution report to a build error.
    fn attach_bad_rules(&self, err: &mut BuildError) {
        let lines = self.shared.with_state(|st| {
            let mut lines = Vec::new();
            for &rid in &st.bad_rules {
                let rule = st.graph.rule(rid);
                lines.push("A rule may have been partially executed.".to_string());
                lines.extend(rule_origin_info(&rule.spec.origin));
            }
            if !lines.is_empty() {
                lines.push("You should clean before rebuilding.".to_string());
            }
            lines
        });
        for line in lines {
            err.push_info(line);
        }
    }

    /// Render the dependency tracer for requested paths.
    fn render_traces(&self) {
        let shared = &*self.shared;
        shared.with_state(|st| {
            let ctx = st.scopes.get(ScopeId::ROOT).path_context();
            let mut paths: Vec<PathBuf> = shared
                .config
                .trace
                .iter()
                .map(|t| paths::target_abspath(t, &ctx))
                .collect();
            paths.extend(st.traced.clone());
            for path in paths {
                for line in trace::trace_lines(st, &path, shared.config.trace_unchanged) {
                    tracing::info!("{line}");
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Module loading

/// Look up (or create) a module binding for a scope. Mirrors the scope
/// hierarchy: an existing binding wins, then a parent instance spawns a
/// child, then the registry provides a fresh instance.
pub(crate) fn load_module(
    shared: &EngineShared,
    scope: ScopeId,
    name: &str,
    weak: bool,
) -> Result<Option<ModuleHandle>> {
    enum Found {
        Bound(ModuleHandle),
        Building,
        Parent(ModuleBinding),
        Registry,
    }

    let (kind, found) = shared.with_state(|st| {
        let s = st.scopes.get_mut(scope);
        let kind = s.kind;
        if let Some(binding) = s.modules.get(name) {
            return (kind, Found::Bound(binding.handle.clone()));
        }
        if let Some(binding) = s.weak_modules.get(name).cloned() {
            if !weak {
                s.modules.insert(name.to_string(), binding.clone());
            }
            return (kind, Found::Bound(binding.handle));
        }
        if st.building {
            return (kind, Found::Building);
        }
        let scope_parent = st.scopes.get(scope).parent;
        let mut cur = scope_parent;
        while let Some(id) = cur {
            let p = st.scopes.get(id);
            if let Some(binding) = p.modules.get(name).or_else(|| p.weak_modules.get(name)) {
                return (kind, Found::Parent(binding.clone()));
            }
            cur = p.parent;
        }
        (kind, Found::Registry)
    });

    let binding = match found {
        Found::Bound(handle) => return Ok(Some(handle)),
        Found::Building => {
            return Err(BuildError::new(
                ErrorKind::ConfigurationFailure,
                "Cannot load a new module when building",
            ));
        }
        Found::Parent(parent) => {
            let spawned = parent
                .handle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .new_scope(kind);
            parent.spawn_child(spawned)
        }
        Found::Registry => match shared.registry.get(name) {
            Some(factory) => ModuleBinding::new(name, factory(kind)),
            None => {
                tracing::info!("Module {name} not found");
                return Ok(None);
            }
        },
    };

    run_load_hook(shared, scope, &binding, kind)?;
    shared.with_state(|st| {
        let s = st.scopes.get_mut(scope);
        if weak {
            s.weak_modules.insert(name.to_string(), binding.clone());
        } else {
            s.modules.insert(name.to_string(), binding.clone());
        }
    });
    Ok(Some(binding.handle))
}

/// Bind a pre-built instance (weakly) into a scope.
pub(crate) fn insert_module(
    shared: &EngineShared,
    scope: ScopeId,
    name: &str,
    instance: Box<dyn Module>,
) -> Result<Option<ModuleHandle>> {
    let (kind, occupied, building) = shared.with_state(|st| {
        let s = st.scopes.get(scope);
        (
            s.kind,
            s.modules.contains_key(name) || s.weak_modules.contains_key(name),
            st.building,
        )
    });
    if building {
        return Err(BuildError::new(
            ErrorKind::ConfigurationFailure,
            "Cannot call insert_module() when building",
        ));
    }
    if occupied {
        tracing::warn!("Cannot insert over pre-existing '{name}' module");
        return Ok(None);
    }
    let binding = ModuleBinding::new(name, instance);
    run_load_hook(shared, scope, &binding, kind)?;
    shared.with_state(|st| {
        st.scopes
            .get_mut(scope)
            .weak_modules
            .insert(name.to_string(), binding.clone());
    });
    Ok(Some(binding.handle))
}

fn run_load_hook(
    shared: &EngineShared,
    scope: ScopeId,
    binding: &ModuleBinding,
    kind: ScopeKind,
) -> Result<()> {
    let emk = Emk {
        engine: shared,
        scope,
    };
    binding
        .handle
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .load(&emk, kind)
        .map_err(|err| {
            BuildError::with_info(
                ErrorKind::ConfigurationFailure,
                format!("Error running {}.load_{kind}()", binding.name),
                anyhow_info(&err),
            )
        })
}

// ---------------------------------------------------------------------------
// Reconciliation helpers (run under the engine lock)

fn fix_depends(st: &mut State) -> Result<()> {
    let pending = std::mem::take(&mut st.graph.secondary_pending);
    let mut leftovers = HashMap::new();
    for (path, deps) in pending {
        let target = st.graph.lookup(&DepPath::Path(path.clone()));
        let rule = target.and_then(|id| st.graph.target(id).rule);
        match (target, rule) {
            (Some(id), Some(rid)) => {
                if st.graph.target(id).built {
                    return Err(BuildError::new(
                        ErrorKind::ConfigurationFailure,
                        format!(
                            "Cannot add secondary dependencies to '{}' since it has already been built",
                            path.display()
                        ),
                    ));
                }
                let fixed = paths::resolve_build_dirs(deps, &st.known_build_dirs)?;
                st.graph.rule_mut(rid).secondary.extend(fixed);
            }
            _ => {
                tracing::debug!(
                    "Target {} had secondary dependencies, but there is no rule for it yet",
                    path.display()
                );
                leftovers.insert(path, deps);
            }
        }
    }
    st.graph.secondary_pending = leftovers;
    Ok(())
}

fn fix_weak_depends(st: &mut State) -> Result<()> {
    let pending = std::mem::take(&mut st.graph.weak_pending);
    let mut leftovers = HashMap::new();
    for (path, deps) in pending {
        let target = st.graph.lookup(&DepPath::Path(path.clone()));
        let rule = target.and_then(|id| st.graph.target(id).rule);
        match (target, rule) {
            (Some(id), Some(rid)) => {
                if st.graph.target(id).built {
                    tracing::warn!(
                        "Cannot add weak dependencies to '{}' since it has already been built",
                        path.display()
                    );
                    continue;
                }
                let fixed = paths::resolve_build_dirs(deps, &st.known_build_dirs)?;
                st.graph.rule_mut(rid).weak.extend(fixed);
            }
            _ => {
                tracing::debug!(
                    "Target {} had weak dependencies, but there is no rule for it yet",
                    path.display()
                );
                leftovers.insert(path, deps);
            }
        }
    }
    st.graph.weak_pending = leftovers;
    Ok(())
}

/// Recompute one rule's requirement list: primary ∪ secondary form the hard
/// set, weak-only paths keep their tolerance, and every requirement gets a
/// back-edge for readiness propagation.
fn fix_requires(st: &mut State, rid: RuleId) -> Result<()> {
    if st.graph.rule(rid).built {
        return Ok(());
    }

    let requires = st.graph.rule(rid).requires.clone();
    let fixed_requires = paths::resolve_build_dirs(requires, &st.known_build_dirs)?;
    let secondary = paths::resolve_build_dirs(
        st.graph.rule(rid).secondary.iter().cloned(),
        &st.known_build_dirs,
    )?;
    let weak = paths::resolve_build_dirs(
        st.graph.rule(rid).weak.iter().cloned(),
        &st.known_build_dirs,
    )?;

    let mut hard: BTreeSet<DepPath> = fixed_requires.iter().cloned().collect();
    hard.extend(secondary);
    let weak_only: BTreeSet<DepPath> = weak.into_iter().filter(|d| !hard.contains(d)).collect();

    let mut required = Vec::with_capacity(hard.len() + weak_only.len());
    for dep in hard {
        let id = st.graph.get_or_create(dep);
        st.graph.target_mut(id).required_by.insert(rid);
        required.push((id, false));
    }
    for dep in weak_only {
        let id = st.graph.get_or_create(dep);
        // A weak dependency only orders against a rule that produces it.
        if st.graph.target(id).rule.is_some() {
            st.graph.target_mut(id).required_by.insert(rid);
        }
        required.push((id, true));
    }

    let rule = st.graph.rule_mut(rid);
    rule.requires = fixed_requires;
    rule.required = required;
    Ok(())
}

fn fix_attached(st: &mut State) -> Result<()> {
    let pending: Vec<(PathBuf, Vec<DepPath>)> = st
        .graph
        .attached_pending
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (path, attached) in pending {
        match st.graph.lookup(&DepPath::Path(path.clone())) {
            Some(id) => {
                let fixed = paths::resolve_build_dirs(attached, &st.known_build_dirs)?;
                let was_built = st.graph.target(id).built;
                st.graph.target_mut(id).attached.extend(fixed.iter().cloned());
                if was_built {
                    // Attached after the anchor was built: force the
                    // attachment into the next phase.
                    for dep in fixed {
                        let a = st.graph.get_or_create(dep);
                        if !st.graph.target(a).built {
                            st.graph.must_build.push(a);
                        }
                    }
                }
            }
            None => tracing::debug!(
                "Target {} was attached to, but not yet defined as a product of a rule",
                path.display()
            ),
        }
    }
    Ok(())
}

fn fix_auto_targets(st: &mut State) {
    let mut paths: Vec<PathBuf> = std::mem::take(&mut st.graph.auto_targets)
        .into_iter()
        .collect();
    paths.sort();
    st.graph.fixed_auto_targets = paths
        .into_iter()
        .map(|p| st.graph.get_or_create(DepPath::Path(p)))
        .collect();
}

fn fix_requires_rule(st: &mut State) -> Result<()> {
    let fixed = paths::resolve_build_dirs(
        std::mem::take(&mut st.graph.requires_rule),
        &st.known_build_dirs,
    )?;
    st.graph.requires_rule = fixed.into_iter().collect();
    Ok(())
}

fn fix_rebuild_if_changed(st: &mut State) {
    let paths: Vec<PathBuf> = st.graph.rebuild_if_changed.iter().cloned().collect();
    for path in paths {
        if let Some(id) = st.graph.lookup(&DepPath::Path(path)) {
            st.graph.target_mut(id).rebuild_if_changed = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Examination (run under the engine lock, before workers start)

fn toplevel_examine(st: &mut State, queue: &RuleQueue, id: TargetId) {
    if st.toplevel_examined.insert(id) {
        examine_target(st, queue, id, false);
    }
}

/// Examine a target: decide whether it is already satisfied, and otherwise
/// mark its rule wanted and count unbuilt hard requirements. Rules with no
/// unbuilt requirements are pushed to the executor immediately.
fn examine_target(st: &mut State, queue: &RuleQueue, id: TargetId, weak: bool) {
    {
        let t = st.graph.target(id);
        if t.visited || t.built {
            return;
        }
    }
    st.graph.target_mut(id).visited = true;
    tracing::debug!(
        "Examining target {}",
        st.graph.target(id).path.display_string()
    );

    for dep in st.graph.target(id).attached.clone() {
        let attached = st.graph.get_or_create(dep);
        examine_target(st, queue, attached, false);
    }

    let rule = st.graph.target(id).rule;
    match rule {
        None => {
            let path = st.graph.target(id).path.clone();
            match &path {
                DepPath::Always => st.graph.target_mut(id).built = true,
                DepPath::Path(p) => {
                    if st.graph.requires_rule.contains(&path) {
                        st.need_undefined_rule = true;
                    } else if p.exists() {
                        st.graph.target_mut(id).built = true;
                    } else if weak {
                        tracing::debug!(
                            "Allowing weak dependency {} to not exist",
                            p.display()
                        );
                        st.graph.target_mut(id).built = true;
                    } else {
                        st.need_undefined_rule = true;
                    }
                }
            }
        }
        Some(rid) => {
            if st.graph.rule(rid).key.is_none() {
                setup_rule_cache(st, rid);
            }
            if !st.graph.rule(rid).want_build {
                st.graph.rule_mut(rid).want_build = true;
                let mut remaining = 0usize;
                for (req, is_weak) in st.graph.rule(rid).required.clone() {
                    examine_target(st, queue, req, is_weak);
                    let rt = st.graph.target(req);
                    if (rt.rule.is_some() || !is_weak) && !rt.built {
                        remaining += 1;
                    }
                }
                let rule = st.graph.rule(rid);
                rule.spec
                    .remaining_unbuilt
                    .store(remaining, Ordering::SeqCst);
                if remaining == 0 {
                    queue.put(rid, rule.spec.cwd_safe);
                }
            }
        }
    }
}

/// Assign the rule's identity key and make sure its cache sub-map exists.
fn setup_rule_cache(st: &mut State, rid: RuleId) {
    let product_paths: Vec<PathBuf> = st
        .graph
        .rule(rid)
        .produces
        .iter()
        .filter_map(|id| st.graph.target(*id).path.as_path().map(Path::to_path_buf))
        .collect();
    let key = rule_key(&product_paths);
    let scope = st.graph.rule(rid).spec.scope;
    if let Some(cache) = st.scopes.get_mut(scope).cache.as_mut() {
        cache.rules.entry(key.clone()).or_default();
    }
    st.graph.rule_mut(rid).key = Some(key);
}

// ---------------------------------------------------------------------------
// Execution (worker threads)

struct ProductInfo {
    target: TargetId,
    path: PathBuf,
    rebuild_if_changed: bool,
}

struct ReqInfo {
    dep: DepPath,
    weak: bool,
    virtual_mtime: Option<FileStamp>,
}

struct ExecWork {
    rid: RuleId,
    spec: Arc<RuleSpec>,
    key: String,
    cache: RuleCache,
    products: Vec<ProductInfo>,
    reqs: Vec<ReqInfo>,
    requires: Vec<DepPath>,
    path_ctx: PathContext,
}

/// Worker main loop: take ready rules off the queue and run them. A failing
/// rule records its error and terminates this worker; the queue's errored
/// state stops the rest.
pub(crate) fn build_thread(shared: &EngineShared, queue: &RuleQueue, special: bool) {
    loop {
        let rid = match queue.get(special) {
            Task::Stop => return,
            Task::Run(rid) => rid,
        };
        let work = shared.with_state(|st| prepare_work(st, rid));
        match execute_rule(shared, queue, work) {
            Ok(()) => queue.done_task(),
            Err(err) => {
                queue.error(err);
                return;
            }
        }
    }
}

/// Snapshot everything the worker needs and take the rule's cache sub-map
/// out of engine state for the duration of execution.
fn prepare_work(st: &mut State, rid: RuleId) -> ExecWork {
    st.graph.rule_mut(rid).built = true;

    let spec = st.graph.rule(rid).spec.clone();
    let key = st
        .graph
        .rule(rid)
        .key
        .clone()
        .unwrap_or_else(|| rule_key(&[]));

    let products: Vec<ProductInfo> = st
        .graph
        .rule(rid)
        .produces
        .clone()
        .into_iter()
        .filter_map(|id| {
            let t = st.graph.target(id);
            t.path.as_path().map(|p| ProductInfo {
                target: id,
                path: p.to_path_buf(),
                rebuild_if_changed: t.rebuild_if_changed,
            })
        })
        .collect();

    let reqs: Vec<ReqInfo> = st
        .graph
        .rule(rid)
        .required
        .clone()
        .into_iter()
        .map(|(id, weak)| {
            let t = st.graph.target(id);
            ReqInfo {
                dep: t.path.clone(),
                weak,
                virtual_mtime: t.virtual_mtime,
            }
        })
        .collect();

    let requires = st.graph.rule(rid).requires.clone();
    let path_ctx = st.scopes.get(spec.scope).path_context();

    // Make sure every product and requirement has a cache entry, then move
    // the sub-map out; it is written back when the rule finishes.
    let mut cache = st
        .scopes
        .get_mut(spec.scope)
        .cache
        .as_mut()
        .and_then(|c| c.rules.remove(&key))
        .unwrap_or_default();
    for p in &products {
        cache.entry(cache_key(&p.path)).or_default();
    }
    for r in &reqs {
        if let Some(p) = r.dep.as_path() {
            cache.entry(cache_key(p)).or_default();
        }
    }

    ExecWork {
        rid,
        spec,
        key,
        cache,
        products,
        reqs,
        requires,
        path_ctx,
    }
}

/// Decide whether the rule must run, run it if so, then record results and
/// propagate readiness to dependent rules.
fn execute_rule(shared: &EngineShared, queue: &RuleQueue, mut work: ExecWork) -> Result<()> {
    let mut changed_reqs: Vec<String> = Vec::new();
    for req in &work.reqs {
        match &req.dep {
            DepPath::Always => changed_reqs.push(paths::ALWAYS_BUILD.to_string()),
            DepPath::Path(p) => {
                let entry = work.cache.entry(cache_key(p)).or_default();
                if let Some(vm) = req.virtual_mtime {
                    let cached = entry.vmodtime;
                    if cached != Some(vm) {
                        tracing::debug!(
                            "Modtime (virtual) for {} has changed; cached = {cached:?}, actual = {vm:?}",
                            p.display()
                        );
                        entry.vmodtime = Some(vm);
                        if !(req.weak && cached.is_none()) {
                            changed_reqs.push(cache_key(p));
                        }
                    }
                } else {
                    match (work.spec.has_changed)(p, entry, req.weak) {
                        Change::Changed => changed_reqs.push(cache_key(p)),
                        Change::Unknown => {
                            // A hard requirement that cannot be examined is
                            // treated as changed; a weak one is tolerated.
                            if !req.weak {
                                changed_reqs.push(cache_key(p));
                            }
                        }
                        Change::Unchanged => {}
                    }
                }
            }
        }
    }

    let mut need_build = !changed_reqs.is_empty();
    if need_build {
        tracing::debug!(
            "Need to build {:?} because dependencies {changed_reqs:?} have changed",
            work.products.iter().map(|p| p.path.display().to_string()).collect::<Vec<_>>()
        );
    } else {
        for product in &work.products {
            let entry = work.cache.entry(cache_key(&product.path)).or_default();
            if entry.is_virtual {
                // Virtual products cannot be modified externally.
                continue;
            }
            if !product.path.exists() {
                tracing::debug!(
                    "Need to build {} because it does not exist",
                    product.path.display()
                );
                need_build = true;
            } else if product.rebuild_if_changed
                && (work.spec.has_changed)(&product.path, entry, false) == Change::Changed
            {
                tracing::debug!(
                    "Need to build {} because it has changed",
                    product.path.display()
                );
                need_build = true;
            }
        }
    }

    let mut untouched: HashSet<String> = HashSet::new();
    if need_build {
        if !work.spec.cwd_safe {
            // The special worker owns the process working directory while a
            // cwd-unsafe rule runs.
            if let Err(err) = std::env::set_current_dir(&work.path_ctx.dir) {
                mark_bad_rule(shared, &work);
                return Err(BuildError::with_info(
                    ErrorKind::RuleExecutionFailure,
                    format!(
                        "Could not enter directory {}: {err}",
                        work.path_ctx.dir.display()
                    ),
                    rule_origin_info(&work.spec.origin),
                ));
            }
        }

        let mut ctx = RuleContext {
            engine: shared,
            spec: &work.spec,
            produces: work.products.iter().map(|p| p.path.clone()).collect(),
            requires: work.requires.clone(),
            path_ctx: work.path_ctx.clone(),
            cache: std::mem::take(&mut work.cache),
            untouched: HashSet::new(),
            deferred: Vec::new(),
        };
        // A panicking rule body must not strand the pool: convert it into a
        // rule failure so the queue reaches its errored state.
        let body_result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (work.spec.func)(&mut ctx)))
                .unwrap_or_else(|payload| Err(anyhow::anyhow!(panic_message(&payload))));
        let deferred = std::mem::take(&mut ctx.deferred);
        work.cache = std::mem::take(&mut ctx.cache);
        untouched = std::mem::take(&mut ctx.untouched);
        drop(ctx);

        if let Err(err) = body_result {
            write_back_cache(shared, &work);
            mark_bad_rule(shared, &work);
            let mut info = anyhow_info(&err);
            info.extend(rule_origin_info(&work.spec.origin));
            return Err(BuildError::with_info(
                ErrorKind::RuleExecutionFailure,
                "Error running rule",
                info,
            ));
        }

        // Deferred functions queued by the rule body run right after it.
        let emk = Emk {
            engine: shared,
            scope: work.spec.scope,
        };
        for f in deferred {
            let deferred_result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&emk)))
                    .unwrap_or_else(|payload| Err(anyhow::anyhow!(panic_message(&payload))));
            if let Err(err) = deferred_result {
                write_back_cache(shared, &work);
                mark_bad_rule(shared, &work);
                let mut info = anyhow_info(&err);
                info.extend(rule_origin_info(&work.spec.origin));
                return Err(BuildError::with_info(
                    ErrorKind::ConfigurationFailure,
                    format!(
                        "Error running do_later function (in {})",
                        work.path_ctx.dir.display()
                    ),
                    info,
                ));
            }
        }
    }

    finish_rule(shared, queue, work, untouched, need_build)
}

/// Record product results, write the cache sub-map back, and propagate
/// readiness: every dependent rule whose unbuilt-requirement counter
/// reaches zero is enqueued.
fn finish_rule(
    shared: &EngineShared,
    queue: &RuleQueue,
    mut work: ExecWork,
    untouched: HashSet<String>,
    executed: bool,
) -> Result<()> {
    let now = FileStamp::now();
    let mut ready: Vec<(RuleId, bool)> = Vec::new();

    shared.with_state(|st| -> Result<()> {
        for product in &work.products {
            let key = cache_key(&product.path);
            let entry = work.cache.entry(key.clone()).or_default();
            let is_virtual = entry.is_virtual;
            let changed = executed && !untouched.contains(&key);

            if executed {
                if is_virtual {
                    if changed {
                        entry.vmodtime = Some(now);
                        st.graph.target_mut(product.target).virtual_mtime = Some(now);
                    }
                } else if changed {
                    match FileStamp::of_path(&product.path) {
                        Some(mtime) => entry.mtime = Some(mtime),
                        None => {
                            // The rule claimed to produce this file but did
                            // not; its cache sub-map is dropped so the next
                            // run starts clean.
                            st.bad_rules.push(work.rid);
                            return Err(BuildError::with_info(
                                ErrorKind::MissingProduct,
                                format!(
                                    "{} should have been produced by the rule",
                                    product.path.display()
                                ),
                                rule_origin_info(&work.spec.origin),
                            ));
                        }
                    }
                }
            }
            if is_virtual && !changed {
                let vm = *entry.vmodtime.get_or_insert(FileStamp::ZERO);
                st.graph.target_mut(product.target).virtual_mtime = Some(vm);
            }
            st.graph.target_mut(product.target).built = true;
        }

        st.graph.rule_mut(work.rid).executed = executed;

        // Write the cache sub-map back.
        let scope = st.scopes.get_mut(work.spec.scope);
        if let Some(cache) = scope.cache.as_mut() {
            cache
                .rules
                .insert(work.key.clone(), std::mem::take(&mut work.cache));
        }

        for product in &work.products {
            for &dependent in &st.graph.target(product.target).required_by {
                let rule = st.graph.rule(dependent);
                if !rule.want_build || rule.built {
                    continue;
                }
                if rule
                    .spec
                    .remaining_unbuilt
                    .fetch_sub(1, Ordering::SeqCst)
                    == 1
                {
                    ready.push((dependent, rule.spec.cwd_safe));
                }
            }
        }
        Ok(())
    })?;

    for (rid, cwd_safe) in ready {
        queue.put(rid, cwd_safe);
    }
    Ok(())
}

fn write_back_cache(shared: &EngineShared, work: &ExecWork) {
    shared.with_state(|st| {
        let scope = st.scopes.get_mut(work.spec.scope);
        if let Some(cache) = scope.cache.as_mut() {
            cache.rules.insert(work.key.clone(), work.cache.clone());
        }
    });
}

fn mark_bad_rule(shared: &EngineShared, work: &ExecWork) {
    if !work.spec.ex_safe {
        shared.with_state(|st| st.bad_rules.push(work.rid));
    }
}

/// Best-effort message extraction from a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("rule body panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("rule body panicked: {s}")
    } else {
        "rule body panicked".to_string()
    }
}
