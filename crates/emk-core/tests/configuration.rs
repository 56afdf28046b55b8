//! Scope hierarchy, module lifecycle, deferred functions, and
//! configuration-error behavior.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use emk_core::{
    Emk, Engine, EngineConfig, ErrorKind, Module, ModuleRegistry, NewScope, RuleOpts, ScopeKind,
    ScriptRegistry,
};

fn canonical(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap()
}

fn build(config: EngineConfig, scripts: ScriptRegistry, registry: ModuleRegistry, root: &Path) -> emk_core::Result<()> {
    let engine = Engine::new(config, Arc::new(scripts), registry);
    engine.run(root)
}

fn config() -> EngineConfig {
    EngineConfig {
        threads: 2,
        ..EngineConfig::default()
    }
}

/// Project scopes set shared settings; subdirectories inherit the build dir
/// and can reach the project dir through `$:proj:$`.
#[test]
fn test_project_scope_settings_are_inherited() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());
    let sub = root.join("sub");
    std::fs::create_dir_all(&sub).unwrap();

    let mut scripts = ScriptRegistry::default();
    scripts.project_at(&root, |emk| {
        emk.set_build_dir("bld");
        Ok(())
    });
    scripts.rules_at(&root, |emk| {
        emk.recurse(&["sub"]);
        Ok(())
    });
    scripts.rules_at(&sub, |emk| {
        assert_eq!(emk.build_dir(), "bld");
        emk.rule(
            &["$:proj:$/combined"],
            &[],
            |ctx| {
                std::fs::write(&ctx.produces()[0], b"c")?;
                Ok(())
            },
            RuleOpts::cwd_safe(),
        )?;
        emk.autobuild(&["$:proj:$/combined"]);
        Ok(())
    });

    build(config(), scripts, ModuleRegistry::default(), &root).unwrap();
    assert!(root.join("combined").is_file());
    // Both directories got their own cache under the inherited build dir.
    assert!(root.join("bld").join(emk_core::cache::cache_file_name(&root)).is_file());
    assert!(sub.join("bld").join(emk_core::cache::cache_file_name(&sub)).is_file());
}

/// A subproject scope loads at most once, even when several directories
/// beneath it are visited.
#[test]
fn test_subproject_loads_once() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());
    let sp = root.join("sp");
    let a = sp.join("a");
    let b = sp.join("b");
    std::fs::create_dir_all(&a).unwrap();
    std::fs::create_dir_all(&b).unwrap();

    let subproj_loads = Arc::new(AtomicUsize::new(0));
    let mut scripts = ScriptRegistry::default();
    scripts.project_at(&root, |_emk| Ok(()));
    {
        let subproj_loads = subproj_loads.clone();
        scripts.subproj_at(&sp, move |emk| {
            subproj_loads.fetch_add(1, Ordering::SeqCst);
            emk.set_build_dir("spbld");
            Ok(())
        });
    }
    scripts.rules_at(&root, |emk| {
        emk.recurse(&["sp/a", "sp/b"]);
        Ok(())
    });
    scripts.rules_at(&a, |emk| {
        assert_eq!(emk.build_dir(), "spbld");
        Ok(())
    });
    scripts.rules_at(&b, |emk| {
        assert_eq!(emk.build_dir(), "spbld");
        Ok(())
    });

    build(config(), scripts, ModuleRegistry::default(), &root).unwrap();
    assert_eq!(subproj_loads.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct Hooks {
    loads: AtomicUsize,
    posts: AtomicUsize,
    spawns: AtomicUsize,
}

struct ProbeModule {
    hooks: Arc<Hooks>,
}

impl Module for ProbeModule {
    fn load(&mut self, _emk: &Emk<'_>, _kind: ScopeKind) -> anyhow::Result<()> {
        self.hooks.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn post(&mut self, _emk: &Emk<'_>, kind: ScopeKind) -> anyhow::Result<()> {
        if kind == ScopeKind::Rules {
            self.hooks.posts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn new_scope(&mut self, _kind: ScopeKind) -> NewScope {
        self.hooks.spawns.fetch_add(1, Ordering::SeqCst);
        NewScope::Instance(Box::new(ProbeModule {
            hooks: self.hooks.clone(),
        }))
    }
}

/// A strong module binding runs load and post hooks; lookups in the same
/// scope reuse the instance.
#[test]
fn test_module_lifecycle_hooks() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let hooks = Arc::new(Hooks::default());
    let mut registry = ModuleRegistry::default();
    {
        let hooks = hooks.clone();
        registry.register("probe", move |_kind| {
            Box::new(ProbeModule {
                hooks: hooks.clone(),
            })
        });
    }

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        let first = emk.module("probe")?;
        let second = emk.module("probe")?;
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(emk.module("no_such_module")?.is_none());
        Ok(())
    });

    build(config(), scripts, registry, &root).unwrap();
    assert_eq!(hooks.loads.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.posts.load(Ordering::SeqCst), 1);
}

/// A weak module binding suppresses the post hook until promoted.
#[test]
fn test_weak_module_suppresses_post_hook() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());
    let strong_dir = root.join("strong");
    std::fs::create_dir_all(&strong_dir).unwrap();

    let hooks = Arc::new(Hooks::default());
    let mut registry = ModuleRegistry::default();
    {
        let hooks = hooks.clone();
        registry.register("probe", move |_kind| {
            Box::new(ProbeModule {
                hooks: hooks.clone(),
            })
        });
    }

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        emk.weak_module("probe")?;
        emk.recurse(&["strong"]);
        Ok(())
    });
    scripts.rules_at(&strong_dir, |emk| {
        // Weak then strong: the strong lookup promotes the binding in place.
        emk.weak_module("probe")?;
        emk.module("probe")?;
        Ok(())
    });

    build(config(), scripts, registry, &root).unwrap();
    // Only the promoted binding in `strong` fired its post hook.
    assert_eq!(hooks.posts.load(Ordering::SeqCst), 1);
}

/// Deferred functions run after the description finishes, in order, and may
/// declare rules.
#[test]
fn test_do_later_and_prebuild_postbuild_ordering() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let mut scripts = ScriptRegistry::default();
    {
        let events = events.clone();
        scripts.rules_at(&root, move |emk| {
            let events = events.clone();
            events.lock().unwrap().push("load");
            {
                let events = events.clone();
                emk.do_later(move |_emk| {
                    events.lock().unwrap().push("later");
                    Ok(())
                });
            }
            {
                let events = events.clone();
                emk.do_prebuild(move |emk| {
                    events.lock().unwrap().push("prebuild");
                    let events = events.clone();
                    emk.rule(
                        &["made_in_prebuild"],
                        &[],
                        move |ctx| {
                            events.lock().unwrap().push("rule");
                            std::fs::write(&ctx.produces()[0], b"x")?;
                            Ok(())
                        },
                        RuleOpts::cwd_safe(),
                    )?;
                    emk.autobuild(&["made_in_prebuild"]);
                    Ok(())
                });
            }
            {
                let events = events.clone();
                emk.do_postbuild(move |_emk| {
                    events.lock().unwrap().push("postbuild");
                    Ok(())
                });
            }
            Ok(())
        });
    }

    build(config(), scripts, ModuleRegistry::default(), &root).unwrap();
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec!["load", "later", "prebuild", "rule", "postbuild"]);
    assert!(root.join("made_in_prebuild").is_file());
}

/// A `$:build:$` requirement pointing at a never-visited directory fails
/// reconciliation.
#[test]
fn test_unresolved_build_dir_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        emk.rule(
            &["out"],
            &["elsewhere/$:build:$/gen.h"],
            |ctx| {
                std::fs::write(&ctx.produces()[0], b"x")?;
                Ok(())
            },
            RuleOpts::cwd_safe(),
        )?;
        emk.autobuild(&["out"]);
        Ok(())
    });

    let err = build(config(), scripts, ModuleRegistry::default(), &root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnresolvedBuildDir);
}

/// Adding secondary dependencies to an already-built target is a hard
/// configuration error.
#[test]
fn test_depend_after_build_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());
    std::fs::write(root.join("late.h"), b"h").unwrap();

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        emk.rule(
            &["out"],
            &[],
            |ctx| {
                std::fs::write(&ctx.produces()[0], b"x")?;
                Ok(())
            },
            RuleOpts::cwd_safe(),
        )?;
        emk.autobuild(&["out"]);
        emk.do_postbuild(|emk| {
            emk.depend("out", &["late.h"]);
            // Queue more work so another phase (and its reconciliation)
            // actually happens.
            emk.do_prebuild(|_emk| Ok(()));
            Ok(())
        });
        Ok(())
    });

    let err = build(config(), scripts, ModuleRegistry::default(), &root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigurationFailure);
    assert!(err.message().contains("secondary dependencies"));
}

/// `require_rule` turns an existing-but-unruled path into a hard error.
#[test]
fn test_require_rule_rejects_external_file() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());
    std::fs::write(root.join("gen.h"), b"should be generated").unwrap();

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        emk.rule(
            &["out"],
            &["gen.h"],
            |ctx| {
                std::fs::write(&ctx.produces()[0], b"x")?;
                Ok(())
            },
            RuleOpts::cwd_safe(),
        )?;
        emk.require_rule(&["gen.h"]);
        emk.autobuild(&["out"]);
        Ok(())
    });

    let err = build(config(), scripts, ModuleRegistry::default(), &root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnbuildableTargets);
}

/// An error inside a rules description stops the build immediately.
#[test]
fn test_configuration_error_stops_build() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |_emk| anyhow::bail!("bad description"));

    let err = build(config(), scripts, ModuleRegistry::default(), &root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigurationFailure);
    assert!(err.extra_info().iter().any(|l| l.contains("bad description")));
}

/// Duplicate rules and duplicate aliases fail declaration.
#[test]
fn test_duplicate_declarations_fail() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        emk.rule(&["out"], &[], |_ctx| Ok(()), RuleOpts::cwd_safe())?;
        let dup = emk.rule(&["out"], &[], |_ctx| Ok(()), RuleOpts::cwd_safe());
        assert_eq!(dup.unwrap_err().kind, ErrorKind::DuplicateRule);

        emk.alias("out", "short")?;
        let dup = emk.alias("out", "short");
        assert_eq!(dup.unwrap_err().kind, ErrorKind::DuplicateAlias);
        anyhow::bail!("checked")
    });

    let err = build(config(), scripts, ModuleRegistry::default(), &root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigurationFailure);
}

/// Options flow from the command line into build descriptions.
#[test]
fn test_options_are_visible_to_descriptions() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        assert_eq!(emk.option("flavor").as_deref(), Some("debug"));
        assert!(emk.option("missing").is_none());
        assert!(!emk.cleaning());
        Ok(())
    });

    let mut config = config();
    config
        .options
        .insert("flavor".to_string(), "debug".to_string());
    build(config, scripts, ModuleRegistry::default(), &root).unwrap();
}

/// `subdir` wires child clean targets to the parent, so one clean cascades.
#[test]
fn test_subdir_clean_cascades() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());
    let sub = root.join("sub");
    std::fs::create_dir_all(&sub).unwrap();

    let scripts = |root: &Path, sub: &Path| {
        let mut scripts = ScriptRegistry::default();
        scripts.rules_at(root, |emk| {
            emk.subdir(&["sub"]);
            Ok(())
        });
        scripts.rules_at(sub, |emk| {
            emk.rule(
                &["$:build:$/thing"],
                &[],
                |ctx| {
                    std::fs::write(&ctx.produces()[0], b"x")?;
                    Ok(())
                },
                RuleOpts::cwd_safe(),
            )?;
            emk.autobuild(&["$:build:$/thing"]);
            Ok(())
        });
        scripts
    };

    build(config(), scripts(&root, &sub), ModuleRegistry::default(), &root).unwrap();
    assert!(sub.join("__build__/thing").is_file());

    let clean_config = EngineConfig {
        threads: 2,
        cleaning: true,
        explicit_targets: vec!["clean".to_string()],
        ..EngineConfig::default()
    };
    build(clean_config, scripts(&root, &sub), ModuleRegistry::default(), &root).unwrap();
    assert!(!sub.join("__build__").exists());
    assert!(!root.join("__build__").exists());
}

/// An engine refuses to run twice.
#[test]
fn test_engine_runs_once() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let engine = Engine::new(
        config(),
        Arc::new(ScriptRegistry::default()),
        ModuleRegistry::default(),
    );
    engine.run(&root).unwrap();
    let err = engine.run(&root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigurationFailure);
}

/// An interrupt before the executor starts surfaces as an interrupted
/// build with exit-style failure, without running any rule.
#[test]
fn test_interrupt_halts_before_rules_run() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let runs = Arc::new(AtomicUsize::new(0));
    let mut scripts = ScriptRegistry::default();
    {
        let runs = runs.clone();
        scripts.rules_at(&root, move |emk| {
            let runs = runs.clone();
            emk.rule(
                &["out"],
                &[],
                move |ctx| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    std::fs::write(&ctx.produces()[0], b"x")?;
                    Ok(())
                },
                RuleOpts::cwd_safe(),
            )?;
            emk.autobuild(&["out"]);
            Ok(())
        });
    }

    let engine = Engine::new(config(), Arc::new(scripts), ModuleRegistry::default());
    engine.interrupt();
    let err = engine.run(&root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Interrupted);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

/// One shared build function can back many rules via `make_rule`.
#[test]
fn test_make_rule_shares_one_function() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());

    let runs = Arc::new(AtomicUsize::new(0));
    let mut scripts = ScriptRegistry::default();
    {
        let runs = runs.clone();
        scripts.rules_at(&root, move |emk| {
            let runs = runs.clone();
            let func: emk_core::RuleFn = Arc::new(move |ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                std::fs::write(&ctx.produces()[0], b"x")?;
                Ok(())
            });
            emk.make_rule(&["one"], &[], func.clone(), RuleOpts::cwd_safe())?;
            emk.make_rule(&["two"], &[], func, RuleOpts::cwd_safe())?;
            emk.autobuild(&["one", "two"]);
            Ok(())
        });
    }

    build(config(), scripts, ModuleRegistry::default(), &root).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(root.join("one").is_file());
    assert!(root.join("two").is_file());
}

/// The dependency tracer renders without disturbing the build.
#[test]
fn test_trace_option_renders() {
    let tmp = tempfile::tempdir().unwrap();
    let root = canonical(tmp.path());
    std::fs::write(root.join("src"), b"s").unwrap();

    let mut scripts = ScriptRegistry::default();
    scripts.rules_at(&root, |emk| {
        emk.rule(
            &["out"],
            &["src"],
            |ctx| {
                std::fs::write(&ctx.produces()[0], b"x")?;
                Ok(())
            },
            RuleOpts::cwd_safe(),
        )?;
        emk.autobuild(&["out"]);
        emk.trace(&["out"]);
        Ok(())
    });

    let config = EngineConfig {
        threads: 2,
        trace: vec!["out".to_string()],
        trace_unchanged: true,
        ..EngineConfig::default()
    };
    build(config, scripts, ModuleRegistry::default(), &root).unwrap();
}
