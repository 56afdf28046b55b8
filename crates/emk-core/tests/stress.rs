//! A many-directory incremental-build workout: a root that fans out into
//! per-directory compile/link style rule chains, sized by a command-line
//! option. Checks that a warm rebuild does nothing and that touching one
//! source re-runs exactly its own chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use emk_core::{Engine, EngineConfig, ModuleRegistry, RuleOpts, ScriptRegistry};

const DIRS: usize = 6;
const FILES: usize = 8;

fn canonical(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap()
}

struct Workout {
    root: PathBuf,
    compiles: Arc<AtomicUsize>,
    links: Arc<AtomicUsize>,
}

impl Workout {
    fn new(tmp: &Path) -> Self {
        let root = canonical(tmp);
        for d in 0..DIRS {
            let dir = root.join(format!("d_{d}"));
            std::fs::create_dir_all(&dir).unwrap();
            for f in 0..FILES {
                std::fs::write(dir.join(format!("src_{f}.txt")), format!("{d}/{f}")).unwrap();
            }
        }
        Self {
            root,
            compiles: Arc::new(AtomicUsize::new(0)),
            links: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn scripts(&self) -> ScriptRegistry {
        let mut scripts = ScriptRegistry::default();

        // The root description fans out based on the `dirs=` option, the
        // way a checkout-wide build description would.
        scripts.rules_at(&self.root, |emk| {
            let dirs: usize = emk
                .option("dirs")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            for d in 0..dirs {
                emk.subdir(&[format!("d_{d}").as_str()]);
            }
            Ok(())
        });

        for d in 0..DIRS {
            let dir = self.root.join(format!("d_{d}"));
            let compiles = self.compiles.clone();
            let links = self.links.clone();
            scripts.rules_at(&dir, move |emk| {
                let mut objects = Vec::new();
                for f in 0..FILES {
                    let src = format!("src_{f}.txt");
                    let obj = format!("$:build:$/obj_{f}.txt");
                    let compiles = compiles.clone();
                    emk.rule(
                        &[obj.as_str()],
                        &[src.as_str()],
                        move |ctx| {
                            compiles.fetch_add(1, Ordering::SeqCst);
                            let input = ctx.require_paths().next().expect("one source");
                            let data = std::fs::read(input)?;
                            std::fs::write(&ctx.produces()[0], data)?;
                            Ok(())
                        },
                        RuleOpts::cwd_safe(),
                    )?;
                    objects.push(obj);
                }

                let object_refs: Vec<&str> = objects.iter().map(String::as_str).collect();
                let links = links.clone();
                emk.rule(
                    &["$:build:$/lib.txt"],
                    &object_refs,
                    move |ctx| {
                        links.fetch_add(1, Ordering::SeqCst);
                        let mut combined = Vec::new();
                        for obj in ctx.require_paths() {
                            combined.extend(std::fs::read(obj)?);
                            combined.push(b'\n');
                        }
                        std::fs::write(&ctx.produces()[0], combined)?;
                        Ok(())
                    },
                    RuleOpts::cwd_safe(),
                )?;
                emk.autobuild(&["$:build:$/lib.txt"]);
                Ok(())
            });
        }

        scripts
    }

    fn build(&self) {
        let mut config = EngineConfig {
            threads: 4,
            ..EngineConfig::default()
        };
        config.options.insert("dirs".to_string(), DIRS.to_string());
        let engine = Engine::new(config, Arc::new(self.scripts()), ModuleRegistry::default());
        engine.run(&self.root).unwrap();
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.compiles.load(Ordering::SeqCst),
            self.links.load(Ordering::SeqCst),
        )
    }
}

#[test]
fn test_fanout_build_is_incremental_per_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let workout = Workout::new(tmp.path());

    // Cold build: every compile and every link runs.
    workout.build();
    assert_eq!(workout.counts(), (DIRS * FILES, DIRS));
    for d in 0..DIRS {
        let lib = workout.root.join(format!("d_{d}/__build__/lib.txt"));
        assert!(lib.is_file(), "missing {}", lib.display());
    }

    // Warm build: nothing runs.
    workout.build();
    assert_eq!(workout.counts(), (DIRS * FILES, DIRS));

    // Touch one source: exactly that compile and its link re-run.
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(workout.root.join("d_3/src_5.txt"), b"modified").unwrap();
    workout.build();
    assert_eq!(workout.counts(), (DIRS * FILES + 1, DIRS + 1));

    let rebuilt = workout.root.join("d_3/__build__/obj_5.txt");
    assert_eq!(std::fs::read(&rebuilt).unwrap(), b"modified");
}
