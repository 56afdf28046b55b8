//! Post-build dependency tracer
//!
//! Renders the dependency tree under a target after a build: which rule
//! produces each node, whether it was rebuilt this run, and which
//! requirements are external files. With `trace_unchanged` off, subtrees
//! that contributed no rebuild are collapsed.

use std::collections::HashSet;
use std::path::Path;

use crate::engine::State;
use crate::graph::TargetId;
use crate::paths::DepPath;

/// Render the trace for one path. Returns the formatted lines.
pub(crate) fn trace_lines(st: &State, path: &Path, show_unchanged: bool) -> Vec<String> {
    let mut lines = Vec::new();
    match st.graph.lookup(&DepPath::Path(path.to_path_buf())) {
        None => lines.push(format!("trace: {} is not a known target", path.display())),
        Some(id) => {
            lines.push(format!("trace: {}", path.display()));
            let mut visited = HashSet::new();
            walk(st, id, 1, false, show_unchanged, &mut visited, &mut lines);
        }
    }
    lines
}

fn status(st: &State, id: TargetId) -> (&'static str, bool) {
    let target = st.graph.target(id);
    match target.rule {
        Some(rid) => {
            let rule = st.graph.rule(rid);
            if rule.executed {
                ("rebuilt", true)
            } else if target.built {
                ("up-to-date", false)
            } else {
                ("unbuilt", false)
            }
        }
        None => match &target.path {
            DepPath::Always => ("always-build", true),
            DepPath::Path(p) => {
                if p.exists() {
                    ("external", false)
                } else {
                    ("missing", false)
                }
            }
        },
    }
}

/// Walk one target's subtree. Returns whether anything below (or the node
/// itself) was rebuilt this run.
fn walk(
    st: &State,
    id: TargetId,
    depth: usize,
    weak: bool,
    show_unchanged: bool,
    visited: &mut HashSet<TargetId>,
    lines: &mut Vec<String>,
) -> bool {
    let indent = "    ".repeat(depth);
    let target = st.graph.target(id);
    let name = target.path.display_string();
    let weak_mark = if weak { " [weak]" } else { "" };

    if !visited.insert(id) {
        lines.push(format!("{indent}{name}{weak_mark} (see above)"));
        return false;
    }

    let (label, mut rebuilt) = status(st, id);
    let mut node_lines = Vec::new();
    match target.rule {
        Some(rid) => {
            let rule = st.graph.rule(rid);
            node_lines.push(format!(
                "{indent}{name}{weak_mark} ({label}; rule declared at {})",
                rule.spec.origin
            ));
            for (req, req_weak) in rule.required.clone() {
                if walk(
                    st,
                    req,
                    depth + 1,
                    req_weak,
                    show_unchanged,
                    visited,
                    &mut node_lines,
                ) {
                    rebuilt = true;
                }
            }
        }
        None => node_lines.push(format!("{indent}{name}{weak_mark} ({label})")),
    }

    if rebuilt || show_unchanged || depth <= 1 {
        lines.append(&mut node_lines);
    } else {
        lines.push(format!("{indent}{name}{weak_mark} ({label}; subtree unchanged)"));
    }
    rebuilt
}
