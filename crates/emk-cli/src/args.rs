//! Positional-argument grammar
//!
//! Every positional word is an explicit target unless it contains `=`, in
//! which case it is a `key=value` option. The special positional `clean`
//! switches to cleaning mode and discards every other explicit target.
//! Unrecognized options are preserved and surfaced to build descriptions
//! through the engine's option map.

use std::collections::BTreeMap;

/// Log output styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Style {
    /// Plain output.
    No,
    /// ANSI-colored console output.
    #[default]
    Console,
    /// HTML-markup output (rendered plain here; styling is the embedder's
    /// concern).
    Html,
    /// Raw pass-through.
    Passthrough,
}

/// Parsed command-line state.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Log level name: debug, info, warning, error, or critical.
    pub log: String,
    /// Worker thread count.
    pub threads: usize,
    /// Log styling mode.
    pub style: Style,
    /// Targets to run the dependency tracer on after the build.
    pub trace: Vec<String>,
    /// Whether the tracer shows up-to-date subtrees.
    pub trace_unchanged: bool,
    /// Developer mode.
    pub emk_dev: bool,
    /// Cleaning mode.
    pub cleaning: bool,
    /// Explicit targets, in command-line order.
    pub explicit_targets: Vec<String>,
    /// Every option seen, recognized or not.
    pub options: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        let mut options = BTreeMap::new();
        options.insert("log".to_string(), "info".to_string());
        options.insert("threads".to_string(), "x".to_string());
        options.insert("style".to_string(), "console".to_string());
        options.insert("emk_dev".to_string(), "no".to_string());
        Self {
            log: "info".to_string(),
            threads: num_cpus::get(),
            style: Style::Console,
            trace: Vec::new(),
            trace_unchanged: false,
            emk_dev: false,
            cleaning: false,
            explicit_targets: Vec::new(),
            options,
        }
    }
}

const LOG_LEVELS: &[&str] = &["debug", "info", "warning", "error", "critical"];

/// Parse the positional words.
pub fn parse_args(words: &[String]) -> BuildOptions {
    let mut opts = BuildOptions::default();

    for word in words {
        let Some((key, value)) = word.split_once('=') else {
            opts.explicit_targets.push(word.clone());
            continue;
        };
        match key {
            "explicit_target" => {
                opts.explicit_targets.push(value.to_string());
                continue;
            }
            "log" => {
                let level = value.to_ascii_lowercase();
                if LOG_LEVELS.contains(&level.as_str()) {
                    opts.log = level;
                } else {
                    tracing::error!("Unknown log level '{value}'");
                }
            }
            "threads" => {
                if value != "x" {
                    match value.parse::<usize>() {
                        Ok(n) if n >= 1 => opts.threads = n,
                        _ => {
                            tracing::error!(
                                "Thread count '{value}' is not a positive integer"
                            );
                            opts.threads = 1;
                        }
                    }
                }
            }
            "style" => match value {
                "no" => opts.style = Style::No,
                "console" => opts.style = Style::Console,
                "html" => opts.style = Style::Html,
                "passthrough" => opts.style = Style::Passthrough,
                other => tracing::error!("Unknown style option '{other}'"),
            },
            "trace" => {
                opts.trace
                    .extend(value.split(',').filter(|t| !t.is_empty()).map(String::from));
            }
            "trace_unchanged" => opts.trace_unchanged = value == "yes",
            "emk_dev" => opts.emk_dev = value == "yes",
            _ => {}
        }
        opts.options.insert(key.to_string(), value.to_string());
    }

    if opts.explicit_targets.iter().any(|t| t == "clean") {
        opts.cleaning = true;
        opts.explicit_targets = vec!["clean".to_string()];
    }

    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(args: &[&str]) -> Vec<String> {
        args.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_targets_and_options_split() {
        let opts = parse_args(&words(&["all", "log=debug", "threads=3", "custom=1"]));
        assert_eq!(opts.explicit_targets, vec!["all".to_string()]);
        assert_eq!(opts.log, "debug");
        assert_eq!(opts.threads, 3);
        assert_eq!(opts.options["custom"], "1");
        assert_eq!(opts.options["log"], "debug");
        assert!(!opts.cleaning);
    }

    #[test]
    fn test_explicit_target_option_escapes_equals() {
        let opts = parse_args(&words(&["explicit_target=weird=name"]));
        assert_eq!(opts.explicit_targets, vec!["weird=name".to_string()]);
    }

    #[test]
    fn test_clean_discards_other_targets() {
        let opts = parse_args(&words(&["all", "clean", "docs"]));
        assert!(opts.cleaning);
        assert_eq!(opts.explicit_targets, vec!["clean".to_string()]);
    }

    #[test]
    fn test_threads_x_means_cpu_count() {
        let opts = parse_args(&words(&["threads=x"]));
        assert_eq!(opts.threads, num_cpus::get());
        let opts = parse_args(&words(&["threads=0"]));
        assert_eq!(opts.threads, 1);
    }

    #[test]
    fn test_trace_option_splits_on_commas() {
        let opts = parse_args(&words(&["trace=a,b", "trace_unchanged=yes"]));
        assert_eq!(opts.trace, vec!["a".to_string(), "b".to_string()]);
        assert!(opts.trace_unchanged);
    }

    #[test]
    fn test_unknown_log_level_keeps_default() {
        let opts = parse_args(&words(&["log=chatty"]));
        assert_eq!(opts.log, "info");
    }
}
