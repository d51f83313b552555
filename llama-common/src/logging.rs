//! Logging utilities shared by the library and the CLI.

use serde::Serialize;
use std::fmt::Debug;
use tracing_subscriber::EnvFilter;

/// Wrapper for pretty-printing types in logs as YAML
///
/// Use this in tracing statements to format complex values with a newline
/// before the content:
///
/// ```ignore
/// use llama_common::Pretty;
/// use tracing::debug;
///
/// debug!("Sampling parameters: {}", Pretty(&params));
/// ```
///
/// Debug formatting is used as a fallback if YAML serialization fails.
pub struct Pretty<T>(pub T);

impl<T: Serialize + Debug> std::fmt::Display for Pretty<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_yaml_ng::to_string(&self.0) {
            Ok(yaml) => write!(f, "\n{}", yaml),
            Err(_) => write!(f, "\n{:#?}", self.0),
        }
    }
}

impl<T: Serialize + Debug> std::fmt::Debug for Pretty<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Install a stderr `fmt` subscriber.
///
/// With `debug` set, the listed crates log at debug level; otherwise the
/// filter comes from `RUST_LOG` and falls back to `warn`. Calling this twice
/// is harmless, the second call is ignored.
pub fn init_tracing(debug: bool, crates: &[&str]) {
    let filter = if debug {
        let directives = crates
            .iter()
            .map(|name| format!("{}=debug", name.replace('-', "_")))
            .collect::<Vec<_>>()
            .join(",");
        EnvFilter::new(directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}
