//! Logging initialization for the CLI.
//!
//! The engine only emits `tracing` events; this is the one place a
//! subscriber gets installed.

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Per-resolution events (cache hits, tried candidates) fire once per
/// `require`, so they only show up at the highest verbosity.
const CHATTY_TARGETS: &[&str] = &["haste_core::resolver", "haste_core::registry"];

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Directives layered on top of `RUST_LOG` for a verbosity.
fn directives(verbosity: u8) -> Vec<String> {
    let level = level_for(verbosity);
    let mut out = vec![format!("haste_core={level}"), format!("haste={level}")];
    if verbosity < 2 {
        let capped = level.min(Level::INFO);
        out.extend(CHATTY_TARGETS.iter().map(|t| format!("{t}={capped}")));
    }
    out
}

/// Initialize the tracing subscriber.
///
/// `verbosity` 0 = INFO, 1 = DEBUG, 2+ = TRACE (including per-require
/// resolver output). With `json`, events go to stderr as JSON lines.
/// Above INFO the text output names the emitting module so vfs, registry
/// and bundler events can be told apart.
///
/// # Panics
/// Panics if a subscriber is already installed.
pub fn init(verbosity: u8, json: bool) {
    let filter = directives(verbosity)
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            EnvFilter::add_directive,
        );

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(verbosity > 0)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_verbosity_keeps_resolver_at_info() {
        let d = directives(0);
        assert!(d.contains(&"haste_core=INFO".to_string()));
        assert!(d.contains(&"haste_core::resolver=INFO".to_string()));
    }

    #[test]
    fn test_debug_verbosity_caps_chatty_targets() {
        let d = directives(1);
        assert!(d.contains(&"haste_core=DEBUG".to_string()));
        assert!(d.contains(&"haste_core::registry=INFO".to_string()));
    }

    #[test]
    fn test_trace_verbosity_opens_everything() {
        let d = directives(3);
        assert_eq!(d, vec!["haste_core=TRACE".to_string(), "haste=TRACE".to_string()]);
        assert!(d.iter().all(|s| s.parse::<Directive>().is_ok()));
    }
}
