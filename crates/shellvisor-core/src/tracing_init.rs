//! Logging setup shared by `shellvisord` and `shellvisor`.
//!
//! Logs always go to stderr: the client prints job output on stdout and the
//! two must not mix.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Filter directives in effect: a non-blank `RUST_LOG` wins over the
/// binary's default.
fn filter_directives(default_filter: &str, rust_log: Option<String>) -> String {
    rust_log
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_filter.to_string())
}

/// Install the global subscriber: env-filter plus a pretty or JSON
/// formatter on stderr.
///
/// Fails on malformed filter directives, or when a subscriber is already
/// installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let directives = filter_directives(default_filter, std::env::var("RUST_LOG").ok());
    let env_filter = EnvFilter::try_new(&directives)
        .map_err(|e| Error::Tracing(format!("invalid log filter {directives:?}: {e}")))?;

    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if log_json {
        registry.with(fmt.json()).try_init()
    } else {
        registry.with(fmt).try_init()
    };
    installed.map_err(|e| Error::Tracing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_default() {
        assert_eq!(
            filter_directives("shellvisord=info", Some("debug".into())),
            "debug"
        );
        assert_eq!(filter_directives("shellvisord=info", None), "shellvisord=info");
        assert_eq!(
            filter_directives("shellvisord=info", Some("  ".into())),
            "shellvisord=info"
        );
    }

    #[test]
    fn second_install_is_rejected() {
        let _ = init_tracing("warn", false);
        assert!(matches!(init_tracing("warn", true), Err(Error::Tracing(_))));
    }
}
