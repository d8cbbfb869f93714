//! Unified logging for debug output.
//!
//! Provides compact timestamped logging with per-module level configuration.
//! Supports `RUST_LOG` environment variable for runtime overrides.
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! default = "warn"  # quiet by default
//!
//! [logging.modules]
//! store = "debug"     # backend calls, commits, delete polling
//! collection = "info" # document status transitions
//! ```
//!
//! Library targets: `loader`, `chunker`, `embed`, `store`, `collection`,
//! `retrieve`, `retry`, `pipeline`.
//!
//! # Environment Variable
//!
//! `RUST_LOG` takes precedence over config:
//! ```bash
//! RUST_LOG=debug groundwork ingest notes.md
//! RUST_LOG=retrieve=trace,store=debug groundwork query "backup schedule"
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Compact time format: HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Install the global subscriber. Only the first call has any effect.
///
/// Output goes to stderr so `--json` results on stdout stay parseable.
/// `RUST_LOG` takes precedence over `config`.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true) // Show target for filtering visibility
            .with_timer(CompactTime)
            .with_level(true)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Build an `EnvFilter` directive string from the configured levels.
///
/// Module overrides are emitted in sorted order so the same config always
/// produces the same filter.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();

    let mut directives = config.default.clone();
    for (module, level) in modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_default_only() {
        let config = LoggingConfig::default();
        assert_eq!(filter_directives(&config), "warn");
    }

    #[test]
    fn test_filter_directives_sorted_overrides() {
        let mut config = LoggingConfig::default();
        config.default = "info".to_string();
        config.modules.insert("store".to_string(), "debug".to_string());
        config.modules.insert("collection".to_string(), "trace".to_string());
        assert_eq!(
            filter_directives(&config),
            "info,collection=trace,store=debug"
        );
    }
}
