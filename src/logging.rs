//! Structured logging for cnbkit

use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cnbkit=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Short form of a digest for log fields
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..12.min(hex.len())]
}

#[macro_export]
macro_rules! log_layer_added {
    ($what:expr, $diff_id:expr) => {
        tracing::info!(
            layer = $what,
            diff_id = %$crate::logging::short_digest(&$diff_id),
            "Adding layer"
        );
    };
}

#[macro_export]
macro_rules! log_cache_hit {
    ($uri:expr, $path:expr) => {
        tracing::debug!(uri = %$uri, path = %$path.display(), "Using cached version");
    };
}

#[macro_export]
macro_rules! log_module_override {
    ($kind:expr, $full_name:expr, $reason:expr) => {
        tracing::debug!(
            kind = %$kind,
            module = %$full_name,
            reason = $reason,
            "Module will be overridden"
        );
    };
}
