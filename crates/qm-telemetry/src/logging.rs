use tracing_subscriber::{fmt, EnvFilter};

use qm_core::config::{GeneralConfig, LogFormat};

/// Initialize the tracing subscriber from the `general` config section.
///
/// `RUST_LOG` takes precedence when set; otherwise the filter is built from
/// `general.log_level`, with the HTTP stack's per-request chatter capped at
/// `warn` so an `info` daemon log stays readable. The output format (text
/// or json) comes from `general.log_format`.
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init(general: &GeneralConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&general.log_level)));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true);

    match general.log_format {
        LogFormat::Text => builder.try_init().ok(),
        LogFormat::Json => builder.json().try_init().ok(),
    };

    tracing::info!(
        project = %general.project_name,
        level = %general.log_level,
        format = ?general.log_format,
        "logging initialised"
    );
}

/// The daemon's default filter: the configured level everywhere except the
/// HTTP middleware, which logs every request at its own level.
fn default_directives(level: &str) -> String {
    format!("{level},tower_http=warn,hyper=warn")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_cap_http_noise() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("tower_http=warn"));
        assert!(directives.contains("hyper=warn"));
    }

    #[test]
    fn init_is_idempotent() {
        let general = GeneralConfig::default();
        init(&general);
        // A second call (and a format change) must not panic.
        let mut json = GeneralConfig::default();
        json.log_format = LogFormat::Json;
        init(&json);
    }
}
