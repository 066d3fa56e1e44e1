// Logging setup for binaries embedding the realtime layer.
//
// Library code logs through the `log` facade. `init_logging` installs a
// tracing-subscriber registry and a `tracing_log::LogTracer` bridge so those
// records come out through the same formatter as native tracing events.
// Output goes to stderr; stdout stays free for event output.

use std::collections::HashMap;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingSettings;

/// Log format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact text: timestamp LEVEL target - message
    Compact,
    /// Multi-line human readable output
    Pretty,
    /// JSON lines
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" | "jsonl" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Base level, noisy-crate overrides, then per-target overrides from config.
fn build_env_filter(
    level: &str,
    target_levels: Option<&HashMap<String, String>>,
) -> anyhow::Result<EnvFilter> {
    let mut directives = vec![level.to_string()];

    let noisy: &[(&str, &str)] = &[
        ("tokio_tungstenite", "warn"),
        ("tungstenite", "warn"),
        ("rustls", "warn"),
        ("hyper_util", "warn"),
        ("reqwest", "warn"),
        ("h2", "warn"),
    ];
    for (target, lvl) in noisy {
        directives.push(format!("{}={}", target, lvl));
    }

    if let Some(map) = target_levels {
        let mut overrides: Vec<_> = map.iter().collect();
        overrides.sort();
        for (target, lvl) in overrides {
            directives.push(format!("{}={}", target, lvl));
        }
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(
    level: &str,
    format: &str,
    target_levels: Option<&HashMap<String, String>>,
) -> anyhow::Result<()> {
    let filter = build_env_filter(level, target_levels)?;

    tracing_log::LogTracer::init().ok();

    let layer = match LogFormat::parse(format) {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    tracing::trace!("Logging initialized: level={}, format={}", level, format);
    Ok(())
}

/// [`init_logging`] from a `[logging]` config section.
pub fn init_from_settings(settings: &LoggingSettings) -> anyhow::Result<()> {
    init_logging(&settings.level, &settings.format, Some(&settings.targets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("jsonl"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Compact);
    }

    #[test]
    fn test_env_filter_accepts_overrides() {
        let mut targets = HashMap::new();
        targets.insert("realtime_sync".to_string(), "trace".to_string());
        assert!(build_env_filter("info", Some(&targets)).is_ok());
        assert!(build_env_filter("debug", None).is_ok());
    }
}
