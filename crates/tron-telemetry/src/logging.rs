use std::str::FromStr;

use tracing::Level;

use crate::TelemetryConfig;

/// Log line encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Build an `EnvFilter` directive string from the configured levels,
/// e.g. `info,tron_client::pump=trace`.
pub fn filter_directive(config: &TelemetryConfig) -> String {
    let mut directive = level_str(config.log_level).to_string();
    for (module, level) in &config.module_levels {
        directive.push(',');
        directive.push_str(module);
        directive.push('=');
        directive.push_str(level_str(*level));
    }
    directive
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}
