// Logging setup
//
// Everything goes to stderr: worker processes use stdout for frames.
// Format and filter come from settings, `WARREN_LOG_FORMAT` and `RUST_LOG`.

use anyhow::{anyhow, Result};
use std::path::Path;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::settings::LogSettings;

const DEFAULT_FILTER: &str = "warren=info";
const DEFAULT_LOG_FILE: &str = "warren.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown log format '{}', expected pretty or json", s)),
        }
    }
}

fn resolve_format(settings: &LogSettings) -> LogFormat {
    std::env::var("WARREN_LOG_FORMAT")
        .ok()
        .and_then(|f| f.parse().ok())
        .or_else(|| settings.format.parse().ok())
        .unwrap_or_default()
}

fn build_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.filter.as_deref().unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
    }
}

fn file_layer(format: LogFormat, path: &Path) -> (BoxedLayer, WorkerGuard) {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));

    let layer = match format {
        LogFormat::Json => fmt::layer().json().with_ansi(false).with_writer(writer).boxed(),
        LogFormat::Pretty => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
    };
    (layer, guard)
}

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let format = resolve_format(settings);
    let mut layers = vec![stderr_layer(format)];
    let mut guard = None;
    if let Some(path) = &settings.file {
        let (layer, file_guard) = file_layer(format, path);
        layers.push(layer);
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(settings))
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_bad_settings_format_falls_back() {
        let settings = LogSettings {
            format: "xml".to_string(),
            ..LogSettings::default()
        };
        if std::env::var("WARREN_LOG_FORMAT").is_err() {
            assert_eq!(resolve_format(&settings), LogFormat::Pretty);
        }
    }
}
