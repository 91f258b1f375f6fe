//! Logging initialization
//!
//! Diagnostic logging for the core, configured once by the embedding
//! process. Console output is opt-in (the core itself never owns
//! stdout/stderr - that belongs to the UI collaborator); file output goes
//! to a daily-rolled `spindb.log` under the chosen directory.

use std::collections::HashMap;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::domain::errors::{SpinError, SpinResult};

/// Logging configuration persisted by the embedding process
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoggingConfig {
    /// Base log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    /// Module-specific level overrides (e.g. "reqwest": "warn")
    #[serde(default)]
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_filters = HashMap::new();
        module_filters.insert("reqwest".to_string(), "warn".to_string());
        module_filters.insert("hyper".to_string(), "warn".to_string());
        module_filters.insert("tokio".to_string(), "info".to_string());
        Self {
            level: "info".to_string(),
            console_output: false,
            file_output: true,
            module_filters,
        }
    }
}

impl LoggingConfig {
    fn filter_directive(&self) -> String {
        let mut directive = self.level.clone();
        for (module, level) in &self.module_filters {
            directive.push_str(&format!(",{module}={level}"));
        }
        directive
    }
}

/// Initialize the tracing subscriber. Returns the appender guard that
/// must stay alive for the duration of the process when file output is
/// on. Calling twice is an error (the subscriber is global).
pub fn init_logging(config: &LoggingConfig, log_dir: &Path) -> SpinResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));
    let registry = Registry::default().with(env_filter);

    match (config.file_output, config.console_output) {
        (true, console) => {
            std::fs::create_dir_all(log_dir)
                .map_err(|e| SpinError::io(format!("create {}", log_dir.display()), e))?;
            let appender = rolling::daily(log_dir, "spindb.log");
            let (writer, guard) = non_blocking(appender);
            let file_layer = fmt::Layer::new().with_writer(writer).with_target(true).with_ansi(false);
            if console {
                let console_layer = fmt::Layer::new().with_writer(std::io::stderr).with_target(false);
                registry
                    .with(file_layer)
                    .with(console_layer)
                    .try_init()
                    .map_err(|e| SpinError::precondition(format!("logging already initialized: {e}")))?;
            } else {
                registry
                    .with(file_layer)
                    .try_init()
                    .map_err(|e| SpinError::precondition(format!("logging already initialized: {e}")))?;
            }
            Ok(Some(guard))
        }
        (false, true) => {
            let console_layer = fmt::Layer::new().with_writer(std::io::stderr).with_target(false);
            registry
                .with(console_layer)
                .try_init()
                .map_err(|e| SpinError::precondition(format!("logging already initialized: {e}")))?;
            Ok(None)
        }
        (false, false) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_includes_modules() {
        let config = LoggingConfig::default();
        let directive = config.filter_directive();
        assert!(directive.starts_with("info"));
        assert!(directive.contains("reqwest=warn"));
    }
}
