use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    path::Path,
    sync::Mutex,
};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Lets the level chosen in settings take over once settings are loaded.
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned: bool,
}

impl LogHandle {
    /// Switches to `level` unless `--verbose` or RUST_LOG already decided.
    pub fn apply_level(&self, level: &str) {
        if self.pinned {
            return;
        }
        let Some(directive) = directive_for(level) else {
            tracing::warn!("unknown log_level {level:?}; keeping info");
            return;
        };
        if let Err(err) = self.handle.reload(EnvFilter::new(directive)) {
            tracing::warn!("could not change log level: {err}");
        }
    }
}

/// Logs to stderr and appends plain text to `log_path`.
pub fn init(verbose: bool, log_path: &Path) -> Result<LogHandle> {
    let from_env = std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if from_env {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };
    let (filter, handle) = reload::Layer::new(filter);

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("create log dir")?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();

    Ok(LogHandle {
        handle,
        pinned: verbose || from_env,
    })
}

fn directive_for(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARN" | "WARNING" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        "OFF" => Some("off"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_levels_map_to_directives() {
        assert_eq!(directive_for("INFO"), Some("info"));
        assert_eq!(directive_for("warning"), Some("warn"));
        assert_eq!(directive_for("CRITICAL"), Some("error"));
        assert_eq!(directive_for("loud"), None);
    }
}
