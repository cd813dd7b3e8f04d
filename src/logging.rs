use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

pub const LOG_ENV: &str = "THREAD_TRACKER_LOG";

/// Installs the global subscriber. `THREAD_TRACKER_LOG` wins over the
/// configured level. A subscriber that is already installed is left alone.
pub fn init(cfg: &LogConfig) -> Result<()> {
    let filter = filter(cfg);
    match cfg.file.as_ref() {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("logging: create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
        }
    }
    Ok(())
}

fn filter(cfg: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        let level = if cfg.level.trim().is_empty() {
            "info"
        } else {
            cfg.level.as_str()
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_target_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("tracker.log");
        init(&LogConfig {
            level: "debug".into(),
            file: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        // A second install is a no-op rather than an error.
        init(&LogConfig::default()).unwrap();
    }
}
