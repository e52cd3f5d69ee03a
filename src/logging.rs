use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};

pub const LOG_FILE_NAME: &str = "queue.log";

/// Install the global subscriber: stderr plus `<log_dir>/queue.log`.
///
/// `RUST_LOG` takes precedence over the configured `log_level`.
pub fn init(config: &QueueConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir)?;
    let log_path = config.log_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            QueueError::Config(format!("invalid log_level {:?}: {}", config.log_level, e))
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .map_err(|e| QueueError::Config(format!("logging already initialized: {e}")))?;

    Ok(())
}
