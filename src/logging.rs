use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::fmt;

/// Logs go to stderr; stdout carries command output. Without `verbose` only
/// warnings (degraded OCR, skipped patches, timeouts) are shown.
pub fn init(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install logger: {}", err))
}
