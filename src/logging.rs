//! Tracing subscriber setup for binaries.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber on stderr.
///
/// `RUST_LOG` wins when set; otherwise events at `level` and above from this
/// crate are shown. When a subscriber is already installed it is kept.
pub fn init(level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!("warn,instrument_model={}", level)),
    };

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
}
