//! Tracing subscriber setup for binaries and tests embedding the library.

use crate::{Error, Result};

/// Install a fmt subscriber filtered by `RUST_LOG` (INFO by default), writing to stderr.
///
/// # Errors
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::InvalidConfig(format!("Failed to initialize tracing subscriber: {e}")))
}
