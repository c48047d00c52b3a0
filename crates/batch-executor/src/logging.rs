//! Tracing subscriber setup for binaries embedding the executor.

use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "batch_executor=info,batch_workspace=info,batch_core=info";

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_tracing(default_filter: &str) -> bool {
    Registry::default()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(fmt::layer().with_target(true).with_level(true))
        .try_init()
        .is_ok()
}
