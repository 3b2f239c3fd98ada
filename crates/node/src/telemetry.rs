//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber: env-filtered fmt output,
/// defaulting to info with debug for the workspace crates. Safe to call
/// more than once (later calls are no-ops), so tests can share it.
pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "info,concord_node=debug,concord_raft=debug,concord_pbft=debug,\
             concord_lock=debug,concord_data=debug",
        )
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
