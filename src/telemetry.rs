//! Logging and metric setup for binaries embedding the memory core
//!
//! The library itself only emits `tracing` events and `metrics` samples;
//! installing a subscriber or a recorder is left to the process.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const RELOCATIONS_TOTAL: &str = "photondb_memory_relocations_total";
pub const MP_ROUNDS_TOTAL: &str = "photondb_memory_mp_rounds_total";
pub const POOL_BYTES: &str = "photondb_memory_pool_bytes";

/// Installs a global stdout subscriber. `RUST_LOG` directives win over
/// `log_level`.
pub fn init_tracing(log_level: &str, json: bool, ansi: bool) -> anyhow::Result<()> {
    let level = log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stdout).with_ansi(ansi))
            .with(filter)
            .try_init()?;
    }
    Ok(())
}

/// Registers descriptions for every metric the memory core emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        RELOCATIONS_TOTAL,
        "Objects moved to fill a hole left by a free"
    );
    metrics::describe_counter!(
        MP_ROUNDS_TOTAL,
        "Barrier rounds completed by the lowest site in MP memory"
    );
    metrics::describe_gauge!(
        POOL_BYTES,
        metrics::Unit::Bytes,
        "Bytes held by a memory context's pools"
    );
}
