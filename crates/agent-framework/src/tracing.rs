//! # Tracing Setup
//!
//! One-call initialisation of structured logging for the whole process.
//!
//! Services log with structured fields rather than formatted strings, so filtering and
//! grepping stay cheap:
//!
//! ```text
//! INFO State changed service=Config from=Not Running to=Normal
//! WARN Dependency wait timed out service=State pending=["Integrations"] timeout=10s
//! WARN Service exited; restarting supervisor=Fieldbus service=Modbus failures=1.0
//! ```
//!
//! Levels: lifecycle transitions at `info`, recoverable faults and back-off at `warn`,
//! per-message traffic at `debug`, bus internals at `trace`.
//!
//! ```bash
//! RUST_LOG=info edge-agent
//! RUST_LOG=edge_agent=debug,agent_framework=info edge-agent
//! ```

use tracing_subscriber::EnvFilter;

/// Initialises the global subscriber from `RUST_LOG`.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}

/// Like [`setup_tracing`], but falls back to `default_directive` when `RUST_LOG` is unset
/// or unparsable. Safe to call more than once; later calls are ignored.
pub fn setup_tracing_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
