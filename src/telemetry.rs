//! Logging setup for the binary.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! job of the executable. Verbosity is driven by `RUST_LOG`, e.g.
//! `RUST_LOG=bundle_processor=debug`.

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`.
///
/// Logs go to stderr so stdout stays reserved for the response Bundle.
/// Calling it twice is harmless.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
