use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for a vault binary. Verbosity is
/// driven by `RUST_LOG`, defaulting to `info` for our crates.
pub fn install() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,actix_web=warn,rustls=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
