use tracing_subscriber::EnvFilter;

/// Fmt subscriber with env-driven filtering. Our own modules default to
/// info; everything else stays quiet unless RUST_LOG raises it.
pub fn init_tracing() {
    let default_directive = concat!(env!("CARGO_CRATE_NAME"), "=info");
    let filter = EnvFilter::from_default_env().add_directive(
        default_directive
            .parse()
            .unwrap_or_else(|_| "info".parse().unwrap()),
    );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
