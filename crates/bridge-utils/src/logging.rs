use tracing_subscriber::EnvFilter;

/// Installs a process-wide `tracing` subscriber reading `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once; only the first call
/// takes effect.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
