use tracing_subscriber::EnvFilter;

/// Initialize structured logging on standard error.
///
/// Uses `RUST_LOG` if set, otherwise `default_level`. Standard output is left
/// alone because several tools stream their data through it.
pub fn init(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
