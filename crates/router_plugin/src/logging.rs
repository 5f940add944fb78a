use tracing_subscriber::EnvFilter;

/// Tracing for plugin processes.
///
/// Plugins write their logs to stderr, which the router redirects into the
/// plugin's log file. `RUST_LOG` overrides the default `info` level.
pub fn init_plugin_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // a second call (tests, embedded use) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
