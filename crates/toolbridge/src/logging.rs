//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr so stdout stays clean for command output.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        "toolbridge=debug,toolbridge_mcp=debug"
    } else {
        "toolbridge=info,toolbridge_mcp=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
