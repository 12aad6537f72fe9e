use crate::Result;

/// Initialize tracing for the process.
///
/// Default: info for our crates, warn for everything else. Can be overridden with
/// `RUST_LOG`. Calling this twice is harmless (the second subscriber is ignored).
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,twm=info,twm_core=info,twm_bridge=info,twm_catbox=info,twm_telegram=info,{}=info",
            service_name.replace('-', "_")
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init();

    Ok(())
}
