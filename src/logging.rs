use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Default filter for the harvest binary when `RUST_LOG` is unset. sqlx logs
/// every statement at info, which drowns the per-profile lines.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,reqwest=warn";

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// The caller provides a fallback filter string that is used when `RUST_LOG` is
/// not set. `verbose` bumps this crate to debug without touching dependencies.
pub fn init_tracing(default_filter: &str, verbose: bool) -> Result<(), anyhow::Error> {
    let fallback = if verbose {
        format!("{default_filter},profile_harvest=debug")
    } else {
        default_filter.to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
