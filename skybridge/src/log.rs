use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

/// Installs the global tracing subscriber.
///
/// The directive follows the `EnvFilter` syntax (e.g.
/// `info,skybridge=debug`); when absent, `info` is used.
pub fn init(directive: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(directive.unwrap_or(DEFAULT_DIRECTIVE)).context("invalid log directive")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))?;

    Ok(())
}
