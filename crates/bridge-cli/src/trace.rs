use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `fmt` subscriber on stderr filtered by `RUST_LOG`.
///
/// Without `RUST_LOG` everything is shown down to `info`, guest logs
/// (target `embed_bridge::guest`) included.
pub fn init_tracing() -> anyhow::Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let envfilter = env_filter(rust_log.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(envfilter),
        )
        .try_init()
        .context("failed to install tracing subscriber")
}

fn env_filter(rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    match rust_log {
        Some(directives) => builder
            .parse(directives)
            .with_context(|| format!("invalid {}: {directives}", EnvFilter::DEFAULT_ENV)),
        None => Ok(builder.parse_lossy("")),
    }
}
