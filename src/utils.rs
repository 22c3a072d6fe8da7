use std::fmt::Display;
use std::time::Duration;

use console::Style;
use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const ANSI_BLUE: Style = Style::new().blue();

/// Install the global subscriber. Log lines are routed through the progress
/// bars so they don't tear them. `RUST_LOG` overrides the default filter.
pub fn init_logging() -> anyhow::Result<()> {
    let indicatif = IndicatifLayer::new();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("assetflow=info"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}

pub(crate) fn get_style_build() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("=>-"))
}

pub(crate) fn get_style_task() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?)
}

pub(crate) fn as_overhead(duration: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", duration.as_millis()))
}
