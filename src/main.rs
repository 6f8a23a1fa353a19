use anyhow::Result;
use clap::Parser;
use expensa::cli::Cli;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    cli.run().await
}

/// Log to stderr so command output on stdout stays parseable.
/// `RUST_LOG` takes precedence over `--verbose`.
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "expensa=debug" } else { "expensa=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter),
        )
        .init();
}
