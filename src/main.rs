use anyhow::Result;
use clap::Parser;
use tracing::info;

use lanlink::cli::{Cli, handle_command};
use lanlink::utils::{level_for, setup_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(level_for(cli.verbose))
        .map_err(|e| anyhow::anyhow!("Logging setup failed: {}", e))?;
    info!("Starting lanlink {}", env!("CARGO_PKG_VERSION"));

    handle_command(cli).await
}
