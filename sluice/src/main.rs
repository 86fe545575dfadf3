use clap::Parser;

use sluice::cli::{Cli, Command};
use sluice::{commands, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load `.env` before clap reads its env fallbacks
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _log_guard = logging::init_logging(cli.log.as_deref(), cli.log_dir.as_deref())?;

    let upstream = cli.upstream.to_config();
    match cli.command {
        Command::Serve(args) => commands::serve::run(args, upstream).await,
        Command::Download(args) => commands::download::run(args, upstream).await,
    }
}
