pub(crate) mod ai;
mod cli;
pub(crate) mod cluster;
pub(crate) mod embed;
mod error;
pub(crate) mod ingest;
mod logging;
pub(crate) mod monitor;
pub(crate) mod pipeline;
pub(crate) mod report;
pub(crate) mod retry;
pub(crate) mod store;

pub(crate) use error::{AppError, AppResult};

use clap::Parser;
use tracing::error;

use crate::cli::{Cli, GetVerbosity};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::setup_logger(cli.cmd.get_verbosity().tracing_level_filter());

    if let Err(e) = cli.cmd.run().await {
        error!("{e}");
        std::process::exit(1);
    }
}
