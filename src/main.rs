use anyhow::Result;
use clap::Parser;

use cachefront::{cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log_format, settings.log_file_path.as_deref())?;
    run(settings).await
}
