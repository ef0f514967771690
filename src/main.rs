#[macro_use]
extern crate tracing;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use eyre::Result;
use tracing::Level;

use portwarp::app::App;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "portwarp.conf")]
    config: PathBuf,

    /// Address to bind local ports on, overrides 'bind' in the config.
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Log more, twice for everything.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_max_level(level)
        .init();

    match try_main(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    let app = App::load(cli.config, cli.bind).await?;
    app.run().await
}
