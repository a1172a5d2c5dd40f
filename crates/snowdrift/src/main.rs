//! Snowdrift CLI: loads an event stream from stdin into Snowflake.

use std::process::ExitCode;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};

use snowdrift::{CliArgs, Config, Loader, init_metrics, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(address) = &config.metrics_address {
        if let Err(e) = init_metrics(address) {
            error!("error: {e}");
            return ExitCode::FAILURE;
        }
        info!("Serving metrics on {address}");
    }

    let loader = match Loader::from_config(config).await {
        Ok(loader) => loader,
        Err(e) => {
            error!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let input = BufReader::new(tokio::io::stdin());
    match loader.run(input, tokio::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
