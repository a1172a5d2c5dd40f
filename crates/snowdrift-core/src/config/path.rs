//! Command line arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(version, about = "Load line-delimited SCHEMA/RECORD/STATE events into Snowflake")]
pub struct CliArgs {
    /// Path to the JSON or YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
