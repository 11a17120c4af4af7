mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn setup_tracing() {
  // Can be overridden by RUST_LOG env variable
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("connhold=info"));
  tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<()> {
  setup_tracing();
  let cli_args = Cli::parse();

  match cli_args.command {
    Commands::Run(run_args) => commands::run::run_load(run_args).await,
  }
}
