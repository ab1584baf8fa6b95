//! Zephyr CI CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;

mod commands;
mod config;

#[derive(Parser)]
#[command(name = "zephyr")]
#[command(author, version, about = "Zephyr CI command-line interface", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zephyr=info,warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match commands::dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}
