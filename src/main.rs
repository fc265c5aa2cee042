use clap::Parser;
use cvm::cli::{self, Commands};
use cvm::commands;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // Only use colors when outputting to a TTY (not when piped to file)
    let use_color = atty::is(atty::Stream::Stderr);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.cmd {
        Commands::Run(args) => commands::cmd_run(args).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
