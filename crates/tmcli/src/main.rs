use std::io::{self, IsTerminal, Read};
use std::process;

use anyhow::Result;
use tracing::{error, info};

use clap::Parser;
use tmcli::app::App;
use tmcli::{Cli, Commands};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    info!("Starting tmcli v{}", env!("CARGO_PKG_VERSION"));

    let app = App::create(&cli)?;

    // Handle subcommands first
    if let Some(command) = cli.command {
        match command {
            Commands::Login => tmcli::commands::login::execute(&app).await?,
            Commands::Logout => tmcli::commands::login::logout(&app)?,
            Commands::Models => tmcli::commands::models::execute(&app).await?,
        }
        return Ok(());
    }

    let prompt = match cli.prompt {
        Some(prompt) => prompt,
        None => {
            // Read from stdin if no prompt provided
            let mut stdin = io::stdin();
            if stdin.is_terminal() {
                anyhow::bail!("No input provided. Use -p/--prompt or pipe input.");
            }
            let mut input = String::new();
            stdin.read_to_string(&mut input)?;
            input
        }
    };
    let prompt = prompt.trim();
    if prompt.is_empty() {
        anyhow::bail!("No input provided. Use -p/--prompt or pipe input.");
    }

    app.run_prompt(prompt, !cli.no_stream).await
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
