use anyhow::Result;
use clap::{Parser, Subcommand};
use gemini_chat::commands;
use gemini_chat::config::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gemini-chat")]
#[command(version)]
#[command(about = "Chat with Gemini from the terminal", long_about = None)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat (default)
    Chat {
        /// File to attach to the first prompt
        #[arg(long)]
        attach: Option<PathBuf>,
    },
    /// Run the same-origin proxy that holds the API key
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Save an API key to the config file
    Key { key: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "gemini_chat=debug" } else { "gemini_chat=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load()?;

    match cli.command {
        None => commands::run_chat(config, None).await,
        Some(Commands::Chat { attach }) => commands::run_chat(config, attach.as_deref()).await,
        Some(Commands::Serve { port }) => commands::run_server(config, port).await,
        Some(Commands::Key { key }) => commands::save_api_key(config, &key),
    }
}
