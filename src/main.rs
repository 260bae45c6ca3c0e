use clap::{Parser, Subcommand};
use llm_gateway::{Config, Server};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(about = "Budget-enforcing gateway for OpenAI- and Anthropic-compatible providers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run store migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .init();

    if let Some(Commands::Migrate) = cli.command {
        match llm_gateway::storage::connect(&config.store).await {
            Ok(store) => {
                if let Err(e) = store.migrate().await {
                    error!("migration failed: {e}");
                    std::process::exit(1);
                }
                info!("migrations complete");
            }
            Err(e) => {
                error!("failed to connect to store: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    info!("starting llm-gateway");

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
