use clap::Parser;
use log::{error, info};
use server::gateway::Gateway;
use server::store::MemoryStore;
use std::sync::Arc;

const SECRET_ENV: &str = "PONG_TOKEN_SECRET";

/// Main-method of the application.
/// Parses command-line arguments, then runs the realtime gateway until
/// Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Token signing secret (falls back to PONG_TOKEN_SECRET)
        #[clap(short, long)]
        secret: Option<String>,
    }

    let args = Args::parse();
    let secret = args
        .secret
        .or_else(|| std::env::var(SECRET_ENV).ok())
        .unwrap_or_else(|| {
            error!("no token secret configured, using the insecure default");
            "insecure-dev-secret".to_string()
        });

    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(Gateway::new(store, &secret));

    let address = format!("{}:{}", args.host, args.port);
    let server_handle = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway.run(&address).await {
                error!("gateway exited: {}", e);
            }
        })
    };

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                error!("gateway task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
