mod error;
mod api;
mod execution;
mod ledger;
mod reputation;
mod settlement;
mod wallet;
mod server;
mod bootstrap;
mod config;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::info;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,broker=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting PRL broker settlement engine");

    let config = config::Config::from_env()?;

    let service = bootstrap::initialize_service(&config).await?;

    // Settlement jobs run in the background for the life of the process
    let _jobs = service.scheduler.start();

    // Create HTTP server
    let app = server::create_app(service.state);

    // Run the Server
    server::run_server(app, &config.bind_address).await?;

    Ok(())
}
