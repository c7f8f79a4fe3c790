use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::handler::{get_jobs, get_main_wallet, health_check, AppState};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // Read-only ops endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/main-wallet", get(get_main_wallet))
                .route("/jobs", get(get_jobs)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
