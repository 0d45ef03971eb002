use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polygraph_backend::api::{router, AppState};
use polygraph_backend::catalog::CatalogClient;
use polygraph_backend::llm::{ChatClient, OpenAiClient};
use polygraph_backend::middleware::logging::request_logging;
use polygraph_backend::middleware::rate_limit::{RateLimitConfig, RateLimiter};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("Polygraph backend starting");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let catalog = Arc::new(CatalogClient::from_env(http_client.clone()));

    let llm: Option<Arc<dyn ChatClient>> = match OpenAiClient::from_env(http_client) {
        Ok(client) => {
            info!(model = %client.model(), "Model client initialized");
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!("Model client unavailable ({e}); discovery requests will be rejected");
            None
        }
    };

    let limiter = RateLimiter::new(RateLimitConfig::from_env());
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        });
    }

    let state = AppState {
        catalog,
        llm,
        limiter,
    };

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging));

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn load_env() {
    let _ = dotenv::dotenv();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "polygraph=info,polygraph_backend=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
