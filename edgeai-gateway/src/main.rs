//! EdgeAI Gateway - local HTTP front end for an on-device inference engine.

use std::env;
use std::sync::Arc;

use edgeai_gateway::engine::OllamaBinding;
use edgeai_gateway::{build_router, AppState, Config};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!(
        "edgeai-gateway {} ({})",
        VERSION,
        option_env!("GIT_HASH").unwrap_or("unknown")
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }

    // Load configuration
    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Check config.toml or the EDGEAI__* environment variables.",
            e
        )
    })?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting edgeai-gateway {}", VERSION);

    let binding = Arc::new(OllamaBinding::new(&config.engine.ollama.base_url));
    tracing::info!(
        "Using Ollama engine binding at {}",
        config.engine.ollama.base_url
    );

    let state = Arc::new(AppState::new(config.clone(), binding));
    if state.registry.all().is_empty() {
        tracing::warn!("No models registered; inference requests will report no model available");
    }
    for model in state.registry.all() {
        tracing::info!(
            model = %model.name,
            engine_model = model.engine_model(),
            image = model.supports_image,
            audio = model.supports_audio,
            "Registered model"
        );
    }

    // Evict stored images
    match config.images.retention() {
        Some(retention) => {
            state
                .images
                .spawn_retention(retention, config.images.purge_interval());
            tracing::info!(
                "Purging stored images older than {}s from {}",
                retention.as_secs(),
                state.images.root().display()
            );
        }
        None => tracing::info!("Stored image eviction disabled"),
    }

    let app = build_router(state);

    // Start server
    let addr = config.bind_addr();
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
