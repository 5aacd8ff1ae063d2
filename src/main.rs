use lexrag_agent::handlers::create_app_router;
use lexrag_agent::init::app_init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting legal RAG server...");
    let (config, state) = app_init().await?;
    log::info!("✅ Application state initialized");
    let app = create_app_router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("📡 Generate (NDJSON): http://{}/generate", addr);
    log::info!("📡 Generate (SSE):    http://{}/generate/stream", addr);
    log::info!("❤️  Health: http://{}/health", addr);
    log::info!("");
    log::info!("📚 Index: {}", config.index_path.display());
    log::info!(
        "🔎 top_k={} context_limit={} chars",
        config.retrieval.top_k,
        config.retrieval.max_context_length
    );
    log::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
