use credit_ledger::{bootstrap, config::Config, server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,credit_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before reading RUST_LOG
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting prepaid credit ledger");

    let config = Config::from_env()?;
    let app = bootstrap::initialize_app(&config).await?;

    let router = server::create_app(app.state, &config);
    server::run_server(router, &config.bind_address).await?;

    app.sweep_task.abort();
    info!("👋 Server stopped");
    Ok(())
}
