use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        handler::{
            consume_hold, create_recharge, get_balance, get_history, get_hold, get_recharge,
            health_check, mark_recharge_paid, open_hold, reconcile_client, register_client,
            release_hold, run_sweep, AppState,
        },
        webhook::pix_webhook,
    },
    config::Config,
    middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer},
};

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // PSP webhooks get their own limiter so a retry storm cannot starve the API.
    let webhooks = Router::new()
        .route("/webhook/pix", post(pix_webhook))
        .route_layer(from_fn_with_state(
            RateLimitLayer::per_minute(config.webhook_rate_limit_per_minute),
            rate_limit_middleware,
        ));

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Client accounts
                .route("/clients", post(register_client))
                .route("/clients/:id/balance", get(get_balance))
                .route("/clients/:id/history", get(get_history))
                .route("/clients/:id/reconcile", get(reconcile_client))
                // Holds (label lifecycle)
                .route("/holds", post(open_hold))
                .route("/holds/:reference", get(get_hold))
                .route("/holds/:reference/consume", post(consume_hold))
                .route("/holds/:reference/release", post(release_hold))
                // Recharges
                .route("/recharges", post(create_recharge))
                .route("/recharges/:id", get(get_recharge))
                // Admin endpoints
                .route("/admin/recharges/:id/mark-paid", post(mark_recharge_paid))
                .route("/admin/sweep", post(run_sweep))
                .merge(webhooks),
        )
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(&config.cors_origins()))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown signal received");
}
