use axum::{extract::State, http::StatusCode, Json};
use tracing::{info, warn};

use super::handler::AppState;
use super::models::PixWebhookResponse;
use crate::recharge::{PixNotification, PixOutcome};

/// POST /webhook/pix
///
/// Every txid is confirmed through the same `mark_paid` path as manual
/// reconciliation. Redelivery is harmless, so a notification with any
/// retryable failure is answered 503 to make the PSP send it again.
pub async fn pix_webhook(
    State(state): State<AppState>,
    Json(notification): Json<PixNotification>,
) -> (StatusCode, Json<PixWebhookResponse>) {
    let received = notification.pix.len();
    info!("📨 PIX notification with {} payment(s)", received);

    let results = state.reconciler.process_pix(notification).await;

    for result in &results {
        if let PixOutcome::Rejected { error, .. } = &result.outcome {
            warn!("PIX {} rejected: {}", result.txid, error);
        }
    }

    let status = if results.iter().any(|r| r.is_retryable()) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(PixWebhookResponse { received, results }))
}
