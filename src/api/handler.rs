use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult, HoldError, LedgerError, RechargeError},
    holds::HoldManager,
    ledger::{models::*, Ledger},
    middleware::{OptionalValidatedJson, ValidatedJson},
    recharge::RechargeReconciler,
    sweeper::{ExpirySweeper, SweepSummary},
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub holds: Arc<HoldManager>,
    pub reconciler: Arc<RechargeReconciler>,
    pub sweeper: Arc<ExpirySweeper>,
    /// "postgres" or "memory"
    pub store_kind: &'static str,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store_reachable = match state.ledger.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check: ledger store unreachable: {}", e);
            false
        }
    };

    let status = if store_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if store_reachable { "healthy" } else { "degraded" }.to_string(),
            timestamp: state.ledger.now(),
            store: state.store_kind.to_string(),
            store_reachable,
        }),
    )
}

// ========== CLIENTS ==========

/// POST /clients
pub async fn register_client(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<RegisterClientRequest>,
) -> AppResult<(StatusCode, Json<ClientAccount>)> {
    let client_id = request.client_id.unwrap_or_else(Uuid::new_v4);
    let account = state
        .ledger
        .register_client(client_id, request.display_name)
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// GET /clients/:id/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> AppResult<Json<BalanceSnapshot>> {
    Ok(Json(state.ledger.snapshot(client_id).await?))
}

/// GET /clients/:id/history?from&to&after&limit
pub async fn get_history(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryResponse>> {
    if state.ledger.client(client_id).await?.is_none() {
        return Err(LedgerError::UnknownClient(client_id).into());
    }

    let limit = query.limit();
    let mut history = state
        .ledger
        .history(client_id, query.range()?)
        .with_page_size(limit);
    if let Some(cursor) = query.cursor()? {
        history = history.resume_after(cursor);
    }

    let entries: Vec<LedgerEntry> = history
        .stream()
        .take(limit as usize)
        .try_collect()
        .await?;

    let next_cursor = (entries.len() as i64 == limit)
        .then(|| entries.last().map(|e| encode_cursor(&e.cursor())))
        .flatten();

    Ok(Json(HistoryResponse {
        client_id,
        entries,
        next_cursor,
    }))
}

/// GET /clients/:id/reconcile
pub async fn reconcile_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> AppResult<Json<Reconciliation>> {
    Ok(Json(state.ledger.verify_balance(client_id).await?))
}

// ========== HOLDS ==========

/// POST /holds
pub async fn open_hold(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<OpenHoldRequest>,
) -> AppResult<(StatusCode, Json<Hold>)> {
    let hold = state
        .holds
        .open_hold(request.client_id, &request.reference, request.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(hold)))
}

/// GET /holds/:reference
pub async fn get_hold(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> AppResult<Json<Hold>> {
    state
        .holds
        .hold(&reference)
        .await?
        .map(Json)
        .ok_or_else(|| HoldError::NotFound(reference).into())
}

/// POST /holds/:reference/consume
///
/// Called when the carrier reports the label as dispatched.
pub async fn consume_hold(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> AppResult<Json<HoldTransition>> {
    Ok(Json(state.holds.consume(&reference).await?))
}

/// POST /holds/:reference/release
pub async fn release_hold(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    ValidatedJson(request): ValidatedJson<ReleaseHoldRequest>,
) -> AppResult<Json<HoldTransition>> {
    Ok(Json(state.holds.release(&reference, request.reason).await?))
}

// ========== RECHARGES ==========

/// POST /recharges
pub async fn create_recharge(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateRechargeRequest>,
) -> AppResult<(StatusCode, Json<Recharge>)> {
    let recharge = state
        .reconciler
        .create_recharge(
            &request.recharge_id,
            request.client_id,
            request.amount,
            request.source,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(recharge)))
}

/// GET /recharges/:id
pub async fn get_recharge(
    State(state): State<AppState>,
    Path(recharge_id): Path<String>,
) -> AppResult<Json<Recharge>> {
    Ok(Json(state.reconciler.recharge(&recharge_id).await?))
}

/// POST /admin/recharges/:id/mark-paid
///
/// Manual reconciliation. A duplicate confirmation is reported, not failed.
/// The body is optional; `paid_at` defaults to now.
pub async fn mark_recharge_paid(
    State(state): State<AppState>,
    Path(recharge_id): Path<String>,
    OptionalValidatedJson(request): OptionalValidatedJson<MarkPaidRequest>,
) -> AppResult<Json<MarkPaidResponse>> {
    let paid_at = request
        .and_then(|request| request.paid_at)
        .unwrap_or_else(|| state.ledger.now());
    info!("Manual confirmation for recharge {}", recharge_id);

    match state.reconciler.mark_paid(&recharge_id, paid_at).await {
        Ok(recharge) => Ok(Json(MarkPaidResponse {
            recharge,
            already_processed: false,
        })),
        Err(AppError::Recharge(RechargeError::AlreadyProcessed { .. })) => {
            Ok(Json(MarkPaidResponse {
                recharge: state.reconciler.recharge(&recharge_id).await?,
                already_processed: true,
            }))
        }
        Err(e) => Err(e),
    }
}

// ========== SWEEP ==========

/// POST /admin/sweep
pub async fn run_sweep(State(state): State<AppState>) -> AppResult<Json<SweepResponse>> {
    let swept_at = state.ledger.now();
    let results = state.sweeper.sweep(swept_at).await?;

    Ok(Json(SweepResponse {
        swept_at,
        summary: SweepSummary::of(&results),
        results,
    }))
}
