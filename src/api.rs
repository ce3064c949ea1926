//! Control API.
//!
//! Small axum surface consumed by the dashboard: status read, manual full
//! sync, the guarded reset-to-chain, and per-market pause/resume. Read
//! paths go straight to the store and never block the quote loop.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RuntimeSettings;
use crate::inventory::InventoryHandle;
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::types::{GlobalStatus, MarketStatus, MmRecord, QuoteEventKind};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub reconciler: Arc<Reconciler>,
    pub inventory: InventoryHandle,
    pub degraded: Arc<parking_lot::Mutex<Vec<String>>>,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/sync", post(trigger_sync))
        .route("/reset-to-chain", post(reset_to_chain))
        .route("/markets/:id/pause", post(pause_market))
        .route("/markets/:id/resume", post(resume_market))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MarketStatusRow {
    market_id: String,
    mm_id: i64,
    status: MarketStatus,
    yes_inventory: f64,
    no_inventory: f64,
    avg_yes_cost: f64,
    avg_no_cost: f64,
    realized_pnl: f64,
    last_quote_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    global: GlobalStatus,
    started_at: DateTime<Utc>,
    markets: Vec<MarketStatusRow>,
}

/// Operator-visible per-market state, derived from the record plus the
/// most recent history event.
pub fn derive_market_status(
    mm: &MmRecord,
    hours_to_end: Option<f64>,
    last_event: Option<(QuoteEventKind, serde_json::Value)>,
    now: DateTime<Utc>,
) -> MarketStatus {
    if mm.paused {
        return MarketStatus::PausedManual;
    }
    if let Some(until) = mm.state.volatility_pause_until {
        if until > now {
            return MarketStatus::PausedVolatility;
        }
    }
    if let Some(h) = hours_to_end {
        if h < mm.config.min_time_to_resolution_hours {
            return MarketStatus::PausedPreResolution;
        }
    }
    if let Some((QuoteEventKind::SanityCheckFailed, payload)) = last_event {
        let reason = payload
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        return MarketStatus::SanityFailing(reason);
    }
    MarketStatus::Active
}

pub fn derive_global_status(settings: &RuntimeSettings, degraded: &[String]) -> GlobalStatus {
    if settings.kill_switch_active {
        return GlobalStatus::Killed;
    }
    if !degraded.is_empty() {
        return GlobalStatus::Degraded(degraded.to_vec());
    }
    GlobalStatus::Running
}

async fn status(State(st): State<ApiState>) -> Result<Json<StatusResponse>, StatusCode> {
    let settings = st
        .store
        .load_settings()
        .ok()
        .flatten()
        .unwrap_or_default();
    let degraded = st.degraded.lock().clone();
    let now = Utc::now();

    let mms = st
        .store
        .list_active_mms()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut markets = Vec::with_capacity(mms.len());
    for mm in mms {
        let hours = st
            .store
            .get_market(&mm.market_id)
            .ok()
            .flatten()
            .and_then(|m| m.hours_to_end(now));
        let last_event = st
            .store
            .recent_events(mm.id, 1)
            .ok()
            .and_then(|mut v| v.pop())
            .map(|e| (e.kind, e.payload));
        markets.push(MarketStatusRow {
            market_id: mm.market_id.clone(),
            mm_id: mm.id,
            status: derive_market_status(&mm, hours, last_event, now),
            yes_inventory: mm.state.yes_inventory,
            no_inventory: mm.state.no_inventory,
            avg_yes_cost: mm.state.avg_yes_cost,
            avg_no_cost: mm.state.avg_no_cost,
            realized_pnl: mm.state.realized_pnl,
            last_quote_at: mm.state.last_quote_at,
        });
    }

    Ok(Json(StatusResponse {
        global: derive_global_status(&settings, &degraded),
        started_at: st.started_at,
        markets,
    }))
}

// ─────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ActionAck {
    ok: bool,
    detail: String,
}

async fn trigger_sync(State(st): State<ApiState>) -> Json<ActionAck> {
    info!("🔄 manual full sync requested");
    let reconciler = st.reconciler.clone();
    tokio::spawn(async move {
        if let Err(e) = reconciler.full_sync().await {
            warn!("manual full sync failed: {e}");
        }
    });
    Json(ActionAck {
        ok: true,
        detail: "full sync started".to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    confirmation: String,
}

async fn reset_to_chain(
    State(st): State<ApiState>,
    Json(req): Json<ResetRequest>,
) -> (StatusCode, Json<ActionAck>) {
    match st.reconciler.reset_to_chain(&req.confirmation).await {
        Ok(cleared) => (
            StatusCode::OK,
            Json(ActionAck {
                ok: true,
                detail: format!("reset complete; {cleared} tracked order(s) cleared"),
            }),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ActionAck {
                ok: false,
                detail: e.to_string(),
            }),
        ),
    }
}

async fn pause_market(
    State(st): State<ApiState>,
    Path(market_id): Path<String>,
) -> (StatusCode, Json<ActionAck>) {
    match st.store.get_mm_by_market(&market_id) {
        Ok(Some(mm)) => {
            st.inventory.pause(mm.id, "manual pause via API").await;
            (
                StatusCode::OK,
                Json(ActionAck {
                    ok: true,
                    detail: format!("{market_id} paused"),
                }),
            )
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(ActionAck {
                ok: false,
                detail: format!("no market maker for {market_id}"),
            }),
        ),
    }
}

async fn resume_market(
    State(st): State<ApiState>,
    Path(market_id): Path<String>,
) -> (StatusCode, Json<ActionAck>) {
    match st.store.get_mm_by_market(&market_id) {
        Ok(Some(mm)) => {
            st.inventory.resume(mm.id).await;
            (
                StatusCode::OK,
                Json(ActionAck {
                    ok: true,
                    detail: format!("{market_id} resumed"),
                }),
            )
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(ActionAck {
                ok: false,
                detail: format!("no market maker for {market_id}"),
            }),
        ),
    }
}
