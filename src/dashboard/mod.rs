//! Axum-based status API over the running monitor.
//!
//! Provides:
//!   GET  /api/status   → JSON monitor status (state, listening, last error, counts)
//!   GET  /api/feed     → JSON transfer feed, newest first
//!   POST /api/refresh  → re-run the historical sync

use crate::monitor::{MonitorHandle, MonitorState};
use crate::onchain::types::TransferRecord;
use crate::registry::chain_name;

use alloy::primitives::Address;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tracing::{info, warn};

/// Shared state for the dashboard routes.
#[derive(Clone)]
pub struct DashboardState {
    pub monitor: MonitorHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub state: MonitorState,
    pub is_listening: bool,
    pub last_error: Option<String>,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub chain_name: Option<String>,
    pub monitored_tokens: usize,
    pub open_subscriptions: usize,
    pub feed_len: usize,
}

/// Build the Axum router.
pub fn build_router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/feed", get(api_feed))
        .route("/api/refresh", post(api_refresh))
        .with_state(state)
}

/// Start the dashboard server.
pub async fn serve(state: DashboardState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "dashboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// --- API Handlers ---

async fn api_status(State(state): State<DashboardState>) -> Json<StatusResponse> {
    let view = state.monitor.view();
    Json(StatusResponse {
        state: view.state,
        is_listening: view.is_listening,
        last_error: view.last_error,
        account: view.account,
        chain_id: view.chain_id,
        chain_name: view.chain_id.map(chain_name),
        monitored_tokens: view.monitored_tokens,
        open_subscriptions: view.open_subscriptions,
        feed_len: view.feed.len(),
    })
}

async fn api_feed(State(state): State<DashboardState>) -> Json<Vec<TransferRecord>> {
    Json(state.monitor.view().feed)
}

async fn api_refresh(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.monitor.refresh() {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!(error = %e, "refresh request failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
