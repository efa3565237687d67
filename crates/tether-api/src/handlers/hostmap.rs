//! /hostmap handlers. Host inspection and tunnel teardown.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use tether_engine::hostmap::HostMapError;
use tether_engine::{EngineError, HostSnapshot, Outbox};

use super::{parse_vpn_ip, ApiState};

// ── /hostmap ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HostListResponse {
    pub hosts: Vec<HostSnapshot>,
}

pub async fn handle_hostmap(State(state): State<ApiState>) -> Json<HostListResponse> {
    let hosts = state.interface.hostmap().snapshot(Instant::now());
    Json(HostListResponse { hosts })
}

pub async fn handle_pending(State(state): State<ApiState>) -> Json<HostListResponse> {
    let hosts = state.interface.hostmap().pending_snapshot(Instant::now());
    Json(HostListResponse { hosts })
}

// ── /hostmap/{vpn_ip} (GET) ──────────────────────────────────────────────────

pub async fn handle_host_inspect(
    State(state): State<ApiState>,
    Path(vpn_ip): Path<String>,
) -> Result<Json<HostSnapshot>, (StatusCode, String)> {
    let addr = parse_vpn_ip(&vpn_ip)?;
    let host = state
        .interface
        .hostmap()
        .lookup(addr)
        .ok_or((StatusCode::NOT_FOUND, "host not found".to_string()))?;

    Ok(Json(host.snapshot(Instant::now())))
}

// ── /hostmap/{vpn_ip} (DELETE) ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct CloseResponse {
    pub vpn_ip: String,
    pub closed: bool,
}

pub async fn handle_host_close(
    State(state): State<ApiState>,
    Path(vpn_ip): Path<String>,
) -> Result<Json<CloseResponse>, (StatusCode, String)> {
    let addr = parse_vpn_ip(&vpn_ip)?;
    let mut out = Outbox::new();

    let closed = match state.interface.close_tunnel(addr, &mut out) {
        Ok(()) => true,
        Err(EngineError::HostMap(HostMapError::NotFound(_))) => false,
        Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    if !out.is_empty() && state.outbox_tx.send(out).is_err() {
        tracing::warn!(%addr, "datagram flusher gone, close notice not sent");
    }
    if closed {
        tracing::info!(vpn_ip = %addr, "tunnel closed via API");
    }

    Ok(Json(CloseResponse { vpn_ip, closed }))
}
