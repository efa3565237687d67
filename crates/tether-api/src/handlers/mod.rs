//! HTTP API handlers. Read-only views of the engine plus tunnel teardown.

pub mod hostmap;
pub mod status;

use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::http::StatusCode;
use tokio::sync::mpsc;

use tether_engine::{Interface, Outbox};

#[derive(Clone)]
pub struct ApiState {
    pub interface: Arc<Interface>,
    /// Effects produced by API-driven engine calls, flushed by the daemon.
    pub outbox_tx: mpsc::UnboundedSender<Outbox>,
    /// Shutdown broadcast sender. Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn parse_vpn_ip(s: &str) -> Result<Ipv4Addr, (StatusCode, String)> {
    s.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid overlay address: {s}")))
}

pub use hostmap::{handle_host_close, handle_host_inspect, handle_hostmap, handle_pending};
pub use status::{handle_shutdown, handle_status};
