//! Daemon status and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    name: String,
    vpn_ip: String,
    vpn_network: String,
    hosts: usize,
    pending: usize,
    tracked_flows: usize,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Tether Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Name             : {}", resp.name);
    println!("  Overlay address  : {}", resp.vpn_ip);
    println!("  Overlay network  : {}", resp.vpn_network);
    println!("  Tunnels          : {}", resp.hosts);
    println!("  Handshaking      : {}", resp.pending);
    println!("  Tracked flows    : {}", resp.tracked_flows);

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse =
        post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
