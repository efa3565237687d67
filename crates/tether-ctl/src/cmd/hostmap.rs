//! Host map inspection and tunnel teardown.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, delete_json, get_json};

#[derive(Deserialize)]
struct HostList {
    hosts: Vec<Host>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct Host {
    vpn_ip: String,
    name: Option<String>,
    local_index: u32,
    remote_index: u32,
    remote: Option<String>,
    established: bool,
    session_id: Option<String>,
    messages_sent: u64,
    handshake_attempts: Option<u32>,
    idle_secs: u64,
    probing: bool,
    cert_not_after: Option<u64>,
    age_secs: u64,
}

fn print_host(h: &Host) {
    println!("  ┌─ {} ({})", h.vpn_ip, h.name.as_deref().unwrap_or("unverified"));
    println!("  │  remote      : {}", h.remote.as_deref().unwrap_or("-"));
    println!("  │  indexes     : local {} / remote {}", h.local_index, h.remote_index);
    if let Some(id) = &h.session_id {
        println!("  │  session     : {}", id);
        println!("  │  sent        : {}", h.messages_sent);
    }
    if let Some(n) = h.handshake_attempts {
        println!("  │  attempts    : {}", n);
    }
    if h.probing {
        println!("  │  probing     : yes");
    }
    println!("  └─ idle        : {}s (age {}s)", h.idle_secs, h.age_secs);
}

pub async fn cmd_hosts(port: u16) -> Result<()> {
    let resp: HostList = get_json(&format!("{}/hostmap", base_url(port))).await?;

    if resp.hosts.is_empty() {
        println!("No established tunnels.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Tunnels ({})", resp.hosts.len());
    println!("═══════════════════════════════════════");
    resp.hosts.iter().for_each(print_host);
    Ok(())
}

pub async fn cmd_pending(port: u16) -> Result<()> {
    let resp: HostList = get_json(&format!("{}/hostmap/pending", base_url(port))).await?;

    if resp.hosts.is_empty() {
        println!("No handshakes in flight.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Pending Handshakes ({})", resp.hosts.len());
    println!("═══════════════════════════════════════");
    resp.hosts.iter().for_each(print_host);
    Ok(())
}

pub async fn cmd_host(port: u16, vpn_ip: &str) -> Result<()> {
    let host: Host = get_json(&format!("{}/hostmap/{}", base_url(port), vpn_ip)).await?;
    print_host(&host);
    if let Some(not_after) = host.cert_not_after {
        println!("     cert valid until {} (unix)", not_after);
    }
    Ok(())
}

pub async fn cmd_close(port: u16, vpn_ip: &str) -> Result<()> {
    #[derive(Deserialize)]
    struct CloseResponse {
        vpn_ip: String,
        closed: bool,
    }

    let resp: CloseResponse =
        delete_json(&format!("{}/hostmap/{}", base_url(port), vpn_ip)).await?;

    if resp.closed {
        println!("✓ Tunnel closed: {}", resp.vpn_ip);
    } else {
        println!("No tunnel to {}", resp.vpn_ip);
    }
    Ok(())
}
