//! tether-ctl: command-line interface for the Tether daemon.

use std::path::Path;

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_PORT: u16 = 4243;
const DEFAULT_CERT_DAYS: u64 = 365;

fn print_usage() {
    println!("Usage: tether-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                              Show daemon status");
    println!("  hosts                               List established tunnels");
    println!("  pending                             List handshakes in flight");
    println!("  host <vpn_ip>                       Inspect one host");
    println!("  close <vpn_ip>                      Close the tunnel to a host");
    println!("  shutdown                            Stop the daemon");
    println!("  pki ca <dir>                        Create a certificate authority");
    println!("  pki issue <dir> <name> <ip/prefix> [days]");
    println!("                                      Issue a node certificate and key");
    println!();
    println!("Options:");
    println!("  --port <port>   Control API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["hosts"] => cmd::hostmap::cmd_hosts(port).await,
        ["pending"] => cmd::hostmap::cmd_pending(port).await,
        ["host", vpn_ip] => cmd::hostmap::cmd_host(port, vpn_ip).await,
        ["close", vpn_ip] => cmd::hostmap::cmd_close(port, vpn_ip).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["pki", "ca", dir] => cmd::pki::cmd_ca(Path::new(dir)),
        ["pki", "issue", dir, name, cidr] => {
            cmd::pki::cmd_issue(Path::new(dir), name, cidr, DEFAULT_CERT_DAYS).map(|_| ())
        }
        ["pki", "issue", dir, name, cidr, days] => {
            let days = days.parse().context("days must be a number")?;
            cmd::pki::cmd_issue(Path::new(dir), name, cidr, days).map(|_| ())
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
