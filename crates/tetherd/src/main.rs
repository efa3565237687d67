//! tetherd: the Tether overlay daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use tether_core::config::TetherConfig;
use tether_core::identity::PkiIdentity;
use tether_core::IdentityProvider;
use tether_engine::{Interface, Outbox, StaticHostMap};

mod tun;
mod udp;

/// Depth of the decrypted-packet queue feeding the TUN writer.
const TUN_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let written = TetherConfig::write_default_if_missing();
    let loaded = TetherConfig::load();

    let default_level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = written {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = loaded.context("invalid configuration")?;

    // Identity
    let identity = Arc::new(
        PkiIdentity::load(&config.pki.ca, &config.pki.cert, &config.pki.key)
            .context("failed to load PKI material")?,
    );
    let local = identity.local_identity().clone();
    tracing::info!(
        name = %local.name,
        vpn_ip = %local.vpn_addr,
        public_key = hex::encode(local.public_key),
        "tetherd starting"
    );

    let resolver = Arc::new(
        StaticHostMap::from_config(&config.static_host_map).context("invalid static_host_map")?,
    );
    let interface = Arc::new(
        Interface::new(&config, identity, resolver).context("failed to build interface")?,
    );

    // Underlay socket
    let listen: SocketAddr = format!("{}:{}", config.listen.host, config.listen.port)
        .parse()
        .context("invalid listen address")?;
    let socket = Arc::new(udp::bind(listen).context("failed to bind UDP socket")?);
    tracing::info!(addr = %socket.local_addr()?, workers = config.listen.workers, "udp listening");

    // Virtual interface
    let device = Arc::new(
        tun::Device::open(&config.tun, local.vpn_addr, local.vpn_network.netmask()).await?,
    );

    let (tun_tx, tun_rx) = mpsc::channel::<Vec<u8>>(TUN_QUEUE);
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Outbox>();
    let flusher = udp::Flusher::new(socket.clone(), tun_tx);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let mut workers = tokio::task::JoinSet::new();
    for id in 0..config.listen.workers {
        workers.spawn(
            udp::UdpWorker::new(
                id,
                socket.clone(),
                interface.clone(),
                flusher.clone(),
                shutdown_tx.subscribe(),
            )
            .run(),
        );
    }

    let tun_reader_task = tokio::spawn(tun::reader_loop(
        device.clone(),
        interface.clone(),
        flusher.clone(),
        config.tun.mtu,
        shutdown_tx.subscribe(),
    ));

    let tun_writer_task = tokio::spawn(tun::writer_loop(device, tun_rx, shutdown_tx.subscribe()));

    let flusher_task = tokio::spawn(flusher.run(outbox_rx, shutdown_tx.subscribe()));

    let handshake_task = {
        let interface = interface.clone();
        let outbox_tx = outbox_tx.clone();
        let period = config.handshake_try_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut out = Outbox::new();
                let expired = interface.handshake_tick(Instant::now(), &mut out);
                if expired > 0 {
                    tracing::debug!(expired, "handshake attempts expired");
                }
                if !out.is_empty() && outbox_tx.send(out).is_err() {
                    break;
                }
            }
        })
    };

    let maintenance_task = {
        let interface = interface.clone();
        let outbox_tx = outbox_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let mut out = Outbox::new();
                let report = interface.maintenance_tick(Instant::now(), &mut out);
                if !report.removed.is_empty() {
                    tracing::debug!(
                        removed = report.removed.len(),
                        hosts = interface.hostmap().len(),
                        "maintenance sweep"
                    );
                }
                if !out.is_empty() && outbox_tx.send(out).is_err() {
                    break;
                }
            }
        })
    };

    let api_task = {
        let state = tether_api::ApiState {
            interface: interface.clone(),
            outbox_tx,
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if port == 0 {
                tracing::info!("control API disabled");
                return std::future::pending().await;
            }
            if let Err(e) = tether_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()       => tracing::info!("shutting down"),
        r = workers.join_next()      => tracing::error!("udp worker exited: {:?}", r),
        r = tun_reader_task          => tracing::error!("tun reader exited: {:?}", r),
        r = tun_writer_task          => tracing::error!("tun writer exited: {:?}", r),
        r = flusher_task             => tracing::error!("outbox flusher exited: {:?}", r),
        r = handshake_task           => tracing::error!("handshake ticker exited: {:?}", r),
        r = maintenance_task         => tracing::error!("maintenance ticker exited: {:?}", r),
        r = api_task                 => tracing::error!("API task exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    let mut out = Outbox::new();
    for host in interface.hostmap().hosts() {
        if let Err(e) = interface.close_tunnel(host.vpn_ip, &mut out) {
            tracing::debug!(vpn_ip = %host.vpn_ip, error = %e, "close on shutdown failed");
        }
    }
    for t in out.transmits {
        let _ = socket.send_to(&t.payload, t.dst).await;
    }

    Ok(())
}
