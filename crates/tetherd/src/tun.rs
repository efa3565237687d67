//! Virtual interface boundary.
//!
//! On Linux this is a TUN device (`/dev/net/tun`, no packet info header)
//! driven through [`AsyncFd`]. With `tun.disabled` a null device stands in:
//! it never yields packets and discards everything written to it.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use tether_core::config::TunConfig;
use tether_engine::{Interface, Outbox};

use crate::udp::Flusher;

pub enum Device {
    #[cfg(target_os = "linux")]
    Tun(linux::Tun),
    Null,
}

impl Device {
    pub async fn open(config: &TunConfig, addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if config.disabled {
            tracing::info!("tun disabled, using null device");
            return Ok(Device::Null);
        }
        #[cfg(target_os = "linux")]
        {
            let tun = linux::Tun::open(&config.dev)?;
            tun.configure(addr, prefix, config.mtu).await?;
            tracing::info!(dev = %config.dev, %addr, prefix, mtu = config.mtu, "tun device up");
            Ok(Device::Tun(tun))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (addr, prefix);
            anyhow::bail!("tun devices are only supported on Linux; set tun.disabled = true")
        }
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            Device::Tun(tun) => tun.recv(buf).await,
            Device::Null => std::future::pending().await,
        }
    }

    pub async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            Device::Tun(tun) => tun.send(packet).await,
            Device::Null => Ok(packet.len()),
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

/// Read packets from the device and hand them to the engine.
pub async fn reader_loop(
    device: Arc<Device>,
    interface: Arc<Interface>,
    flusher: Flusher,
    mtu: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; mtu as usize + 64];
    let mut out = Outbox::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),

            result = device.recv(&mut buf) => {
                let len = result.context("tun read failed")?;
                if let Err(e) = interface.consume_inside(&buf[..len], Instant::now(), &mut out) {
                    tracing::trace!(error = %e, "dropped outbound packet");
                }
                if !out.is_empty() {
                    flusher.flush(out.take()).await;
                }
            }
        }
    }
}

/// Write decrypted packets to the device.
pub async fn writer_loop(
    device: Arc<Device>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),

            packet = rx.recv() => {
                let Some(packet) = packet else { return Ok(()) };
                if let Err(e) = device.send(&packet).await {
                    tracing::warn!(error = %e, len = packet.len(), "tun write failed");
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    use anyhow::{Context, Result};
    use tokio::io::unix::AsyncFd;
    use tokio::process::Command;

    const TUNSETIFF: libc::c_ulong = 0x400454ca;

    #[repr(C)]
    struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    pub struct Tun {
        fd: AsyncFd<File>,
        name: String,
    }

    impl Tun {
        pub fn open(name: &str) -> Result<Self> {
            if name.is_empty() || name.len() >= libc::IFNAMSIZ {
                anyhow::bail!("invalid tun device name {name:?}");
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open("/dev/net/tun")
                .context("open /dev/net/tun")?;

            let mut req = IfReq {
                name: [0; libc::IFNAMSIZ],
                flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
                _pad: [0; 22],
            };
            req.name[..name.len()].copy_from_slice(name.as_bytes());

            // SAFETY: `req` is a properly sized ifreq and outlives the call.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
            if rc < 0 {
                return Err(std::io::Error::last_os_error()).context("TUNSETIFF");
            }

            Ok(Self {
                fd: AsyncFd::new(file).context("register tun fd")?,
                name: name.to_string(),
            })
        }

        pub async fn configure(&self, addr: Ipv4Addr, prefix: u8, mtu: u16) -> Result<()> {
            run_ip(&["addr", "add", &format!("{addr}/{prefix}"), "dev", &self.name]).await?;
            run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string(), "up"]).await
        }

        pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let mut file: &File = inner.get_ref();
                    file.read(buf)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        pub async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let mut file: &File = inner.get_ref();
                    file.write(packet)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }
    }

    async fn run_ip(args: &[&str]) -> Result<()> {
        let status = Command::new("ip")
            .args(args)
            .status()
            .await
            .context("failed to run ip")?;
        if !status.success() {
            anyhow::bail!("ip {} exited with {}", args.join(" "), status);
        }
        Ok(())
    }
}
