//! Offline provisioning: create a CA, issue node certificates.
//!
//! Files are hex (keys) or JSON (certificates), the formats `tetherd`
//! reads through `pki.ca`, `pki.cert` and `pki.key`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use tether_core::identity::CertificateAuthority;
use tether_core::Keypair;

const CA_SECRET: &str = "ca.key";
const CA_PUBLIC: &str = "ca.pub";

/// Create `ca.key` (keep offline) and `ca.pub` (ship to every node).
pub fn cmd_ca(dir: &Path) -> Result<()> {
    let secret_path = dir.join(CA_SECRET);
    if secret_path.exists() {
        anyhow::bail!("{} already exists", secret_path.display());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let ca = CertificateAuthority::generate();
    write_secret(&secret_path, &hex::encode(*ca.secret_bytes()))?;
    let public_path = dir.join(CA_PUBLIC);
    std::fs::write(&public_path, hex::encode(ca.verifying_key().as_bytes()))
        .with_context(|| format!("write {}", public_path.display()))?;

    println!("✓ CA written to {}", dir.display());
    println!("  public key : {}", hex::encode(ca.verifying_key().as_bytes()));
    Ok(())
}

/// Issue `<name>.crt` and `<name>.key` signed by the CA in `dir`.
pub fn cmd_issue(dir: &Path, name: &str, cidr: &str, days: u64) -> Result<(PathBuf, PathBuf)> {
    let (vpn_addr, prefix) = parse_cidr(cidr)?;

    let secret = read_hex32(&dir.join(CA_SECRET))?;
    let ca = CertificateAuthority::from_bytes(&secret);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before 1970")?
        .as_secs();
    let keypair = Keypair::generate();
    let cert = ca.issue(name, vpn_addr, prefix, &keypair.public, now, now + days * 86_400);

    let cert_path = dir.join(format!("{name}.crt"));
    let key_path = dir.join(format!("{name}.key"));
    std::fs::write(&cert_path, cert.to_bytes())
        .with_context(|| format!("write {}", cert_path.display()))?;
    write_secret(&key_path, &hex::encode(*keypair.private_bytes()))?;

    println!("✓ Issued {} for {}/{} ({} days)", name, vpn_addr, prefix, days);
    println!("  cert : {}", cert_path.display());
    println!("  key  : {}", key_path.display());
    Ok((cert_path, key_path))
}

fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = s
        .split_once('/')
        .with_context(|| format!("expected <ip>/<prefix>, got {s:?}"))?;
    let addr: Ipv4Addr = addr.parse().context("invalid overlay address")?;
    let prefix: u8 = prefix.parse().context("invalid prefix length")?;
    if prefix > 32 {
        anyhow::bail!("prefix length {prefix} out of range");
    }
    Ok((addr, prefix))
}

fn read_hex32(path: &Path) -> Result<[u8; 32]> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let bytes = hex::decode(text.trim()).with_context(|| format!("decode {}", path.display()))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{} must hold 32 bytes", path.display()))
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    #[cfg(unix)]
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}
