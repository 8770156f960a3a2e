//! Cloudflare IP range files fed to the speed-test tool with `-f`.

use crate::config::SpeedTestConf;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

pub const CLOUDFLARE_IPV4: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
];

pub const CLOUDFLARE_IPV6: &[&str] = &[
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
];

/// Creates the work dir and the enabled range files. Existing files are left alone.
/// Returns the files that were written.
pub async fn ensure_ip_files(conf: &SpeedTestConf) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(conf.work_dir_path()).await?;

    let mut written = Vec::new();
    if conf.ipv4 && write_if_missing(&conf.ipv4_path(), CLOUDFLARE_IPV4).await? {
        written.push(conf.ipv4_path());
    }
    if conf.ipv6 && write_if_missing(&conf.ipv6_path(), CLOUDFLARE_IPV6).await? {
        written.push(conf.ipv6_path());
    }
    Ok(written)
}

async fn write_if_missing(path: &Path, cidrs: &[&str]) -> io::Result<bool> {
    if fs::try_exists(path).await? {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut body = cidrs.join("\n");
    body.push('\n');
    fs::write(path, body).await?;
    info!(path = %path.display(), ranges = cidrs.len(), "wrote default IP range file");
    Ok(true)
}
