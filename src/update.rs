//! Self-update from GitHub releases.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// `major.minor.patch`, with an optional leading `v`. Pre-release and
/// build suffixes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(u64, u64, u64);

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('v');
        let core = s.split(['-', '+']).next()?;
        let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
        let major = parts.next()??;
        let minor = parts.next().unwrap_or(Some(0))?;
        let patch = parts.next().unwrap_or(Some(0))?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Release asset for this platform, e.g. `amz-ssh_linux_amd64`.
pub fn asset_name(os: &str, arch: &str) -> String {
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("amz-ssh_{}_{}", os, arch)
}

/// Replace the running binary with the latest release of `repository`
/// if that release is newer.
pub async fn run(repository: &str) -> Result<()> {
    let current = Version::parse(env!("CARGO_PKG_VERSION"))
        .ok_or_else(|| anyhow!("Invalid package version {}", env!("CARGO_PKG_VERSION")))?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("amz-ssh/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .context("Failed to create HTTP client")?;

    let release = latest_release(&client, repository).await?;
    let latest = Version::parse(&release.tag_name)
        .ok_or_else(|| anyhow!("Release tag {} is not a version", release.tag_name))?;

    if latest <= current {
        info!("Current binary is the latest version {}", current);
        return Ok(());
    }

    let wanted = asset_name(std::env::consts::OS, std::env::consts::ARCH);
    let asset = release
        .assets
        .iter()
        .find(|a| a.name == wanted)
        .ok_or_else(|| anyhow!("Release {} has no asset named {}", release.tag_name, wanted))?;

    debug!("Downloading {}", asset.browser_download_url);
    let response = client
        .get(&asset.browser_download_url)
        .send()
        .await
        .with_context(|| format!("Failed to download {}", asset.name))?;
    if !response.status().is_success() {
        return Err(anyhow!("GitHub returned {} for {}", response.status(), asset.name));
    }
    let binary = response
        .bytes()
        .await
        .with_context(|| format!("Failed to read {}", asset.name))?;

    let exe = std::env::current_exe().context("Failed to locate running binary")?;
    install_binary(&exe, &binary).await?;

    info!("Successfully updated to version {}", latest);
    if let Some(notes) = release.body.as_deref().filter(|n| !n.trim().is_empty()) {
        info!("Release note:\n{}", notes);
    }
    Ok(())
}

async fn latest_release(client: &reqwest::Client, repository: &str) -> Result<Release> {
    let url = format!("https://api.github.com/repos/{}/releases/latest", repository);
    debug!("Fetching {}", url);

    let response = client
        .get(&url)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .with_context(|| format!("Failed to fetch latest release of {}", repository))?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "GitHub returned {} for {}",
            response.status(),
            repository
        ));
    }

    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read release of {}", repository))?;
    serde_json::from_str(&body).context("Failed to parse release")
}

/// Write `binary` next to `target` and rename it over `target`.
async fn install_binary(target: &Path, binary: &[u8]) -> Result<()> {
    let staged = target.with_extension("update");
    tokio::fs::write(&staged, binary)
        .await
        .with_context(|| format!("Failed to write {}", staged.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("Failed to make {} executable", staged.display()))?;
    }

    tokio::fs::rename(&staged, target)
        .await
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    Ok(())
}
