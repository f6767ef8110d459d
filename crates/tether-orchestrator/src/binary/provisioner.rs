//! Backend binary download and cache
//!
//! Binaries are cached as `<cache_dir>/<prefix>-<release tag>` so several
//! versions can coexist. A cached binary younger than the TTL is used without
//! touching the network at all; the release index is rate limited and
//! consulting it on every start would exhaust the quota.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use tether_core::config::BinaryConfig;
use tether_core::error::ProvisionError;

use super::platform::{current_target, executable_name};

/// One entry of the release index
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// A downloadable file attached to a release
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Resolves, downloads and caches the backend binary
pub struct BinaryProvisioner {
    cache_dir: PathBuf,
    cache_ttl: Duration,
    release_index_url: String,
    artifact_prefix: String,
    target: String,
    client: reqwest::Client,
}

impl BinaryProvisioner {
    /// Create a provisioner for the running platform
    pub fn new(config: &BinaryConfig) -> Result<Self, ProvisionError> {
        let target = current_target()?;
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ProvisionError::DownloadFailed(e.to_string()))?;

        Ok(Self {
            cache_dir: config.cache_dir.clone(),
            cache_ttl: config.cache_ttl,
            release_index_url: config.release_index_url.clone(),
            artifact_prefix: config.artifact_prefix.clone(),
            target: target.to_string(),
            client,
        })
    }

    /// Override the platform target
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Name of the release asset for this platform
    pub fn asset_name(&self) -> String {
        format!("{}-{}.zip", self.artifact_prefix, self.target)
    }

    /// Cache path of the binary for a release tag
    pub fn versioned_path(&self, tag: &str) -> PathBuf {
        self.cache_dir
            .join(executable_name(&format!("{}-{}", self.artifact_prefix, tag)))
    }

    /// Return a usable backend binary, downloading it if needed
    pub async fn resolve(&self) -> Result<PathBuf, ProvisionError> {
        if !self.cache_ttl.is_zero() {
            if let Some(path) = self.fresh_cached_binary()? {
                tracing::info!("Using cached backend binary {:?}", path);
                return Ok(path);
            }
        }

        let releases = self.fetch_release_index().await?;
        let asset_name = self.asset_name();
        let (release, asset) = select_release(&releases, &asset_name)
            .ok_or_else(|| ProvisionError::AssetNotFound(self.target.clone()))?;

        let binary_path = self.versioned_path(&release.tag_name);
        if binary_path.exists() {
            touch(&binary_path)?;
            tracing::info!(
                "Backend binary for {} already cached at {:?}",
                release.tag_name,
                binary_path
            );
            return Ok(binary_path);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let archive_path = self.cache_dir.join(&asset.name);
        tracing::info!("Downloading {} ({})", asset.name, release.tag_name);
        let result = match self.download(&asset.browser_download_url, &archive_path).await {
            Ok(()) => self.install(&archive_path, &binary_path).await,
            Err(e) => Err(e),
        };
        match tokio::fs::remove_file(&archive_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!("Failed to remove archive {:?}: {}", archive_path, e);
            }
            _ => {}
        }
        result?;

        tracing::info!("Installed backend binary {:?}", binary_path);
        Ok(binary_path)
    }

    /// Most recently modified cached binary, if younger than the TTL
    fn fresh_cached_binary(&self) -> Result<Option<PathBuf>, ProvisionError> {
        let entries = match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{}-", self.artifact_prefix);
        let mut newest: Option<(PathBuf, SystemTime)> = None;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(&prefix) || name.ends_with(".zip") {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;
            if newest.as_ref().map_or(true, |(_, t)| modified > *t) {
                newest = Some((entry.path(), modified));
            }
        }

        Ok(newest.and_then(|(path, modified)| {
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO);
            if age < self.cache_ttl {
                Some(path)
            } else {
                tracing::debug!("Cached binary {:?} is {:?} old, checking for releases", path, age);
                None
            }
        }))
    }

    async fn fetch_release_index(&self) -> Result<Vec<Release>, ProvisionError> {
        tracing::debug!("Fetching release index {}", self.release_index_url);
        let response = self
            .client
            .get(&self.release_index_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProvisionError::DownloadFailed(format!("release index: {}", e)))?;

        response
            .json::<Vec<Release>>()
            .await
            .map_err(|e| ProvisionError::DownloadFailed(format!("release index: {}", e)))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ProvisionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProvisionError::DownloadFailed(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| ProvisionError::DownloadFailed(format!("{:?}: {}", dest, e)))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProvisionError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ProvisionError::DownloadFailed(format!("{:?}: {}", dest, e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ProvisionError::DownloadFailed(format!("{:?}: {}", dest, e)))?;

        tracing::debug!("Downloaded {} bytes to {:?}", written, dest);
        Ok(())
    }

    /// Extract the archive and move the binary to its versioned name
    async fn install(&self, archive: &Path, binary_path: &Path) -> Result<(), ProvisionError> {
        let extract_dir = binary_path.with_extension("extract");
        if extract_dir.exists() {
            tokio::fs::remove_dir_all(&extract_dir).await?;
        }
        tokio::fs::create_dir_all(&extract_dir).await?;

        let result = async {
            extract_archive(archive, &extract_dir).await?;

            let extracted = extract_dir.join(executable_name(&self.artifact_prefix));
            if !extracted.exists() {
                return Err(ProvisionError::ExtractionFailed(format!(
                    "archive does not contain {:?}",
                    extracted.file_name().unwrap_or_default()
                )));
            }
            tokio::fs::rename(&extracted, binary_path).await?;
            make_executable(binary_path)?;
            Ok(())
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&extract_dir).await {
            tracing::warn!("Failed to remove {:?}: {}", extract_dir, e);
        }
        result
    }
}

/// First release (most recent first) carrying `asset_name`
pub fn select_release<'a>(
    releases: &'a [Release],
    asset_name: &str,
) -> Option<(&'a Release, &'a ReleaseAsset)> {
    releases.iter().find_map(|release| {
        release
            .assets
            .iter()
            .find(|asset| asset.name == asset_name)
            .map(|asset| (release, asset))
    })
}

/// Resolve the backend binary described by `config`
///
/// An explicit `path` is used as is, without consulting the cache.
pub async fn resolve_binary(config: &BinaryConfig) -> Result<PathBuf, ProvisionError> {
    if let Some(path) = &config.path {
        if !path.is_file() {
            return Err(ProvisionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("backend binary {:?} does not exist", path),
            )));
        }
        tracing::info!("Using backend binary {:?}", path);
        return Ok(path.clone());
    }
    BinaryProvisioner::new(config)?.resolve().await
}

async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), ProvisionError> {
    #[cfg(windows)]
    let mut command = {
        let mut command = tokio::process::Command::new("powershell");
        command.args(["-NoProfile", "-NonInteractive", "-Command"]).arg(format!(
            "Expand-Archive -Force -LiteralPath '{}' -DestinationPath '{}'",
            archive.display(),
            dest.display()
        ));
        command
    };

    #[cfg(not(windows))]
    let mut command = {
        let mut command = tokio::process::Command::new("unzip");
        command.args(["-o", "-q"]).arg(archive).arg("-d").arg(dest);
        command
    };

    let output = command
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| ProvisionError::ExtractionFailed(format!("failed to run extractor: {}", e)))?;

    if !output.status.success() {
        return Err(ProvisionError::ExtractionFailed(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Bump the mtime so TTL tracking treats the binary as freshly validated
fn touch(path: &Path) -> std::io::Result<()> {
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}
