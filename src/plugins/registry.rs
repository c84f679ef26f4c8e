use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            user_agent: format!("content-updater/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
        }
    }
}

/// Fetches one remote archive into a local directory.
#[async_trait]
pub trait Downloader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Download `url` into `dest_dir`, storing it as `file_name`. Returns the
    /// path of the finished file.
    async fn download(&self, url: &str, dest_dir: &Path, file_name: &str) -> anyhow::Result<PathBuf>;
}

/// Unpacks a downloaded archive.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Torrent,
}

impl std::str::FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Transport::Http),
            "torrent" | "bt" => Ok(Transport::Torrent),
            other => anyhow::bail!("unknown transport {:?} (expected http or torrent)", other),
        }
    }
}

pub fn downloader_for(transport: Transport, ctx: DriverContext) -> anyhow::Result<Arc<dyn Downloader>> {
    let driver: Arc<dyn Downloader> = match transport {
        Transport::Http => Arc::new(crate::plugins::http::driver::HttpDriver::new(ctx)?),
        Transport::Torrent => Arc::new(crate::plugins::bt::driver::BtDriver::new()),
    };
    tracing::debug!(transport = driver.name(), "selected transport");
    Ok(driver)
}

/// Local file name for a manifest-supplied name; rejects names that sanitise to nothing.
pub fn local_file_name(raw: &str) -> anyhow::Result<String> {
    let base = raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(raw);
    let clean = sanitize_filename::sanitize(base);
    if clean.is_empty() || clean == "." || clean == ".." {
        anyhow::bail!("unusable file name {:?}", raw);
    }
    Ok(clean)
}
