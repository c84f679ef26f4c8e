use crate::plugins::registry::Downloader;
use anyhow::Context;
use async_trait::async_trait;
use librqbit::{AddTorrent, Session};
use std::path::{Path, PathBuf};

/// Peer-assisted transport: `url` names a .torrent (or magnet) whose payload
/// is the archive `file_name`.
pub struct BtDriver;

impl BtDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Downloader for BtDriver {
    fn name(&self) -> &'static str {
        "torrent"
    }

    async fn download(&self, url: &str, dest_dir: &Path, file_name: &str) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let session = Session::new(dest_dir.to_path_buf())
            .await
            .context("create bt session")?;

        tracing::info!(url, dir = %dest_dir.display(), "starting torrent download");
        let resp = session
            .add_torrent(AddTorrent::from_url(url), None)
            .await
            .context("add torrent")?;

        let handle = resp.into_handle().context("torrent handle")?;
        handle.wait_until_completed().await.context("bt wait complete")?;
        session.stop().await;

        let target = dest_dir.join(file_name);
        if tokio::fs::metadata(&target).await.is_err() {
            anyhow::bail!("torrent finished but {} is missing", target.display());
        }
        Ok(target)
    }
}
