use crate::plugins::registry::Extractor;
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub struct ZipExtractor;

impl ZipExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn extract_blocking(archive: &Path, dest_dir: &Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).with_context(|| format!("read zip {}", archive.display()))?;

    std::fs::create_dir_all(dest_dir)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let rel: PathBuf = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .with_context(|| format!("unsafe path in archive: {}", entry.name()))?;
        let out = dest_dir.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(&out).with_context(|| format!("create {}", out.display()))?;
        std::io::copy(&mut entry, &mut f)?;
        if let Some(mode) = entry.unix_mode() {
            set_mode(&out, mode)?;
        }
    }
    Ok(zip.len())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl Extractor for ZipExtractor {
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> anyhow::Result<()> {
        let archive = archive.to_path_buf();
        let dest = dest_dir.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
            .await
            .context("extraction task panicked")??;
        tracing::info!(entries, dest = %dest_dir.display(), "archive extracted");
        Ok(())
    }
}
