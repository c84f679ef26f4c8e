use std::path::{Path, PathBuf};

/// A legacy directory the content folder expects to reach through a link:
/// `<content>/<link>` points at `<install_root>/<source>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyLink {
    pub source: PathBuf,
    pub link: PathBuf,
}

impl std::str::FromStr for LegacyLink {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, link) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected SOURCE:LINK, got {:?}", s))?;
        if source.is_empty() || link.is_empty() {
            anyhow::bail!("empty side in link spec {:?}", s);
        }
        Ok(Self { source: source.into(), link: link.into() })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkLayout {
    links: Vec<LegacyLink>,
}

impl LinkLayout {
    pub fn new(links: Vec<LegacyLink>) -> Self {
        Self { links }
    }

    /// Remove real files or directories sitting where a link belongs.
    pub fn prepare(&self, content_dir: &Path) -> std::io::Result<()> {
        if cfg!(not(unix)) {
            return Ok(());
        }
        for l in &self.links {
            let at = content_dir.join(&l.link);
            let meta = match std::fs::symlink_metadata(&at) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            tracing::info!(path = %at.display(), "removing legacy directory in place of link");
            if meta.is_dir() {
                std::fs::remove_dir_all(&at)?;
            } else {
                std::fs::remove_file(&at)?;
            }
        }
        Ok(())
    }

    pub fn link(&self, install_root: &Path, content_dir: &Path) -> std::io::Result<()> {
        for l in &self.links {
            let at = content_dir.join(&l.link);
            if std::fs::symlink_metadata(&at).is_ok() {
                continue;
            }
            if let Some(parent) = at.parent() {
                std::fs::create_dir_all(parent)?;
            }
            make_link(&install_root.join(&l.source), &at)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_link(target: &Path, at: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, at)
}

#[cfg(not(unix))]
fn make_link(_target: &Path, _at: &Path) -> std::io::Result<()> {
    Ok(())
}
