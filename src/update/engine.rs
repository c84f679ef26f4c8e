use crate::plugins::registry::{local_file_name, Downloader, Extractor};
use crate::update::error::UpdateError;
use crate::update::events::EventBus;
use crate::update::layout::{LegacyLink, LinkLayout};
use crate::update::manifest::Manifest;
use crate::update::model::*;
use crate::update::space::{DiskSpaceProbe, SpaceCheck, SpaceGuard, SpaceProbe};
use crate::update::store::StateStore;
use crate::update::tool::PatchTool;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STAGING_DIR_NAME: &str = "butler-staging";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL that relative manifest paths are appended to.
    pub source_url: String,
    pub install_root: PathBuf,
    pub content_folder: String,
    pub temp_dir: PathBuf,
    pub tool_path: PathBuf,
    pub tool_args: Vec<String>,
    pub links: Vec<LegacyLink>,
}

/// Join a manifest path onto the source URL; absolute URLs pass through.
pub fn resolve_url(base: &str, path: &str) -> String {
    if url::Url::parse(path).is_ok() {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Drives install, update and verify for one installation.
///
/// Calls on the same installation must be serialised by the caller; the
/// staging directory and the version marker are not locked.
pub struct UpdateEngine {
    source_url: String,
    install_root: PathBuf,
    content_dir: PathBuf,
    temp_dir: PathBuf,
    manifest: Manifest,
    state: InstalledState,
    store: StateStore,
    space: SpaceGuard,
    tool: PatchTool,
    bus: Arc<EventBus>,
    downloader: Arc<dyn Downloader>,
    extractor: Arc<dyn Extractor>,
    layout: LinkLayout,
}

impl UpdateEngine {
    pub async fn open(
        cfg: EngineConfig,
        manifest: Manifest,
        downloader: Arc<dyn Downloader>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let content_dir = cfg.install_root.join(&cfg.content_folder);
        let store = StateStore::new(&content_dir);
        let mut state = store.load().await;
        if state.installed_version.is_none() {
            state.installed_version = manifest.latest_version().map(|v| v.id.clone());
        }

        let bus = Arc::new(EventBus::new());
        let tool = PatchTool::new(cfg.tool_path.clone(), bus.clone()).with_leading_args(cfg.tool_args.iter());
        let space = SpaceGuard::new(cfg.temp_dir.clone(), cfg.install_root.clone(), Arc::new(DiskSpaceProbe));

        tracing::info!(
            root = %cfg.install_root.display(),
            marker = %store.marker_path().display(),
            versions = manifest.version_count(),
            installed = ?state.installed_version,
            latest = ?manifest.latest_version().map(|v| v.id.as_str()),
            forced_verify = state.needs_forced_verify,
            "installation opened"
        );

        Self {
            source_url: cfg.source_url,
            install_root: cfg.install_root,
            content_dir,
            temp_dir: cfg.temp_dir,
            manifest,
            state,
            store,
            space,
            tool,
            bus,
            downloader,
            extractor,
            layout: LinkLayout::new(cfg.links),
        }
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = SpaceGuard::new(self.temp_dir.clone(), self.install_root.clone(), probe);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> &InstalledState {
        &self.state
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Check the installed content against its signature and heal it. The
    /// installed version id is left unchanged.
    pub async fn verify(&mut self) -> Result<(), UpdateError> {
        let installed = self.installed_entry()?;
        self.verify_entry(&installed).await?;

        self.state.needs_forced_verify = false;
        self.persist().await;
        tracing::info!(version = %installed.id, "installation verified");
        Ok(())
    }

    /// Move the installation to the latest version through an incremental
    /// patch. `PatchNotFound` means a full install is needed instead.
    pub async fn update(&mut self) -> Result<UpdateOutcome, UpdateError> {
        if self.state.needs_forced_verify {
            tracing::info!("installation must be verified before it can be patched");
            return Ok(UpdateOutcome::VerifyPending);
        }
        let latest = self.manifest.latest_version().cloned().ok_or(UpdateError::ManifestEmpty)?;
        let installed_id = self.state.installed_version.clone().unwrap_or_default();
        if installed_id == latest.id {
            tracing::info!(version = %latest.id, "already up to date");
            return Ok(UpdateOutcome::UpToDate);
        }

        self.layout.prepare(&self.content_dir).map_err(UpdateError::Symlink)?;

        let patch = self
            .manifest
            .patch_from(&installed_id)
            .cloned()
            .ok_or_else(|| UpdateError::PatchNotFound(installed_id.clone()))?;
        self.gate(patch.required_temp_bytes, SpaceCategory::Permanent)?;

        let installed = self.installed_entry()?;
        self.verify_entry(&installed).await?;

        self.gate(patch.required_temp_bytes, SpaceCategory::Temporary)?;
        let patch_url = resolve_url(&self.source_url, &patch.patch_url);
        let patch_path = self.fetch(&patch_url, &patch.patch_file).await?;

        let staging = self.install_root.join(STAGING_DIR_NAME);
        tracing::info!(from = %patch.from_id, to = %latest.id, "applying patch");
        let applied = self.tool.apply(&staging, &patch_path, &self.content_dir).await;
        remove_quietly(&patch_path).await;
        applied?;

        self.relink();
        self.state = InstalledState::at(latest.id.clone());
        self.persist().await;
        tracing::info!(version = %latest.id, "update complete");
        Ok(UpdateOutcome::Updated)
    }

    /// Download and unpack the latest full archive.
    pub async fn install(&mut self) -> Result<(), UpdateError> {
        self.layout.prepare(&self.content_dir).map_err(UpdateError::Symlink)?;

        let latest = self.manifest.latest_version().cloned().ok_or(UpdateError::ManifestEmpty)?;
        let download_size = latest.download_size.ok_or_else(|| UpdateError::SizeUnknown {
            version: latest.id.clone(),
            field: "download size",
        })?;
        let extracted_size = latest.extracted_size.ok_or_else(|| UpdateError::SizeUnknown {
            version: latest.id.clone(),
            field: "extracted size",
        })?;

        self.gate(download_size, SpaceCategory::Temporary)?;
        let url = resolve_url(&self.source_url, &latest.archive_url);
        let archive = self.fetch(&url, &latest.archive_file).await?;

        // Archive and extracted tree coexist until extraction finishes.
        self.gate(extracted_size.saturating_mul(2), SpaceCategory::Permanent)?;
        self.extractor
            .extract(&archive, &self.install_root)
            .await
            .map_err(|source| UpdateError::Extract { archive: archive.display().to_string(), source })?;
        remove_quietly(&archive).await;

        self.relink();
        self.state = InstalledState::at(latest.id.clone());
        self.persist().await;
        tracing::info!(version = %latest.id, "install complete");
        Ok(())
    }

    fn installed_entry(&self) -> Result<VersionEntry, UpdateError> {
        let id = self.state.installed_version.as_deref().unwrap_or_default();
        self.manifest
            .version(id)
            .cloned()
            .ok_or_else(|| UpdateError::VersionNotFound(id.to_string()))
    }

    async fn verify_entry(&self, entry: &VersionEntry) -> Result<(), UpdateError> {
        let signature_url = resolve_url(&self.source_url, &entry.signature_path);
        let heal_url = resolve_url(&self.source_url, &entry.archive_file);
        self.tool.verify(&signature_url, &self.content_dir, &heal_url).await
    }

    fn gate(&self, required: u64, category: SpaceCategory) -> Result<(), UpdateError> {
        match self.space.check_free_space(required, category) {
            SpaceCheck::Sufficient => Ok(()),
            SpaceCheck::InsufficientTemporary => Err(UpdateError::InsufficientSpace(SpaceCategory::Temporary)),
            SpaceCheck::InsufficientPermanent => Err(UpdateError::InsufficientSpace(SpaceCategory::Permanent)),
        }
    }

    async fn fetch(&self, url: &str, file_name: &str) -> Result<PathBuf, UpdateError> {
        let download = async {
            let name = local_file_name(file_name)?;
            tracing::info!(url, transport = self.downloader.name(), "fetching");
            self.downloader.download(url, &self.temp_dir, &name).await
        };
        download.await.map_err(|source| UpdateError::Download { url: url.to_string(), source })
    }

    fn relink(&self) {
        if let Err(e) = self.layout.link(&self.install_root, &self.content_dir) {
            tracing::warn!(error = %e, "failed to restore legacy links");
        }
    }

    /// A failed write leaves the old marker (or none), which resolves to a
    /// forced verify on the next open.
    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.state).await {
            tracing::warn!(error = %format!("{:#}", e), "failed to persist installed version");
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove downloaded file");
    }
}
