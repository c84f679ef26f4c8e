use crate::update::model::InstalledState;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MARKER_FILE_NAME: &str = ".adastral";

#[derive(Serialize, Deserialize)]
struct Marker {
    version: String,
}

/// Persists the installed version id inside the content folder.
#[derive(Debug, Clone)]
pub struct StateStore {
    marker_path: PathBuf,
}

impl StateStore {
    pub fn new(content_dir: &Path) -> Self {
        Self { marker_path: content_dir.join(MARKER_FILE_NAME) }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Missing or unreadable markers yield [`InstalledState::unknown`].
    pub async fn load(&self) -> InstalledState {
        let text = match tokio::fs::read_to_string(&self.marker_path).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(
                    path = %self.marker_path.display(),
                    error = %e,
                    "no installed-version marker; assuming latest content and forcing verify"
                );
                return InstalledState::unknown();
            }
        };

        match serde_json::from_str::<Marker>(&text) {
            Ok(m) => {
                tracing::info!(version = %m.version, "installed version");
                InstalledState::at(m.version)
            }
            Err(e) => {
                tracing::warn!(path = %self.marker_path.display(), error = %e, "corrupt installed-version marker");
                InstalledState::unknown()
            }
        }
    }

    /// Write to a uniquely named sibling then rename over the marker, so a
    /// crash leaves either the old or the new document.
    pub async fn save(&self, state: &InstalledState) -> anyhow::Result<()> {
        let version = state
            .installed_version
            .clone()
            .context("no installed version to persist")?;

        if let Some(parent) = self.marker_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let body = serde_json::to_vec(&Marker { version })?;
        let tmp = self
            .marker_path
            .with_file_name(format!("{}.{}.tmp", MARKER_FILE_NAME, uuid::Uuid::new_v4()));

        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.marker_path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("rename into {}", self.marker_path.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(&dir.path().join("content"));

        store.save(&InstalledState::at("42")).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded.installed_version.as_deref(), Some("42"));
        assert!(!loaded.needs_forced_verify);
    }

    #[tokio::test]
    async fn marker_is_plain_version_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&InstalledState::at("7")).await.unwrap();

        let text = std::fs::read_to_string(store.marker_path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, serde_json::json!({"version": "7"}));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_marker_forces_verify() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path()).load().await;
        assert_eq!(state, InstalledState::unknown());
    }

    #[tokio::test]
    async fn reads_marker_left_by_existing_installs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".adastral"), r#"{"version":"1"}"#).unwrap();

        let state = StateStore::new(dir.path()).load().await;
        assert_eq!(state, InstalledState::at("1"));
    }

    #[tokio::test]
    async fn corrupt_marker_forces_verify() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MARKER_FILE_NAME), "{\"version\": 3").unwrap();
        let state = StateStore::new(dir.path()).load().await;
        assert!(state.needs_forced_verify);
        assert!(state.installed_version.is_none());
    }

    #[tokio::test]
    async fn saving_without_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.save(&InstalledState::unknown()).await.is_err());
        assert!(!store.marker_path().exists());
    }
}
