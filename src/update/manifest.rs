use crate::update::model::{PatchEntry, VersionEntry};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("manifest is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest entry {section}[{id}] is malformed: {source}")]
    Entry {
        section: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    versions: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    patches: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawVersion {
    file: String,
    url: String,
    signature: String,
    #[serde(default)]
    presz: Option<u64>,
    #[serde(default)]
    postsz: Option<u64>,
}

#[derive(Deserialize)]
struct RawPatch {
    url: String,
    file: String,
    tempreq: u64,
}

/// Read-only view over the version/patch manifest.
///
/// Versions keep the order in which they appear in the document; the last one
/// is the latest. Keys are not compared semantically.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    versions: Vec<VersionEntry>,
    version_index: HashMap<String, usize>,
    patches: HashMap<String, PatchEntry>,
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_str(text)?;

        let mut manifest = Manifest::default();
        for (id, value) in raw.versions {
            let v: RawVersion = serde_json::from_value(value)
                .map_err(|source| ManifestError::Entry { section: "versions", id: id.clone(), source })?;
            manifest.version_index.insert(id.clone(), manifest.versions.len());
            manifest.versions.push(VersionEntry {
                id,
                archive_file: v.file,
                archive_url: v.url,
                signature_path: v.signature,
                download_size: v.presz,
                extracted_size: v.postsz,
            });
        }

        for (id, value) in raw.patches {
            let p: RawPatch = serde_json::from_value(value)
                .map_err(|source| ManifestError::Entry { section: "patches", id: id.clone(), source })?;
            manifest.patches.insert(
                id.clone(),
                PatchEntry { from_id: id, patch_url: p.url, patch_file: p.file, required_temp_bytes: p.tempreq },
            );
        }

        Ok(manifest)
    }

    pub fn version(&self, id: &str) -> Option<&VersionEntry> {
        self.version_index.get(id).map(|&i| &self.versions[i])
    }

    pub fn latest_version(&self) -> Option<&VersionEntry> {
        self.versions.last()
    }

    pub fn patch_from(&self, from_id: &str) -> Option<&PatchEntry> {
        self.patches.get(from_id)
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }
}
