/// One installable version as declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub id: String,
    pub archive_file: String,
    pub archive_url: String,
    pub signature_path: String,
    /// `None` when the manifest omits the size; never read as zero.
    pub download_size: Option<u64>,
    pub extracted_size: Option<u64>,
}

/// Incremental patch from `from_id` toward the newest version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub from_id: String,
    pub patch_url: String,
    pub patch_file: String,
    pub required_temp_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledState {
    pub installed_version: Option<String>,
    pub needs_forced_verify: bool,
}

impl InstalledState {
    pub fn at(version: impl Into<String>) -> Self {
        Self { installed_version: Some(version.into()), needs_forced_verify: false }
    }

    /// Marker missing or unreadable: content assumed present, integrity unknown.
    pub fn unknown() -> Self {
        Self { installed_version: None, needs_forced_verify: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCategory {
    Temporary,
    Permanent,
}

impl std::fmt::Display for SpaceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpaceCategory::Temporary => f.write_str("temporary"),
            SpaceCategory::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    UpToDate,
    VerifyPending,
}
