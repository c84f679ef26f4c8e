use crate::update::model::SpaceCategory;

/// Anticipated failures of `install`, `update` and `verify`.
#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    #[error("failed to prepare legacy links: {0}")]
    Symlink(#[source] std::io::Error),

    #[error("version {0} is not in the manifest")]
    VersionNotFound(String),

    #[error("manifest lists no versions")]
    ManifestEmpty,

    #[error("no patch from version {0}")]
    PatchNotFound(String),

    #[error("not enough {0} space")]
    InsufficientSpace(SpaceCategory),

    #[error("manifest does not declare {field} for version {version}")]
    SizeUnknown { version: String, field: &'static str },

    #[error("download of {url} failed: {source:#}")]
    Download {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("extracting {archive} failed: {source:#}")]
    Extract {
        archive: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("patch tool could not run: {0}")]
    ToolSpawn(#[source] std::io::Error),

    #[error("patch tool exited with {}", describe_exit(.0))]
    ToolExit(Option<i32>),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "a signal".to_string(),
    }
}

pub const EXIT_NOTHING_TO_DO: u8 = 3;

impl UpdateError {
    /// Process exit code. Codes 0-4 keep their historical meaning; 5 and up
    /// are additions, with 5 telling callers to fall back to a full install.
    pub fn exit_code(&self) -> u8 {
        match self {
            UpdateError::Symlink(_) => 1,
            UpdateError::InsufficientSpace(_) | UpdateError::SizeUnknown { .. } => 2,
            UpdateError::VersionNotFound(_) | UpdateError::ManifestEmpty => 4,
            UpdateError::PatchNotFound(_) => 5,
            UpdateError::Download { .. } => 6,
            UpdateError::Extract { .. } => 7,
            UpdateError::ToolSpawn(_) => 8,
            UpdateError::ToolExit(_) => 9,
        }
    }
}
