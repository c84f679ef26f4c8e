use crate::update::model::SpaceCategory;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait SpaceProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Free space as reported by the filesystem holding `path`.
pub struct DiskSpaceProbe;

#[cfg(unix)]
impl SpaceProbe for DiskSpaceProbe {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[cfg(not(unix))]
impl SpaceProbe for DiskSpaceProbe {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        let path = std::fs::canonicalize(path)?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no disk holds path"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    Sufficient,
    InsufficientTemporary,
    InsufficientPermanent,
}

/// Compares free space on the staging and installation roots against a
/// requirement. Nothing is reserved: a later write can still run out of space.
#[derive(Clone)]
pub struct SpaceGuard {
    temp_root: PathBuf,
    permanent_root: PathBuf,
    probe: Arc<dyn SpaceProbe>,
}

impl SpaceGuard {
    pub fn new(temp_root: PathBuf, permanent_root: PathBuf, probe: Arc<dyn SpaceProbe>) -> Self {
        Self { temp_root, permanent_root, probe }
    }

    pub fn check_free_space(&self, required: u64, category: SpaceCategory) -> SpaceCheck {
        let (root, insufficient) = match category {
            SpaceCategory::Temporary => (&self.temp_root, SpaceCheck::InsufficientTemporary),
            SpaceCategory::Permanent => (&self.permanent_root, SpaceCheck::InsufficientPermanent),
        };

        match self.probe.free_bytes(root) {
            Ok(free) if free >= required => SpaceCheck::Sufficient,
            Ok(free) => {
                tracing::warn!(%category, root = %root.display(), free, required, "not enough free space");
                insufficient
            }
            Err(e) => {
                tracing::warn!(%category, root = %root.display(), error = %e, "free space query failed");
                insufficient
            }
        }
    }
}
