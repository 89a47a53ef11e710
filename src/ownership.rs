//! Hand output files back to the invoking user when running under sudo.
use std::io;
use std::path::Path;

/// Post-processing applied to every file an operation produced.
pub trait FileFinisher {
    fn finish(&self, path: &Path) -> io::Result<()>;
}

/// Owner to give files to, taken from `SUDO_UID` / `SUDO_GID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealOwner {
    pub uid: u32,
    pub gid: u32,
}

impl RealOwner {
    /// `None` unless the process was started through sudo.
    pub fn from_sudo_env() -> Option<Self> {
        Self::from_vars(
            std::env::var("SUDO_UID").ok().as_deref(),
            std::env::var("SUDO_GID").ok().as_deref(),
        )
    }

    fn from_vars(uid: Option<&str>, gid: Option<&str>) -> Option<Self> {
        let uid = uid?.trim().parse().ok()?;
        let gid = gid?.trim().parse().ok()?;
        Some(RealOwner { uid, gid })
    }
}

impl FileFinisher for RealOwner {
    #[cfg(unix)]
    fn finish(&self, path: &Path) -> io::Result<()> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))
    }

    #[cfg(not(unix))]
    fn finish(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}
