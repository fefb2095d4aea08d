//! Host environment probes: privilege level, installed tools and free disk.
//!
//! Kept behind a trait so pre-flight and metadata collection can be exercised
//! without root, without container runtimes and without filling a disk.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

pub trait HostProbe: Send + Sync {
    /// Whether the process runs with an effective uid of 0.
    fn is_privileged(&self) -> bool;

    /// Whether `name` resolves to an executable on `PATH`.
    fn executable_exists(&self, name: &str) -> bool;

    /// Free bytes available to unprivileged users on the filesystem holding `path`.
    fn free_disk_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Probe backed by the real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn executable_exists(&self, name: &str) -> bool {
        let found = which::which(name).is_ok();
        debug!(executable = name, found, "Checked executable");
        found
    }

    fn free_disk_bytes(&self, path: &Path) -> std::io::Result<u64> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();

        // SAFETY: c_path is a valid NUL-terminated string and stat points to
        // writable memory large enough for a statvfs struct.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: statvfs returned 0, so the struct is initialised.
        let stat = unsafe { stat.assume_init() };

        #[allow(clippy::unnecessary_cast)]
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_exists() {
        assert!(SystemProbe.executable_exists("sh"));
        assert!(!SystemProbe.executable_exists("definitely-not-a-program-xyz"));
    }

    #[test]
    fn test_free_disk_on_tmp() {
        let free = SystemProbe.free_disk_bytes(&std::env::temp_dir()).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn test_free_disk_missing_path() {
        assert!(
            SystemProbe
                .free_disk_bytes(Path::new("/nonexistent/path/for/statvfs"))
                .is_err()
        );
    }
}
