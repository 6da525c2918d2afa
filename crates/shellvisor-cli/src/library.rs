//! Native library loading into the bridge's own process.
//!
//! Libraries are opened with `RTLD_NOW | RTLD_GLOBAL` and never closed; they
//! stay resident for the life of the process.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::BridgeError;

/// Success text reported by [`LibraryLoader::load`].
pub const LOADED: &str = "Library loaded successfully.";

/// Loads native libraries and remembers which ones succeeded.
#[derive(Debug, Default)]
pub struct LibraryLoader {
    loaded: Mutex<Vec<PathBuf>>,
}

impl LibraryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the shared library at `path`.
    pub fn load(&self, path: &Path) -> Result<String, BridgeError> {
        match open_global(path) {
            Ok(()) => {
                info!(path = %path.display(), "Library loaded");
                self.loaded
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(path.to_path_buf());
                Ok(LOADED.to_string())
            }
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "Library load failed");
                Err(BridgeError::Library(reason))
            }
        }
    }

    /// Libraries loaded so far, in load order.
    pub fn loaded(&self) -> Vec<PathBuf> {
        self.loaded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(unix)]
fn open_global(path: &Path) -> Result<(), String> {
    use std::ffi::{CStr, CString};
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| format!("{}: path contains a NUL byte", path.display()))?;

    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    // The returned handle is leaked, so the library is never unloaded.
    #[allow(unsafe_code)]
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
    if !handle.is_null() {
        return Ok(());
    }

    // SAFETY: dlerror returns either null or a NUL-terminated string owned by
    // the loader, valid until the next dl* call on this thread.
    #[allow(unsafe_code)]
    let reason = unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            format!("{}: unknown loader error", path.display())
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    };
    Err(reason)
}

#[cfg(not(unix))]
fn open_global(path: &Path) -> Result<(), String> {
    Err(format!(
        "{}: dynamic loading is not supported on this platform",
        path.display()
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_reports_reason() {
        let loader = LibraryLoader::new();
        let err = loader
            .load(Path::new("/nonexistent/libshellvisor-missing.so"))
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("Failed to load library: "), "{text}");
        assert!(text.contains("libshellvisor-missing.so"), "{text}");
        assert!(loader.loaded().is_empty());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn system_library_loads() {
        let loader = LibraryLoader::new();
        assert_eq!(loader.load(Path::new("libc.so.6")).unwrap(), LOADED);
        assert_eq!(loader.loaded(), vec![PathBuf::from("libc.so.6")]);
    }
}
