//! Command resolution against a search path.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::LaunchError;

/// Resolve `name` to an executable.
///
/// Names containing a `/` are used as given. Other names are looked up in
/// `path_var` (colon-separated). A match that exists but isn't executable
/// is remembered and reported as `PermissionDenied` if nothing executable is
/// found later in the path.
pub fn resolve_command(name: &str, path_var: &str) -> Result<PathBuf, LaunchError> {
    if name.is_empty() {
        return Err(LaunchError::NotFound(String::new()));
    }

    if name.contains('/') {
        let path = Path::new(name);
        return match check_executable(path) {
            Some(true) => Ok(path.to_path_buf()),
            Some(false) => Err(LaunchError::PermissionDenied(name.to_string())),
            None => Err(LaunchError::NotFound(name.to_string())),
        };
    }

    let mut denied = false;
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }

        let candidate = Path::new(dir).join(name);
        match check_executable(&candidate) {
            Some(true) => return Ok(candidate),
            Some(false) => denied = true,
            None => {}
        }
    }

    if denied {
        Err(LaunchError::PermissionDenied(name.to_string()))
    } else {
        Err(LaunchError::NotFound(name.to_string()))
    }
}

/// `Some(executable?)` for regular files, `None` if absent.
fn check_executable(path: &Path) -> Option<bool> {
    let metadata = path.metadata().ok()?;
    if !metadata.is_file() {
        return None;
    }
    Some(metadata.permissions().mode() & 0o111 != 0)
}

/// The host search path.
pub fn host_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string())
}
