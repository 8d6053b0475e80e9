// Permissions hardening for daemon files and directories

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Set restrictive umask so created files default to owner-only access.
/// Must run early in main(), before any files are created.
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

/// Ensure a directory exists with owner-only permissions
pub fn ensure_private_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .context(format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(path, perms)
            .context(format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

/// Restrict the control socket to the owning user
pub fn set_socket_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .context(format!("Failed to set permissions on {}", path.display()))?;
        debug!("Set socket permissions to 0600: {}", path.display());
    }
    Ok(())
}
