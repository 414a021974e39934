//! Private key preflight checks

use std::path::Path;

use thiserror::Error;

/// Problems with a configured private key, caught before a connection
/// is opened
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reject keys that are group or world accessible, the way the ssh
/// client itself would.
///
/// # Errors
/// Returns `KeyError` when the file is missing, unreadable, or has mode
/// bits set outside the owner triplet.
pub fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            KeyError::NotFound(path.display().to_string())
        } else {
            KeyError::Io(err)
        }
    })?;

    let mode = metadata.permissions().mode();

    // mode & 0o77 checks group and other permissions
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
