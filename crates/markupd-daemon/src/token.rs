//! Pairing token provisioning
//!
//! The token is generated once and kept in `<home>/token`, readable by the
//! owner only. The UI side reads the same file during pairing.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

/// Load the stored token, creating one if none exists
pub fn load_or_create(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(existing) => {
            let token = existing.trim().to_string();
            if !token.is_empty() {
                restrict_permissions(path);
                return Ok(token);
            }
            warn!(path = %path.display(), "Token file empty, regenerating");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read token file {}", path.display()))
        }
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    write_private(path, &token)
        .with_context(|| format!("Failed to write token file {}", path.display()))?;
    info!(path = %path.display(), "Generated pairing token");
    Ok(token)
}

#[cfg(unix)]
fn write_private(path: &Path, token: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(token.as_bytes())?;
    restrict_permissions(path);
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, token)
}

/// Tighten a token file that is readable by group or others
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                file = %path.display(),
                old_mode = format!("{:o}", mode),
                "Token file too permissive, fixing to 600"
            );
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).ok();
        }
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("token");

        let first = load_or_create(&path).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(load_or_create(&path).unwrap(), first);
    }

    #[test]
    fn test_empty_file_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "\n").unwrap();
        assert!(!load_or_create(&path).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "existing").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert_eq!(load_or_create(&path).unwrap(), "existing");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
