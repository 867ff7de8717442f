//! Ambient configuration helpers shared by the binaries that compose this
//! crate (`ltam-scheduler`, `ltam-cli`). Nothing here is read by the
//! library's own workflow code — `Store::open` always takes an explicit
//! path — this just gives both binaries one place to resolve a sensible
//! default when the operator doesn't pass `--data-dir`/`--db`.

use std::path::PathBuf;

use crate::error::{CoreError, Result};

/// The platform-appropriate data directory (`ProjectDirs::data_dir()`),
/// created if absent, restricted to owner-only on Unix. Joined with
/// `ltam.db` to produce the default database path.
pub fn default_database_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("io", "ltam", "ltam").ok_or_else(|| {
        CoreError::Validation("could not determine a platform data directory; pass an explicit database path".to_string())
    })?;

    let data_dir = proj_dirs.data_dir();
    std::fs::create_dir_all(data_dir).map_err(|e| CoreError::Validation(format!("failed to create {}: {e}", data_dir.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        let _ = std::fs::set_permissions(data_dir, perms);
    }

    Ok(data_dir.join("ltam.db"))
}
