use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform data directory for berth state (`~/.local/share/berth/`, etc.),
/// created if missing. `BERTH_DATA_DIR` takes precedence through
/// [`crate::ServerConfig`].
pub fn data_dir() -> Result<PathBuf> {
    let dirs =
        ProjectDirs::from("", "", "berth").context("could not determine platform data directory")?;

    let path = dirs.data_dir().to_owned();
    std::fs::create_dir_all(&path).context("create platform data dir")?;
    Ok(path)
}
