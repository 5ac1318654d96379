// Intercessio Engine — Filesystem layout.
// Every on-disk artifact lives under one dotted directory in the user's
// home. Tests and embedders point the daemon elsewhere with the
// INTERCESSIO_HOME environment variable.

use crate::atoms::constants::*;
use std::path::PathBuf;

/// The daemon's config directory (`~/.intercessio` unless overridden).
/// Created on first access.
pub fn config_dir() -> PathBuf {
    let dir = match std::env::var_os("INTERCESSIO_HOME") {
        Some(custom) => PathBuf::from(custom),
        None => dirs::home_dir().unwrap_or_default().join(CONFIG_DIR_NAME),
    };
    std::fs::create_dir_all(&dir).ok();
    dir
}

pub fn db_path() -> PathBuf {
    config_dir().join(DB_FILE)
}

pub fn socket_path() -> PathBuf {
    config_dir().join(SOCKET_FILE)
}
