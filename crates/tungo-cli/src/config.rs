//! Config file locations and loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tungo_core::{ServerConfig, ServerConfigFile};

/// Default server config path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("tungo/server.toml")
}

/// Load and validate a server configuration file.
pub fn load_server(path: &Path) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file = ServerConfigFile::from_toml(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    file.validate()
        .with_context(|| format!("validating {}", path.display()))
}
