//! On-disk configuration for the `gavel` binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Contents of an optional `gavel.toml`. Command-line flags win over file
/// values.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServeConfig {
    /// Address the execution service listens on, e.g. `0.0.0.0:9090`.
    pub listen: Option<String>,
    /// Shared bearer token masters must present.
    pub token: Option<String>,
    /// Root directory of the blob store.
    pub store: Option<PathBuf>,
    /// Wrapper script used for restricted-process sandboxes.
    pub wrapper: Option<PathBuf>,
}

impl ServeConfig {
    pub fn load(path: &Path) -> anyhow::Result<ServeConfig> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
