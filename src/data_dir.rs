use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "FUSIONRAG_DATA_DIR";

const XDG_PREFIX: &str = "fusionrag";
const CONFIG_DB_FILE: &str = "config.redb";
const VECTORS_DB_FILE: &str = "vectors.redb";

/// Where settings and stored vectors live.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

/// Pick the data root from the flag or the environment value. Blank values
/// count as unset. `None` means fall back to XDG.
fn choose_root(
    explicit: Option<&Path>,
    env_value: Option<String>,
) -> Option<PathBuf> {
    explicit
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| {
            env_value
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
}

impl DataDir {
    /// `--data-dir`, then `FUSIONRAG_DATA_DIR`, then
    /// `$XDG_DATA_HOME/fusionrag`. The directory is created if missing.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match choose_root(
            explicit,
            std::env::var(DATA_DIR_ENV_VAR).ok(),
        ) {
            Some(root) => root,
            None => xdg::BaseDirectories::with_prefix(XDG_PREFIX)
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config("no XDG data home for stored state".into())
                })?,
        };
        Self::at(root)
    }

    /// Use `root` as is, creating it when needed.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            std::fs::create_dir_all(&root)
                .map_err(|_| Error::DataDir(root.clone()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stored settings.
    pub fn config_db(&self) -> PathBuf {
        self.root.join(CONFIG_DB_FILE)
    }

    /// Persisted semantic index.
    pub fn vectors_db(&self) -> PathBuf {
        self.root.join(VECTORS_DB_FILE)
    }
}
