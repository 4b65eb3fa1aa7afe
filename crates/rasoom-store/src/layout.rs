//! Data directory layout.
//!
//! ```text
//! ~/.rasoom/
//! ├── rasoom.toml
//! ├── rasoom.db
//! └── rasoom.pid
//! ```

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::settings::Settings;
use crate::store::Store;

pub const DATA_DIR_ENV: &str = "RASOOM_DATA_DIR";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// `explicit`, else `$RASOOM_DATA_DIR`, else `~/.rasoom`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        let home = env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .map(PathBuf::from);
        Self {
            root: choose_root(explicit, env::var_os(DATA_DIR_ENV), home),
        }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("rasoom.db")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("rasoom.toml")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("rasoom.pid")
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })
    }

    pub fn open_store(&self) -> Result<Store> {
        self.ensure()?;
        Store::open(&self.db_path())
    }

    /// Settings plus whether a file was found.
    pub fn load_settings(&self) -> Result<(Settings, bool)> {
        let path = self.settings_path();
        Ok(match Settings::load(&path)? {
            Some(settings) => (settings, true),
            None => (Settings::default(), false),
        })
    }
}

fn choose_root(explicit: Option<&Path>, env_dir: Option<OsString>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = env_dir.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    home.unwrap_or_else(|| PathBuf::from(".")).join(".rasoom")
}
