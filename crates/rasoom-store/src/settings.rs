//! `rasoom.toml`: pipeline and router tuning, the external function registry
//! and a static roster. Every section is optional.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use rasoom_core::{PipelineConfig, Tier};
use rasoom_router::{ExternalRegistry, MemberInfo, RouterConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub agent_id: String,
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub joined_ms: u64,
}

impl From<&MemberInfo> for RosterEntry {
    fn from(m: &MemberInfo) -> Self {
        Self {
            agent_id: m.agent_id.clone(),
            tier: m.tier,
            cluster_id: m.cluster_id.clone(),
            joined_ms: m.joined_ms,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub router: RouterConfig,
    pub registry: ExternalRegistry,
    pub members: Vec<RosterEntry>,
}

impl Settings {
    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let settings = toml::from_str(&text).map_err(|source| StoreError::Settings {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(settings))
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
