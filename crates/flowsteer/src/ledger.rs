//! Ownership ledger.
//!
//! One JSON file per interface under the state directory records which rule
//! keys flowsteer claimed on its last apply. It never records device state;
//! the device is always re-read.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FlowsteerError, FlowsteerResult};
use crate::planner::{KeySpace, TrafficSplitPolicy};

/// Key space claimed on one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub interface: String,
    pub key_space: KeySpace,
    pub queue: u32,
}

impl OwnershipRecord {
    pub fn for_policy(policy: &TrafficSplitPolicy) -> Self {
        Self {
            interface: policy.interface.clone(),
            key_space: policy.key_space(),
            queue: policy.xdp_queue,
        }
    }
}

/// Ledger files rooted at a state directory.
#[derive(Debug, Clone)]
pub struct Ledger {
    state_dir: PathBuf,
}

impl Ledger {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path_for(&self, interface: &str) -> PathBuf {
        self.state_dir.join(format!("{interface}.json"))
    }

    /// Returns the record for `interface`, or `None` if there is none.
    pub async fn load(&self, interface: &str) -> FlowsteerResult<Option<OwnershipRecord>> {
        let path = self.path_for(interface);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FlowsteerError::ledger(&path, e)),
        };
        let record: OwnershipRecord =
            serde_json::from_str(&text).map_err(|e| FlowsteerError::ledger(&path, e))?;
        if record.interface != interface {
            return Err(FlowsteerError::ledger(
                &path,
                format!("record belongs to '{}'", record.interface),
            ));
        }
        debug!(path = %path.display(), "Loaded ownership record");
        Ok(Some(record))
    }

    /// Writes the record atomically (temp file then rename).
    pub async fn store(&self, record: &OwnershipRecord) -> FlowsteerResult<()> {
        tokio::fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| FlowsteerError::ledger(&self.state_dir, e))?;
        let path = self.path_for(&record.interface);
        let tmp = tmp_path(&path);
        let json =
            serde_json::to_string_pretty(record).map_err(|e| FlowsteerError::ledger(&path, e))?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| FlowsteerError::ledger(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| FlowsteerError::ledger(&path, e))?;
        info!(path = %path.display(), "Recorded ownership");
        Ok(())
    }

    /// Removes the record. Missing records are fine.
    pub async fn remove(&self, interface: &str) -> FlowsteerResult<()> {
        let path = self.path_for(interface);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Removed ownership record");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FlowsteerError::ledger(&path, e)),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
