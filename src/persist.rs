//! Atomic JSON snapshots.
//!
//! Writes go to a sibling temp file which is fsynced and renamed over the
//! target, so readers only ever see the old or the new document. The temp
//! file is removed on every failure path.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AdaptError, Result};

/// Owns a temp path until `commit` renames it into place.
struct PendingWrite {
    tmp: PathBuf,
    committed: bool,
}

impl PendingWrite {
    fn new(target: &Path) -> Self {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp.{}", std::process::id()));
        Self { tmp: target.with_file_name(name), committed: false }
    }

    fn commit(mut self, target: &Path) -> Result<()> {
        fs::rename(&self.tmp, target).map_err(|e| AdaptError::persistence(target, e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| AdaptError::persistence(parent, e))?;
    }

    let pending = PendingWrite::new(path);
    {
        let mut file = File::create(&pending.tmp).map_err(|e| AdaptError::persistence(&pending.tmp, e))?;
        file.write_all(&bytes).map_err(|e| AdaptError::persistence(&pending.tmp, e))?;
        file.sync_all().map_err(|e| AdaptError::persistence(&pending.tmp, e))?;
    }
    pending.commit(path)
}

/// Read a JSON document. `Ok(None)` when the file does not exist,
/// `Err(Data)` when it exists but does not parse.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AdaptError::persistence(path, e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| AdaptError::Data(format!("{}: {}", path.display(), e)))
}
