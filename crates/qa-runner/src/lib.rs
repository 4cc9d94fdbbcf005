pub mod collab;
pub mod config;
pub mod error;
pub mod gc;
pub mod jobs;
pub mod lifecycle;
pub mod names;
pub mod rapi;
pub mod state;
pub mod stats;

pub use collab::{AnsiblePlaybook, PlaybookRunner, RemoteShell, SshShell};
pub use config::QaConfig;
pub use error::{QaError, Result};
pub use gc::{delete_instances_by_tag, instances_by_tag, remove_run, sweep, NO_TAG_AVAILABLE};
pub use jobs::{CancelFlag, JobPoller};
pub use lifecycle::{run_test, Phase, PhaseFailure, QaContext, RunReport, RunRequest};
pub use rapi::{ClusterApi, RapiClient};
pub use state::{Run, RunState, RunStore};
pub use stats::{RunStats, Runtimes};

use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write to a hidden sibling, fsync, then rename over `path`.
pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("runs.json");
        atomic_write_bytes(&path, b"{}").expect("first write");
        atomic_write_json_pretty(&path, &serde_json::json!({"a": 1})).expect("second write");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"a\": 1"), "{}", text);
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
