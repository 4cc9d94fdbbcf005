//! Persisted run state: one JSON object keyed by run tag.
//!
//! The file is the only durable record of which remote resources exist, so it
//! is always replaced atomically. Every stored run is assumed to still hold its
//! cluster IP and instances until it is removed.

use crate::error::{QaError, Result};
use crate::{atomic_write_bytes, ensure_dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Finished,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Run {
    /// Stored as the object key, not inside the record.
    #[serde(skip)]
    pub tag: String,
    pub cluster_ip: String,
    #[serde(rename = "type")]
    pub recipe: String,
    #[serde(with = "start_time")]
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_names: Vec<String>,
}

impl Run {
    pub fn new(
        tag: impl Into<String>,
        cluster_ip: impl Into<String>,
        recipe: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            tag: tag.into(),
            cluster_ip: cluster_ip.into(),
            recipe: recipe.into(),
            start_time,
            state: Some(RunState::Running),
            instance_names: Vec::new(),
        }
    }

    /// Absent state is treated as running.
    pub fn effective_state(&self) -> RunState {
        self.state.unwrap_or(RunState::Running)
    }
}

/// RFC 3339 on write. On read, timestamps without an offset are taken as
/// local time, which is how older state files were written.
mod start_time {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid start-time '{}'", raw)))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

#[derive(Debug)]
struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(state_path: &Path) -> PathBuf {
    let name = state_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("runs.json");
    state_path.with_file_name(format!("{}.lock", name))
}

const LOCK_ATTEMPTS: u32 = 20;
const LOCK_RETRY: Duration = Duration::from_millis(50);

fn try_store_lock(path: &Path) -> Result<Option<StoreLock>> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(Some(StoreLock {
                path: path.to_path_buf(),
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Lock holders only load, mutate and save, so a short wait covers a
/// concurrent invocation. A lock that outlives the wait is reported.
fn acquire_store_lock(state_path: &Path) -> Result<StoreLock> {
    let path = lock_path(state_path);
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    for attempt in 1..=LOCK_ATTEMPTS {
        if let Some(lock) = try_store_lock(&path)? {
            return Ok(lock);
        }
        debug!(path = %path.display(), attempt, "run state is locked, waiting");
        thread::sleep(LOCK_RETRY);
    }
    Err(QaError::StoreLocked { path })
}

#[derive(Debug, Clone)]
pub struct RunStore {
    path: PathBuf,
    runs: BTreeMap<String, Run>,
}

impl RunStore {
    /// Read the state file. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no run state file yet, starting empty");
                return Ok(Self {
                    path,
                    runs: BTreeMap::new(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let mut runs: BTreeMap<String, Run> =
            serde_json::from_slice(&bytes).map_err(|e| QaError::StoreCorrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;
        for (tag, run) in runs.iter_mut() {
            if tag.is_empty() {
                return Err(QaError::StoreCorrupt {
                    path: path.clone(),
                    detail: "empty run tag".to_string(),
                });
            }
            run.tag = tag.clone();
        }
        Ok(Self { path, runs })
    }

    pub fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.runs)?;
        atomic_write_bytes(&self.path, &bytes)
    }

    /// Load, apply `f`, and save while holding the store lock.
    ///
    /// Nothing is written when `f` fails.
    pub fn update<T, F>(path: &Path, f: F) -> Result<T>
    where
        F: FnOnce(&mut RunStore) -> Result<T>,
    {
        let _lock = acquire_store_lock(path)?;
        let mut store = RunStore::load(path)?;
        let out = f(&mut store)?;
        store.save()?;
        Ok(out)
    }

    pub fn insert(&mut self, run: Run) -> Result<()> {
        if self.runs.contains_key(&run.tag) {
            return Err(QaError::TagCollision { tag: run.tag });
        }
        self.runs.insert(run.tag.clone(), run);
        Ok(())
    }

    pub fn remove(&mut self, tag: &str) -> Option<Run> {
        self.runs.remove(tag)
    }

    pub fn get(&self, tag: &str) -> Option<&Run> {
        self.runs.get(tag)
    }

    pub fn get_mut(&mut self, tag: &str) -> Option<&mut Run> {
        self.runs.get_mut(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.runs.contains_key(tag)
    }

    /// Runs ordered by tag.
    pub fn list(&self) -> Vec<&Run> {
        self.runs.values().collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn active_ips(&self) -> BTreeSet<String> {
        self.runs.values().map(|r| r.cluster_ip.clone()).collect()
    }
}
