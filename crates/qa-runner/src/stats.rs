//! Per-run statistics consumed by the report generator.
//!
//! Each run gets its own directory under the stats root holding `run.json`
//! plus the playbook/QA logs and collected node logs.

use crate::atomic_write_json_pretty;
use crate::error::Result;
use crate::state::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STATS_FILE: &str = "run.json";

/// Phase durations in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Runtimes {
    pub instance_create: f64,
    pub playbook: f64,
    pub qa: f64,
    pub overall: f64,
}

impl Runtimes {
    pub fn set_instance_create(&mut self, d: Duration) {
        self.instance_create = d.as_secs_f64();
        self.recompute();
    }

    pub fn set_playbook(&mut self, d: Duration) {
        self.playbook = d.as_secs_f64();
        self.recompute();
    }

    pub fn set_qa(&mut self, d: Duration) {
        self.qa = d.as_secs_f64();
        self.recompute();
    }

    // Phases never overlap, so the sum is the run's busy time.
    fn recompute(&mut self) {
        self.overall = self.instance_create + self.playbook + self.qa;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunStats {
    /// Seconds since the Unix epoch, UTC.
    pub started: f64,
    pub state: RunState,
    pub recipe: String,
    pub tag: String,
    pub os_version: String,
    pub source_repository: String,
    pub source_branch: String,
    pub instance_names: Vec<String>,
    pub runtimes: Runtimes,
}

impl RunStats {
    pub fn new(
        started: DateTime<Utc>,
        tag: &str,
        recipe: &str,
        os_variant: &str,
        source: &str,
        branch: &str,
    ) -> Self {
        Self {
            started: started.timestamp_millis() as f64 / 1000.0,
            state: RunState::Running,
            recipe: recipe.to_string(),
            tag: tag.to_string(),
            os_version: os_display_name(os_variant),
            source_repository: source.to_string(),
            source_branch: branch.to_string(),
            instance_names: Vec::new(),
            runtimes: Runtimes::default(),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let value = serde_json::to_value(self)?;
        atomic_write_json_pretty(&dir.join(STATS_FILE), &value)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let bytes = fs::read(dir.join(STATS_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// `bookworm` -> `Debian/Bookworm`.
pub fn os_display_name(variant: &str) -> String {
    let mut chars = variant.chars();
    let capitalized: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    format!("Debian/{}", capitalized)
}

/// Directory name for one run: hex SHA-256 over the run's provenance and
/// start time, so repeated runs of the same recipe never share a directory.
pub fn stats_run_id(
    recipe: &str,
    os_variant: &str,
    source: &str,
    branch: &str,
    started: DateTime<Utc>,
) -> String {
    let identifier = format!(
        "{}-{}-{}-{}-{}",
        recipe,
        os_variant,
        source,
        branch,
        started.to_rfc3339()
    );
    hex::encode(Sha256::digest(identifier.as_bytes()))
}

/// Create the run's stats directory. Fails if it already exists.
pub fn create_stats_dir(root: &Path, run_id: &str) -> Result<PathBuf> {
    fs::create_dir_all(root)?;
    let dir = root.join(run_id);
    fs::create_dir(&dir)?;
    Ok(dir)
}
