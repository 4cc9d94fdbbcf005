#![allow(dead_code)]

use qa_runner::collab::{PlaybookRunner, RemoteShell};
use qa_runner::rapi::{ClusterApi, InstanceRecord, InstanceSpec, JobId, JobState, JobStatus};
use qa_runner::{QaConfig, Result};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory cluster: instances keyed by name, jobs finish immediately.
#[derive(Default)]
pub struct FakeCluster {
    pub instances: RefCell<BTreeMap<String, Vec<String>>>,
    pub jobs: RefCell<Vec<JobStatus>>,
    pub creates: Cell<usize>,
    pub existence_checks: Cell<usize>,
    /// Every name reports as existing.
    pub all_names_taken: bool,
    /// 1-based creation that fails.
    pub fail_create_number: Option<usize>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, name: &str, tags: &[&str]) -> Self {
        self.instances.borrow_mut().insert(
            name.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn tagged(&self, tag: &str) -> Vec<String> {
        self.instances
            .borrow()
            .iter()
            .filter(|(_, tags)| tags.iter().any(|t| t == tag))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.borrow().len()
    }

    pub fn existence_checks(&self) -> usize {
        self.existence_checks.get()
    }

    pub fn creates(&self) -> usize {
        self.creates.get()
    }

    fn job(&self, state: JobState, opresult: Value) -> JobId {
        let mut jobs = self.jobs.borrow_mut();
        jobs.push(JobStatus { state, opresult });
        jobs.len() as JobId
    }

    fn ok_job(&self) -> JobId {
        self.job(JobState::Success, json!([null]))
    }

    fn failed_job(&self, kind: &str, message: &str) -> JobId {
        self.job(JobState::Error, json!([[kind, [message, "wrong_input"]]]))
    }
}

impl ClusterApi for FakeCluster {
    fn get_instance(&self, name: &str) -> Result<Option<Value>> {
        self.existence_checks.set(self.existence_checks.get() + 1);
        if self.all_names_taken || self.instances.borrow().contains_key(name) {
            return Ok(Some(json!({ "name": name })));
        }
        Ok(None)
    }

    fn create_instance(&self, spec: &InstanceSpec) -> Result<JobId> {
        let number = self.creates.get() + 1;
        self.creates.set(number);
        if self.fail_create_number == Some(number) {
            return Ok(self.failed_job("OpPrereqError", "Not enough memory on the cluster"));
        }
        self.instances
            .borrow_mut()
            .insert(spec.name.clone(), vec![spec.tag.clone()]);
        Ok(self.ok_job())
    }

    fn shutdown_instance(&self, name: &str, _timeout_secs: u64) -> Result<JobId> {
        if self.instances.borrow().contains_key(name) {
            Ok(self.ok_job())
        } else {
            Ok(self.failed_job("OpPrereqError", "Instance not known"))
        }
    }

    fn delete_instance(&self, name: &str) -> Result<JobId> {
        if self.instances.borrow_mut().remove(name).is_some() {
            Ok(self.ok_job())
        } else {
            Ok(self.failed_job("OpPrereqError", "Instance not known"))
        }
    }

    fn query_instances(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .instances
            .borrow()
            .iter()
            .map(|(name, tags)| InstanceRecord {
                name: name.clone(),
                tags: tags.clone(),
            })
            .collect())
    }

    fn job_status(&self, id: JobId) -> Result<JobStatus> {
        let jobs = self.jobs.borrow();
        Ok(jobs[(id - 1) as usize].clone())
    }
}

pub struct PlaybookCall {
    pub inventory: String,
    pub vars: BTreeMap<String, String>,
    pub recipe: String,
}

pub struct FakePlaybook {
    pub passes: bool,
    pub calls: RefCell<Vec<PlaybookCall>>,
}

impl FakePlaybook {
    pub fn passing() -> Self {
        Self {
            passes: true,
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl PlaybookRunner for FakePlaybook {
    fn run_playbook(
        &self,
        inventory: &Path,
        extra_vars: &BTreeMap<String, String>,
        recipe: &str,
        log_file: &Path,
    ) -> Result<bool> {
        fs::write(log_file, "PLAY RECAP\n")?;
        self.calls.borrow_mut().push(PlaybookCall {
            inventory: fs::read_to_string(inventory)?,
            vars: extra_vars.clone(),
            recipe: recipe.to_string(),
        });
        Ok(self.passes)
    }
}

pub struct FakeShell {
    pub qa_passes: bool,
    pub commands: RefCell<Vec<(String, String)>>,
    pub uploads: RefCell<Vec<(String, String, Value)>>,
}

impl FakeShell {
    pub fn passing() -> Self {
        Self {
            qa_passes: true,
            commands: RefCell::new(Vec::new()),
            uploads: RefCell::new(Vec::new()),
        }
    }
}

impl RemoteShell for FakeShell {
    fn run(&self, host: &str, command: &str, log_file: &Path) -> Result<bool> {
        fs::write(log_file, "Running QA\n")?;
        self.commands
            .borrow_mut()
            .push((host.to_string(), command.to_string()));
        Ok(self.qa_passes)
    }

    fn copy_to(&self, source: &Path, host: &str, dest: &str) -> Result<()> {
        let content: Value = serde_json::from_slice(&fs::read(source)?)?;
        self.uploads
            .borrow_mut()
            .push((host.to_string(), dest.to_string(), content));
        Ok(())
    }

    fn copy_dir_from(&self, _host: &str, _source: &str, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        fs::write(dest.join("node-daemon.log"), "daemon started\n")?;
        Ok(())
    }

    fn resolve_node(&self, host: &str) -> Result<String> {
        Ok(format!("10.0.0.{}", host.len()))
    }
}

/// Config pointing every path into a scratch directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config: QaConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = QaConfig::default();
        config.cluster.domain = "test.example".to_string();
        config.paths.state_file = dir.path().join("runs.json");
        config.paths.stats_root = dir.path().join("stats");
        config.paths.playbook_dir = dir.path().to_path_buf();
        config.paths.recipe_dir = dir.path().join("qa-configs");
        config.run.poll_period = Duration::from_millis(1);

        fs::create_dir_all(&config.paths.recipe_dir).expect("recipe dir");
        fs::write(
            config.paths.recipe_path("kvm"),
            r#"{"name": "kvm", "nodes": [], "tests": {"cluster-verify": true}}"#,
        )
        .expect("recipe");
        Self { dir, config }
    }

    pub fn state_file(&self) -> PathBuf {
        self.config.paths.state_file.clone()
    }
}
