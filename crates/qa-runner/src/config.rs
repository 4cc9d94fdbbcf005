//! Tool configuration, read from a YAML file.
//!
//! Every field has a default matching the staging cluster the tool was built
//! for, so an absent config file is valid. Secrets may be supplied through the
//! environment variable named by `rapi.password_env` instead of the file.

use crate::error::{QaError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QaConfig {
    pub rapi: RapiConfig,
    pub cluster: ClusterConfig,
    pub paths: PathsConfig,
    pub run: RunSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RapiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub password_env: Option<String>,
    pub verify_tls: bool,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for RapiConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5080,
            username: "rapi".to_string(),
            password: None,
            password_env: Some("QA_RAPI_PASSWORD".to_string()),
            verify_tls: false,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RapiConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    /// The environment variable wins over the file so the file can be shared.
    pub fn resolve_password(&self) -> Option<String> {
        self.password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
            .or_else(|| self.password.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub domain: String,
    /// First three octets including the trailing dot, e.g. `192.168.1.`.
    pub ip_prefix: String,
    pub ip_first: u8,
    pub ip_last: u8,
    pub instance: InstanceTemplate,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            domain: "staging.ganeti.org".to_string(),
            ip_prefix: "192.168.1.".to_string(),
            ip_first: 240,
            ip_last: 253,
            instance: InstanceTemplate::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceTemplate {
    pub memory: String,
    pub vcpus: u32,
    pub disks: Vec<String>,
    pub disk_template: String,
    pub network: String,
    pub hypervisor: String,
    pub iallocator: String,
    /// Prepended to the requested OS variant, e.g. `debootstrap+bookworm`.
    pub os_prefix: String,
}

impl Default for InstanceTemplate {
    fn default() -> Self {
        Self {
            memory: "6G".to_string(),
            vcpus: 4,
            disks: vec!["10G".to_string(), "22G".to_string()],
            disk_template: "plain".to_string(),
            network: "staging".to_string(),
            hypervisor: "kvm".to_string(),
            iallocator: "hail".to_string(),
            os_prefix: "debootstrap+".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub state_file: PathBuf,
    pub stats_root: PathBuf,
    /// Directory holding `<recipe>.yml` playbooks.
    pub playbook_dir: PathBuf,
    /// Directory holding `<recipe>.json` QA scenario descriptions.
    pub recipe_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("runs.json"),
            stats_root: PathBuf::from("/var/lib/ganeti-qa"),
            playbook_dir: PathBuf::from("."),
            recipe_dir: PathBuf::from("qa-configs"),
        }
    }
}

impl PathsConfig {
    pub fn playbook_path(&self, recipe: &str) -> PathBuf {
        self.playbook_dir.join(format!("{}.yml", recipe))
    }

    pub fn recipe_path(&self, recipe: &str) -> PathBuf {
        self.recipe_dir.join(format!("{}.json", recipe))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub instance_count: usize,
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,
    pub shutdown_timeout_secs: u64,
    pub max_age_hours: u64,
    pub ssh_user: String,
    pub qa_command: String,
    pub remote_recipe_path: String,
    pub remote_log_dir: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            instance_count: 3,
            poll_period: Duration::from_secs(1),
            shutdown_timeout_secs: 0,
            max_age_hours: 16,
            ssh_user: "root".to_string(),
            qa_command: "export PYTHONPATH=\"/usr/src/ganeti:/usr/share/ganeti/default\"; \
                         cd /usr/src/ganeti/qa; python3 -u ganeti-qa.py --yes-do-it /tmp/recipe.json"
                .to_string(),
            remote_recipe_path: "/tmp/recipe.json".to_string(),
            remote_log_dir: "/var/log/ganeti".to_string(),
        }
    }
}

impl QaConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let cfg: QaConfig = serde_yaml::from_str(&raw)
            .map_err(|e| QaError::Config(format!("{}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.ip_first > self.cluster.ip_last {
            return Err(QaError::Config(format!(
                "cluster.ip_first ({}) is greater than cluster.ip_last ({})",
                self.cluster.ip_first, self.cluster.ip_last
            )));
        }
        if self.run.instance_count == 0 {
            return Err(QaError::Config(
                "run.instance_count must be at least 1".to_string(),
            ));
        }
        if self.run.poll_period.is_zero() {
            return Err(QaError::Config("run.poll_period must be non-zero".to_string()));
        }
        Ok(())
    }
}
