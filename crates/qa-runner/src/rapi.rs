//! Remote cluster management API.
//!
//! [`ClusterApi`] is the seam the lifecycle code talks to; [`RapiClient`] is the
//! blocking HTTPS implementation for the Ganeti remote API (version 2).

use crate::config::{InstanceTemplate, RapiConfig};
use crate::error::{QaError, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Waiting,
    Canceling,
    Running,
    Success,
    Error,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Error | JobState::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobStatus {
    #[serde(rename = "status")]
    pub state: JobState,
    /// Per-opcode results; holds the error payload for failed jobs.
    #[serde(default)]
    pub opresult: Value,
}

impl JobStatus {
    /// Short human-readable failure detail extracted from `opresult`.
    pub fn failure_detail(&self) -> String {
        let entries = match &self.opresult {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        let parts: Vec<String> = entries
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::String(s) => s.clone(),
                // Ganeti encodes errors as ["OpPrereqError", ["message", "code"]].
                Value::Array(pair) if pair.len() == 2 => {
                    let kind = pair[0].as_str().unwrap_or("error");
                    let msg = match &pair[1] {
                        Value::Array(args) => args
                            .iter()
                            .map(|a| {
                                a.as_str()
                                    .map(str::to_string)
                                    .unwrap_or_else(|| a.to_string())
                            })
                            .collect::<Vec<_>>()
                            .join(", "),
                        other => other
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| other.to_string()),
                    };
                    format!("{}: {}", kind, msg)
                }
                other => other.to_string(),
            })
            .collect();
        if parts.is_empty() {
            format!("job ended with status {:?}", self.state)
        } else {
            parts.join("; ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub name: String,
    pub tags: Vec<String>,
}

impl InstanceRecord {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Everything needed to create one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub name: String,
    pub os_type: String,
    pub tag: String,
    pub template: InstanceTemplate,
}

impl InstanceSpec {
    pub fn new(name: &str, os_variant: &str, tag: &str, template: &InstanceTemplate) -> Self {
        Self {
            name: name.to_string(),
            os_type: format!("{}{}", template.os_prefix, os_variant),
            tag: tag.to_string(),
            template: template.clone(),
        }
    }

    /// Request body for `POST /2/instances`.
    pub fn to_request_body(&self) -> Value {
        let t = &self.template;
        let disks: Vec<Value> = t.disks.iter().map(|size| json!({ "size": size })).collect();
        json!({
            "__version__": 1,
            "beparams": {
                "memory": t.memory,
                "minmem": t.memory,
                "maxmem": t.memory,
                "vcpus": t.vcpus,
            },
            "disk_template": t.disk_template,
            "disks": disks,
            "nics": [{ "network": t.network, "ip": "pool" }],
            "hypervisor": t.hypervisor,
            "iallocator": t.iallocator,
            "name": self.name,
            "os_type": self.os_type,
            "mode": "create",
            "conflicts_check": false,
            "ip_check": false,
            "name_check": false,
            "tags": [self.tag],
        })
    }
}

/// Operations consumed from the remote management service.
///
/// Every mutating call returns a job that the caller must wait on.
pub trait ClusterApi {
    /// `Ok(None)` when the instance does not exist.
    fn get_instance(&self, name: &str) -> Result<Option<Value>>;
    fn create_instance(&self, spec: &InstanceSpec) -> Result<JobId>;
    fn shutdown_instance(&self, name: &str, timeout_secs: u64) -> Result<JobId>;
    fn delete_instance(&self, name: &str) -> Result<JobId>;
    /// All instances with their tags.
    fn query_instances(&self) -> Result<Vec<InstanceRecord>>;
    fn job_status(&self, id: JobId) -> Result<JobStatus>;

    fn instance_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_instance(name)?.is_some())
    }
}

pub struct RapiClient {
    http: Client,
    base_url: String,
    username: String,
    password: Option<String>,
}

impl RapiClient {
    pub fn new(cfg: &RapiConfig) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .timeout(cfg.request_timeout)
            .user_agent(concat!("qa-runner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url(),
            username: cfg.username.clone(),
            password: cfg.resolve_password(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.basic_auth(&self.username, self.password.as_deref())
    }

    fn send(&self, method: &'static str, path: &str, req: RequestBuilder) -> Result<Response> {
        debug!(method, path, "rapi request");
        let resp = self.authed(req).send()?;
        check_status(method, path, resp)
    }

    fn send_for_job(&self, method: &'static str, path: &str, req: RequestBuilder) -> Result<JobId> {
        let body: Value = self.send(method, path, req)?.json()?;
        parse_job_id(&body).ok_or_else(|| QaError::Api {
            method,
            path: path.to_string(),
            status: 200,
            message: format!("response is not a job id: {}", body),
        })
    }
}

fn check_status(method: &'static str, path: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().unwrap_or_default();
    Err(QaError::Api {
        method,
        path: path.to_string(),
        status: status.as_u16(),
        message: error_message(&text),
    })
}

/// RAPI errors carry `{"message": ..., "explain": ...}`; fall back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let message = v.get("message").and_then(|m| m.as_str())?.to_string();
            match v.get("explain").and_then(|e| e.as_str()) {
                Some(explain) if !explain.is_empty() => Some(format!("{} ({})", message, explain)),
                _ => Some(message),
            }
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Job ids come back as a JSON number or a numeric string.
pub fn parse_job_id(body: &Value) -> Option<JobId> {
    match body {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a `/2/query/instance?fields=name,tags` response.
///
/// Each row is a list of `[status, value]` cells in field order.
pub fn parse_instance_rows(body: &Value) -> Result<Vec<InstanceRecord>> {
    let malformed = |what: &str| QaError::Api {
        method: "GET",
        path: "/2/query/instance".to_string(),
        status: 200,
        message: format!("malformed query response: {}", what),
    };
    let rows = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("missing data"))?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let name = row
            .pointer("/0/1")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed("row without name"))?;
        let tags = row
            .pointer("/1/1")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        out.push(InstanceRecord {
            name: name.to_string(),
            tags,
        });
    }
    Ok(out)
}

impl ClusterApi for RapiClient {
    fn get_instance(&self, name: &str) -> Result<Option<Value>> {
        let path = format!("/2/instances/{}", name);
        let resp = self.authed(self.http.get(self.url(&path))).send()?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status("GET", &path, resp)?;
        Ok(Some(resp.json()?))
    }

    fn create_instance(&self, spec: &InstanceSpec) -> Result<JobId> {
        let path = "/2/instances";
        let req = self.http.post(self.url(path)).json(&spec.to_request_body());
        self.send_for_job("POST", path, req)
    }

    fn shutdown_instance(&self, name: &str, timeout_secs: u64) -> Result<JobId> {
        let path = format!("/2/instances/{}/shutdown", name);
        let req = self
            .http
            .put(self.url(&path))
            .json(&json!({ "timeout": timeout_secs }));
        self.send_for_job("PUT", &path, req)
    }

    fn delete_instance(&self, name: &str) -> Result<JobId> {
        let path = format!("/2/instances/{}", name);
        let req = self.http.delete(self.url(&path));
        self.send_for_job("DELETE", &path, req)
    }

    fn query_instances(&self) -> Result<Vec<InstanceRecord>> {
        let path = "/2/query/instance?fields=name,tags";
        let body: Value = self.send("GET", path, self.http.get(self.url(path)))?.json()?;
        parse_instance_rows(&body)
    }

    fn job_status(&self, id: JobId) -> Result<JobStatus> {
        let path = format!("/2/jobs/{}", id);
        let body: Value = self.send("GET", &path, self.http.get(self.url(&path)))?.json()?;
        Ok(serde_json::from_value(body)?)
    }
}
