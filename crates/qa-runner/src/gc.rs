//! Tag-based teardown and reclamation of stale runs.

use crate::error::{QaError, Result};
use crate::jobs::JobPoller;
use crate::rapi::ClusterApi;
use crate::state::RunStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Group key for instances that carry no tag or several tags.
pub const NO_TAG_AVAILABLE: &str = "NO_TAG_AVAILABLE";

/// Shut down and delete every instance carrying `tag`, waiting on each job.
///
/// Every matching instance is attempted; the first failure is returned after
/// the rest have been tried. No matching instances is a successful no-op.
pub fn delete_instances_by_tag(
    poller: &JobPoller<'_>,
    tag: &str,
    shutdown_timeout_secs: u64,
) -> Result<Vec<String>> {
    let targets: Vec<String> = poller
        .api()
        .query_instances()?
        .into_iter()
        .filter(|rec| rec.has_tag(tag))
        .map(|rec| rec.name)
        .collect();
    if targets.is_empty() {
        debug!(tag = %tag, "no instances carry tag");
        return Ok(targets);
    }

    let mut first_error = None;
    for name in &targets {
        match delete_instance(poller, name, shutdown_timeout_secs) {
            Ok(()) => info!(tag = %tag, instance = %name, "instance removed"),
            Err(QaError::Cancelled) => return Err(QaError::Cancelled),
            Err(e) => {
                error!(tag = %tag, instance = %name, error = %e, "failed to remove instance");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(targets),
    }
}

fn delete_instance(poller: &JobPoller<'_>, name: &str, shutdown_timeout_secs: u64) -> Result<()> {
    let job = poller.api().shutdown_instance(name, shutdown_timeout_secs)?;
    poller.wait_for(job, "shut down instance", name)?;
    let job = poller.api().delete_instance(name)?;
    poller.wait_for(job, "delete instance", name)
}

/// Instance names grouped by their single tag.
pub fn instances_by_tag(api: &dyn ClusterApi) -> Result<BTreeMap<String, Vec<String>>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for rec in api.query_instances()? {
        let key = match rec.tags.as_slice() {
            [only] => only.clone(),
            _ => NO_TAG_AVAILABLE.to_string(),
        };
        groups.entry(key).or_default().push(rec.name);
    }
    Ok(groups)
}

/// Operator removal of one run.
///
/// The run leaves the state file even when remote deletion fails; that
/// failure is still returned.
pub fn remove_run(
    store_path: &Path,
    poller: &JobPoller<'_>,
    tag: &str,
    shutdown_timeout_secs: u64,
) -> Result<Vec<String>> {
    let deleted = delete_instances_by_tag(poller, tag, shutdown_timeout_secs);
    let forgotten = RunStore::update(store_path, |store| Ok(store.remove(tag)))?;
    if forgotten.is_none() {
        warn!(tag = %tag, "tag was not recorded in the run state file");
    }
    deleted
}

/// Reclaim every stored run that started more than `max_age` before `now`.
///
/// Each reclaimed tag is dropped from the state file as soon as its instances
/// are gone. A run whose teardown fails stays recorded for the next sweep.
pub fn sweep(
    store_path: &Path,
    poller: &JobPoller<'_>,
    max_age: Duration,
    now: DateTime<Utc>,
    shutdown_timeout_secs: u64,
) -> Result<Vec<String>> {
    let store = RunStore::load(store_path)?;
    let examined = store.len();
    let expired: Vec<String> = store
        .list()
        .into_iter()
        .filter(|run| now.signed_duration_since(run.start_time) > max_age)
        .map(|run| run.tag.clone())
        .collect();
    drop(store);

    let mut reclaimed = Vec::with_capacity(expired.len());
    for tag in expired {
        if poller.cancel_flag().is_cancelled() {
            return Err(QaError::Cancelled);
        }
        match delete_instances_by_tag(poller, &tag, shutdown_timeout_secs) {
            Ok(deleted) => {
                RunStore::update(store_path, |store| Ok(store.remove(&tag)))?;
                info!(tag = %tag, instances = deleted.len(), "reclaimed run");
                reclaimed.push(tag);
            }
            Err(QaError::Cancelled) => return Err(QaError::Cancelled),
            Err(e) => {
                warn!(
                    tag = %tag,
                    error = %e,
                    "could not reclaim run; keeping it for the next sweep"
                );
            }
        }
    }
    info!(
        examined,
        reclaimed = reclaimed.len(),
        max_age_hours = max_age.num_hours(),
        "sweep finished"
    );
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::CancelFlag;
    use crate::rapi::{InstanceRecord, InstanceSpec, JobId, JobState, JobStatus};
    use serde_json::Value;
    use std::cell::RefCell;

    /// Fixed instance list; shutdown of `broken` fails.
    struct StaticCluster {
        records: Vec<InstanceRecord>,
        broken: Option<String>,
        calls: RefCell<Vec<String>>,
    }

    impl StaticCluster {
        fn new(records: &[(&str, &[&str])]) -> Self {
            Self {
                records: records
                    .iter()
                    .map(|(name, tags)| InstanceRecord {
                        name: name.to_string(),
                        tags: tags.iter().map(|t| t.to_string()).collect(),
                    })
                    .collect(),
                broken: None,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ClusterApi for StaticCluster {
        fn get_instance(&self, _name: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        fn create_instance(&self, _spec: &InstanceSpec) -> Result<JobId> {
            unreachable!("gc never creates instances")
        }
        fn shutdown_instance(&self, name: &str, _timeout_secs: u64) -> Result<JobId> {
            self.calls.borrow_mut().push(format!("shutdown {}", name));
            Ok(if self.broken.as_deref() == Some(name) { 2 } else { 1 })
        }
        fn delete_instance(&self, name: &str) -> Result<JobId> {
            self.calls.borrow_mut().push(format!("delete {}", name));
            Ok(1)
        }
        fn query_instances(&self) -> Result<Vec<InstanceRecord>> {
            Ok(self.records.clone())
        }
        fn job_status(&self, id: JobId) -> Result<JobStatus> {
            let state = if id == 2 { JobState::Error } else { JobState::Success };
            Ok(JobStatus {
                state,
                opresult: Value::Null,
            })
        }
    }

    fn poller(api: &dyn ClusterApi) -> JobPoller<'_> {
        JobPoller::new(api, std::time::Duration::from_millis(1), CancelFlag::new())
    }

    #[test]
    fn grouping_uses_single_tag_or_placeholder() {
        let api = StaticCluster::new(&[
            ("bart.d", &["brave-homer"]),
            ("lisa.d", &["brave-homer"]),
            ("moe.d", &[]),
            ("ned.d", &["a", "b"]),
            ("otto.d", &["lazy-otto"]),
        ]);
        let groups = instances_by_tag(&api).expect("groups");
        assert_eq!(groups["brave-homer"], vec!["bart.d", "lisa.d"]);
        assert_eq!(groups[NO_TAG_AVAILABLE], vec!["moe.d", "ned.d"]);
        assert_eq!(groups["lazy-otto"], vec!["otto.d"]);
    }

    #[test]
    fn delete_by_tag_shuts_down_before_deleting() {
        let api = StaticCluster::new(&[("bart.d", &["t1"]), ("moe.d", &["t2"])]);
        let deleted = delete_instances_by_tag(&poller(&api), "t1", 0).expect("delete");
        assert_eq!(deleted, vec!["bart.d"]);
        assert_eq!(*api.calls.borrow(), vec!["shutdown bart.d", "delete bart.d"]);
    }

    #[test]
    fn delete_by_tag_tries_every_instance_then_fails() {
        let mut api = StaticCluster::new(&[("bart.d", &["t1"]), ("lisa.d", &["t1"])]);
        api.broken = Some("bart.d".to_string());
        let err = delete_instances_by_tag(&poller(&api), "t1", 0).expect_err("broken shutdown");
        assert!(matches!(err, QaError::RemoteOperationFailed { .. }));
        assert_eq!(
            *api.calls.borrow(),
            vec!["shutdown bart.d", "shutdown lisa.d", "delete lisa.d"]
        );
    }

    #[test]
    fn remove_run_forgets_tag_even_on_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs.json");
        RunStore::update(&path, |store| {
            store.insert(crate::state::Run::new("t1", "192.168.1.240", "kvm", Utc::now()))
        })
        .expect("seed");

        let mut api = StaticCluster::new(&[("bart.d", &["t1"])]);
        api.broken = Some("bart.d".to_string());
        assert!(remove_run(&path, &poller(&api), "t1", 0).is_err());
        assert!(RunStore::load(&path).expect("load").is_empty());
    }
}
