//! One QA run, from identity allocation to cleanup.
//!
//! Phases run strictly in order: allocate, provision, configure, execute,
//! collect, finalize. Allocation failures surface as `Err` before anything
//! remote has been touched. Every later failure ends the run as `failed`.
//! Phase failures land in [`RunReport::failure`]; a local stats write that
//! fails aborts the run with [`QaError::RunAborted`].

use crate::collab::{
    compress_logs, fix_permissions, render_inventory, render_recipe, PlaybookRunner, RemoteShell,
};
use crate::config::QaConfig;
use crate::error::{QaError, Result};
use crate::gc::delete_instances_by_tag;
use crate::jobs::{CancelFlag, JobPoller};
use crate::names::{allocate_cluster_ip, allocate_instance_names, allocate_tag, IpPool};
use crate::rapi::{ClusterApi, InstanceSpec};
use crate::state::{Run, RunState, RunStore};
use crate::stats::{create_stats_dir, stats_run_id, RunStats};
use crate::{atomic_write_bytes, atomic_write_json_pretty};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Tag samples tried before giving up with `TagCollision`.
pub const TAG_ATTEMPTS: usize = 8;

pub const INVENTORY_FILE: &str = "inventory.ini";
pub const PLAYBOOK_LOG: &str = "playbook.log";
pub const QA_LOG: &str = "qa.log";
pub const RECIPE_COPY: &str = "qa-config.json";

/// Everything a run talks to.
pub struct QaContext<'a> {
    pub config: &'a QaConfig,
    pub api: &'a dyn ClusterApi,
    pub playbook: &'a dyn PlaybookRunner,
    pub shell: &'a dyn RemoteShell,
    pub cancel: CancelFlag,
}

impl<'a> QaContext<'a> {
    pub fn poller(&self) -> JobPoller<'a> {
        JobPoller::new(self.api, self.config.run.poll_period, self.cancel.clone())
    }

    // Teardown must still work after the operator cancelled the run.
    fn teardown_poller(&self) -> JobPoller<'a> {
        JobPoller::new(self.api, self.config.run.poll_period, CancelFlag::new())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(QaError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Debian release name, e.g. `bookworm`.
    pub os_variant: String,
    pub recipe: String,
    pub source: String,
    pub branch: String,
    pub remove_on_success: bool,
    pub remove_on_error: bool,
    /// Stop after the playbook and leave the cluster up.
    pub build_only: bool,
}

impl RunRequest {
    pub fn new(os_variant: &str, recipe: &str) -> Self {
        Self {
            os_variant: os_variant.to_string(),
            recipe: recipe.to_string(),
            source: "ganeti/ganeti".to_string(),
            branch: "master".to_string(),
            remove_on_success: false,
            remove_on_error: false,
            build_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Allocate,
    Provision,
    Configure,
    Execute,
    Collect,
    Finalize,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Allocate => "allocate",
            Phase::Provision => "provision",
            Phase::Configure => "configure",
            Phase::Execute => "execute",
            Phase::Collect => "collect",
            Phase::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct PhaseFailure {
    pub phase: Phase,
    pub error: QaError,
}

impl PhaseFailure {
    fn new(phase: Phase, error: QaError) -> Self {
        Self { phase, error }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub tag: String,
    pub cluster_ip: String,
    pub instance_names: Vec<String>,
    pub stats_dir: PathBuf,
    pub stats: RunStats,
    pub failure: Option<PhaseFailure>,
    /// Instances were deleted and the run dropped from the state file.
    pub torn_down: bool,
    /// Teardown or state bookkeeping failed after the run ended.
    pub cleanup_error: Option<QaError>,
}

impl RunReport {
    pub fn state(&self) -> RunState {
        self.stats.state
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.cleanup_error.is_none()
    }
}

/// Settles the stored run if the run is abandoned before finalize.
///
/// On drop without [`TeardownGuard::complete`], instances are torn down when
/// the run asked for cleanup on error; otherwise the run is marked `failed`.
pub struct TeardownGuard<'c> {
    ctx: &'c QaContext<'c>,
    tag: String,
    remove_on_error: bool,
    done: bool,
}

impl<'c> TeardownGuard<'c> {
    pub fn new(ctx: &'c QaContext<'c>, tag: &str, remove_on_error: bool) -> Self {
        Self {
            ctx,
            tag: tag.to_string(),
            remove_on_error,
            done: false,
        }
    }

    /// Record the terminal state, tearing down first if `remove` is set.
    /// Returns whether teardown happened.
    pub fn complete(mut self, state: RunState, remove: bool) -> Result<bool> {
        self.done = true;
        settle_run(self.ctx, &self.tag, state, remove)
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!(tag = %self.tag, "run aborted before completion");
        if let Err(e) = settle_run(self.ctx, &self.tag, RunState::Failed, self.remove_on_error) {
            error!(
                tag = %self.tag,
                error = %e,
                "cleanup of aborted run failed; the sweep will retry"
            );
        }
    }
}

fn settle_run(ctx: &QaContext<'_>, tag: &str, state: RunState, remove: bool) -> Result<bool> {
    let state_file = &ctx.config.paths.state_file;
    if remove {
        info!(tag = %tag, state = %state, "removing test instances");
        let poller = ctx.teardown_poller();
        let timeout = ctx.config.run.shutdown_timeout_secs;
        if let Err(e) = delete_instances_by_tag(&poller, tag, timeout) {
            if let Err(mark_err) = mark_run_state(state_file, tag, state) {
                warn!(tag = %tag, error = %mark_err, "could not record run state");
            }
            return Err(e);
        }
        RunStore::update(state_file, |store| Ok(store.remove(tag)))?;
        return Ok(true);
    }
    mark_run_state(state_file, tag, state)?;
    Ok(false)
}

fn mark_run_state(state_file: &Path, tag: &str, state: RunState) -> Result<()> {
    RunStore::update(state_file, |store| {
        match store.get_mut(tag) {
            Some(run) => run.state = Some(state),
            None => warn!(tag = %tag, "run vanished from the state file"),
        }
        Ok(())
    })
}

/// Sample a free tag and insert the run under it.
fn reserve_run<R: Rng + ?Sized>(
    store: &mut RunStore,
    rng: &mut R,
    template: Run,
) -> Result<String> {
    let mut last = String::new();
    for _ in 0..TAG_ATTEMPTS {
        let tag = allocate_tag(rng);
        let mut run = template.clone();
        run.tag = tag.clone();
        match store.insert(run) {
            Ok(()) => return Ok(tag),
            Err(QaError::TagCollision { tag }) => {
                debug!(tag = %tag, "tag already in use, resampling");
                last = tag;
            }
            Err(e) => return Err(e),
        }
    }
    Err(QaError::TagCollision { tag: last })
}

/// Allocate names, then tag and cluster IP inside one store transaction.
fn allocate<R: Rng + ?Sized>(
    ctx: &QaContext<'_>,
    req: &RunRequest,
    rng: &mut R,
    started: DateTime<Utc>,
) -> Result<(String, String, Vec<String>)> {
    let cfg = ctx.config;
    let names = allocate_instance_names(rng, cfg.run.instance_count, &cfg.cluster.domain, |name| {
        ctx.api.instance_exists(name)
    })?;
    let pool = IpPool::from(&cfg.cluster);
    let (tag, cluster_ip) = RunStore::update(&cfg.paths.state_file, |store| {
        let cluster_ip = allocate_cluster_ip(&pool, &store.active_ips())?;
        let template = Run::new("", cluster_ip.clone(), req.recipe.clone(), started);
        let tag = reserve_run(store, rng, template)?;
        Ok((tag, cluster_ip))
    })?;
    Ok((tag, cluster_ip, names))
}

fn create_instances(
    ctx: &QaContext<'_>,
    req: &RunRequest,
    tag: &str,
    names: &[String],
) -> Result<()> {
    let poller = ctx.poller();
    for name in names {
        ctx.check_cancelled()?;
        info!(tag = %tag, instance = %name, "creating instance");
        let spec = InstanceSpec::new(name, &req.os_variant, tag, &ctx.config.cluster.instance);
        let job = ctx.api.create_instance(&spec)?;
        poller.wait_for(job, "create instance", name)?;
    }
    Ok(())
}

fn provision(
    ctx: &QaContext<'_>,
    req: &RunRequest,
    tag: &str,
    names: &[String],
    stats_dir: &Path,
    stats: &mut RunStats,
) -> Result<()> {
    let started = Instant::now();
    let created = create_instances(ctx, req, tag, names);
    stats.runtimes.set_instance_create(started.elapsed());
    created?;
    RunStore::update(&ctx.config.paths.state_file, |store| {
        if let Some(run) = store.get_mut(tag) {
            run.instance_names = names.to_vec();
        }
        Ok(())
    })?;
    stats.write(stats_dir)
}

fn configure(
    ctx: &QaContext<'_>,
    req: &RunRequest,
    cluster_ip: &str,
    names: &[String],
    stats_dir: &Path,
    stats: &mut RunStats,
) -> Result<()> {
    ctx.check_cancelled()?;
    let inventory = stats_dir.join(INVENTORY_FILE);
    atomic_write_bytes(&inventory, render_inventory(names).as_bytes())?;

    let mut vars = BTreeMap::new();
    vars.insert("ganeti_source".to_string(), req.source.clone());
    vars.insert("ganeti_branch".to_string(), req.branch.clone());
    vars.insert("ganeti_cluster_ip".to_string(), cluster_ip.to_string());

    let log = stats_dir.join(PLAYBOOK_LOG);
    let started = Instant::now();
    let passed = ctx.playbook.run_playbook(&inventory, &vars, &req.recipe, &log);
    stats.runtimes.set_playbook(started.elapsed());
    if !passed? {
        return Err(QaError::ConfigurationFailed { log });
    }
    stats.write(stats_dir)
}

fn execute(
    ctx: &QaContext<'_>,
    req: &RunRequest,
    names: &[String],
    stats_dir: &Path,
    stats: &mut RunStats,
) -> Result<()> {
    ctx.check_cancelled()?;
    let settings = &ctx.config.run;
    let master = names
        .first()
        .ok_or_else(|| QaError::Config("no instance to run the workload on".to_string()))?;

    let recipe = render_recipe(&ctx.config.paths.recipe_path(&req.recipe), names, |host| {
        ctx.shell.resolve_node(host)
    })?;
    let recipe_copy = stats_dir.join(RECIPE_COPY);
    atomic_write_json_pretty(&recipe_copy, &recipe)?;
    ctx.shell.copy_to(&recipe_copy, master, &settings.remote_recipe_path)?;

    let log = stats_dir.join(QA_LOG);
    let started = Instant::now();
    let passed = ctx.shell.run(master, &settings.qa_command, &log);
    stats.runtimes.set_qa(started.elapsed());
    if !passed? {
        return Err(QaError::WorkloadFailed {
            host: master.clone(),
            log,
        });
    }
    stats.write(stats_dir)
}

/// Best effort: failures are logged and never change the run's outcome.
fn collect_artifacts(ctx: &QaContext<'_>, names: &[String], stats_dir: &Path) {
    if ctx.cancel.is_cancelled() {
        warn!("skipping log collection: cancelled");
        return;
    }
    for name in names {
        let dest = stats_dir.join(name);
        if let Err(e) = ctx
            .shell
            .copy_dir_from(name, &ctx.config.run.remote_log_dir, &dest)
        {
            let err = QaError::ArtifactCollectionFailed {
                instance: name.clone(),
                detail: e.to_string(),
            };
            warn!(phase = %Phase::Collect, error = %err, "skipping node logs");
            continue;
        }
        match compress_logs(&dest) {
            Ok(count) => debug!(instance = %name, compressed = count, "node logs collected"),
            Err(e) => warn!(instance = %name, error = %e, "failed to compress node logs"),
        }
    }
    if let Err(e) = fix_permissions(stats_dir) {
        warn!(dir = %stats_dir.display(), error = %e, "failed to fix permissions");
    }
}

fn drive_phases(
    ctx: &QaContext<'_>,
    req: &RunRequest,
    tag: &str,
    cluster_ip: &str,
    names: &[String],
    stats_dir: &Path,
    stats: &mut RunStats,
) -> std::result::Result<(), PhaseFailure> {
    provision(ctx, req, tag, names, stats_dir, stats)
        .map_err(|e| PhaseFailure::new(Phase::Provision, e))?;

    let outcome = configure(ctx, req, cluster_ip, names, stats_dir, stats)
        .map_err(|e| PhaseFailure::new(Phase::Configure, e))
        .and_then(|()| {
            if req.build_only {
                info!(tag = %tag, "cluster is up; skipping the QA suite (build only)");
                return Ok(());
            }
            execute(ctx, req, names, stats_dir, stats)
                .map_err(|e| PhaseFailure::new(Phase::Execute, e))
        });
    collect_artifacts(ctx, names, stats_dir);
    outcome
}

fn aborted(tag: &str, phase: Phase) -> impl FnOnce(QaError) -> QaError + '_ {
    move |source| QaError::RunAborted {
        tag: tag.to_string(),
        phase: phase.as_str(),
        source: Box::new(source),
    }
}

/// Run one QA test end to end.
///
/// Errors after allocation come back as [`QaError::RunAborted`] naming the
/// tag; the stored run is settled by [`TeardownGuard`] on the way out.
pub fn run_test<R: Rng + ?Sized>(
    ctx: &QaContext<'_>,
    req: &RunRequest,
    rng: &mut R,
) -> Result<RunReport> {
    let started = Utc::now();
    let (tag, cluster_ip, names) = allocate(ctx, req, rng, started)?;
    info!(tag = %tag, cluster_ip = %cluster_ip, instances = ?names, "allocated run");

    let guard = TeardownGuard::new(ctx, &tag, req.remove_on_error);

    let run_id = stats_run_id(&req.recipe, &req.os_variant, &req.source, &req.branch, started);
    let stats_dir = create_stats_dir(&ctx.config.paths.stats_root, &run_id)
        .map_err(aborted(&tag, Phase::Provision))?;
    let mut stats = RunStats::new(
        started,
        &tag,
        &req.recipe,
        &req.os_variant,
        &req.source,
        &req.branch,
    );
    stats.instance_names = names.clone();
    stats
        .write(&stats_dir)
        .map_err(aborted(&tag, Phase::Provision))?;

    let outcome = drive_phases(ctx, req, &tag, &cluster_ip, &names, &stats_dir, &mut stats);

    let state = if outcome.is_ok() {
        RunState::Finished
    } else {
        RunState::Failed
    };
    if let Err(failure) = &outcome {
        error!(tag = %tag, phase = %failure.phase, error = %failure.error, "run failed");
    }
    stats.state = state;
    stats
        .write(&stats_dir)
        .map_err(aborted(&tag, Phase::Finalize))?;

    let remove = match state {
        RunState::Finished => req.remove_on_success,
        _ => req.remove_on_error,
    };
    let (torn_down, cleanup_error) = match guard.complete(state, remove) {
        Ok(torn_down) => (torn_down, None),
        Err(e) => {
            error!(tag = %tag, error = %e, "cleanup failed; run kept for the sweep");
            (false, Some(e))
        }
    };
    info!(
        tag = %tag,
        state = %state,
        overall_secs = stats.runtimes.overall,
        "run complete"
    );

    Ok(RunReport {
        tag,
        cluster_ip,
        instance_names: names,
        stats_dir,
        stats,
        failure: outcome.err(),
        torn_down,
        cleanup_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn reserve_run_resamples_taken_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RunStore::load(dir.path().join("runs.json")).expect("load");
        let template = Run::new("", "192.168.1.240", "kvm", Utc::now());

        let mut probe = StdRng::seed_from_u64(7);
        let first = allocate_tag(&mut probe);
        let mut taken = template.clone();
        taken.tag = first.clone();
        store.insert(taken).expect("seed");

        let mut rng = StdRng::seed_from_u64(7);
        let tag = reserve_run(&mut store, &mut rng, template).expect("reserve");
        assert_ne!(tag, first);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&tag).map(|r| r.tag.as_str()), Some(tag.as_str()));
    }

    #[test]
    fn reserve_run_gives_up_after_bounded_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = RunStore::load(dir.path().join("runs.json")).expect("load");
        let template = Run::new("", "192.168.1.240", "kvm", Utc::now());

        let mut probe = StdRng::seed_from_u64(11);
        for _ in 0..TAG_ATTEMPTS {
            let mut run = template.clone();
            run.tag = allocate_tag(&mut probe);
            let _ = store.insert(run);
        }
        let before = store.len();

        let mut rng = StdRng::seed_from_u64(11);
        let err = reserve_run(&mut store, &mut rng, template).expect_err("all taken");
        assert!(matches!(err, QaError::TagCollision { .. }));
        assert_eq!(store.len(), before);
    }

    #[test]
    fn phases_have_stable_names() {
        let names: Vec<&str> = [
            Phase::Allocate,
            Phase::Provision,
            Phase::Configure,
            Phase::Execute,
            Phase::Collect,
            Phase::Finalize,
        ]
        .iter()
        .map(|p| p.as_str())
        .collect();
        assert_eq!(
            names,
            ["allocate", "provision", "configure", "execute", "collect", "finalize"]
        );
    }
}
