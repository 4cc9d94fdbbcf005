use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use qa_runner::lifecycle::RunReport;
use qa_runner::{
    AnsiblePlaybook, CancelFlag, JobPoller, Phase, QaConfig, QaContext, QaError, RapiClient,
    RunRequest, SshShell,
};
use serde_json::{json, Value};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qa", version = "0.3.0", about = "Ganeti cluster QA runner")]
struct Cli {
    /// YAML configuration; built-in defaults apply when the file is absent.
    #[arg(long, global = true, default_value = "qa.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a throwaway cluster and run the QA suite on it.
    Run {
        /// Debian release for the instances, e.g. bookworm.
        #[arg(long)]
        os_version: String,
        /// Recipe name; needs <recipe>.yml and <recipe>.json.
        #[arg(long)]
        recipe: String,
        #[arg(long, default_value = "ganeti/ganeti")]
        source: String,
        #[arg(long, default_value = "master")]
        branch: String,
        #[arg(long)]
        remove_instances_on_success: bool,
        #[arg(long)]
        remove_instances_on_error: bool,
        #[arg(long)]
        build_only: bool,
        #[arg(long)]
        json: bool,
    },
    /// Delete every instance of a run and forget the run.
    Remove {
        #[arg(long)]
        tag: String,
        #[arg(long)]
        json: bool,
    },
    /// List cluster instances grouped by run tag.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Reclaim runs older than the age threshold.
    Sweep {
        #[arg(long)]
        max_age_hours: Option<u64>,
        #[arg(long)]
        json: bool,
    },
}

struct Outcome {
    payload: Option<Value>,
    ok: bool,
}

impl Outcome {
    fn done(payload: Option<Value>) -> Self {
        Self { payload, ok: true }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(&cli.config, cli.command) {
        Ok(outcome) => {
            if let Some(payload) = &outcome.payload {
                emit_json(payload);
            }
            if !outcome.ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// First SIGINT/SIGTERM sets the flag; a second one exits immediately.
fn install_cancel_handler() -> Result<CancelFlag> {
    let cancel = CancelFlag::new();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, 130, cancel.as_atomic())
            .with_context(|| format!("registering handler for signal {}", signal))?;
        signal_hook::flag::register(signal, cancel.as_atomic())
            .with_context(|| format!("registering handler for signal {}", signal))?;
    }
    Ok(cancel)
}

fn load_config(path: &Path) -> Result<QaConfig> {
    debug!(path = %path.display(), exists = path.exists(), "loading configuration");
    QaConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn run_command(config_path: &Path, command: Commands) -> Result<Outcome> {
    let cfg = load_config(config_path)?;
    match command {
        Commands::Run {
            os_version,
            recipe,
            source,
            branch,
            remove_instances_on_success,
            remove_instances_on_error,
            build_only,
            json,
        } => {
            let playbook_path = cfg.paths.playbook_path(&recipe);
            if !playbook_path.is_file() {
                bail!(
                    "recipe '{}' has no playbook at {}",
                    recipe,
                    playbook_path.display()
                );
            }
            let api = RapiClient::new(&cfg.rapi).context("creating remote API client")?;
            let playbook = AnsiblePlaybook {
                playbook_dir: cfg.paths.playbook_dir.clone(),
                user: cfg.run.ssh_user.clone(),
                echo: !json,
            };
            let shell = SshShell {
                user: cfg.run.ssh_user.clone(),
                echo: !json,
            };
            let ctx = QaContext {
                config: &cfg,
                api: &api,
                playbook: &playbook,
                shell: &shell,
                cancel: install_cancel_handler()?,
            };
            let mut request = RunRequest::new(&os_version, &recipe);
            request.source = source;
            request.branch = branch;
            request.remove_on_success = remove_instances_on_success;
            request.remove_on_error = remove_instances_on_error;
            request.build_only = build_only;

            let report = qa_runner::run_test(&ctx, &request, &mut rand::thread_rng())
                .map_err(run_error)?;
            let ok = report.succeeded();
            if json {
                return Ok(Outcome {
                    payload: Some(report_to_json(&report)),
                    ok,
                });
            }
            print_report(&report);
            Ok(Outcome { payload: None, ok })
        }
        Commands::Remove { tag, json } => {
            let api = RapiClient::new(&cfg.rapi).context("creating remote API client")?;
            let poller = JobPoller::new(&api, cfg.run.poll_period, install_cancel_handler()?);
            let removed = qa_runner::remove_run(
                &cfg.paths.state_file,
                &poller,
                &tag,
                cfg.run.shutdown_timeout_secs,
            )
            .with_context(|| format!("removing instances tagged '{}'", tag))?;
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "remove",
                    "tag": tag,
                    "removed": removed
                }))));
            }
            println!("tag: {}", tag);
            println!("removed_instances: {}", removed.len());
            for name in &removed {
                println!("  {}", name);
            }
            Ok(Outcome::done(None))
        }
        Commands::List { json } => {
            let api = RapiClient::new(&cfg.rapi).context("creating remote API client")?;
            let groups = qa_runner::instances_by_tag(&api).context("querying instances")?;
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "list",
                    "groups": groups
                }))));
            }
            for (tag, names) in &groups {
                println!("{}:", tag);
                for name in names {
                    println!("  {}", name);
                }
            }
            Ok(Outcome::done(None))
        }
        Commands::Sweep {
            max_age_hours,
            json,
        } => {
            let hours = max_age_hours.unwrap_or(cfg.run.max_age_hours);
            let hours_i64 = i64::try_from(hours).context("max age too large")?;
            let max_age = chrono::Duration::hours(hours_i64);
            let api = RapiClient::new(&cfg.rapi).context("creating remote API client")?;
            let poller = JobPoller::new(&api, cfg.run.poll_period, install_cancel_handler()?);
            let reclaimed = qa_runner::sweep(
                &cfg.paths.state_file,
                &poller,
                max_age,
                Utc::now(),
                cfg.run.shutdown_timeout_secs,
            )
            .context("sweeping stale runs")?;
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "sweep",
                    "max_age_hours": hours,
                    "reclaimed": reclaimed
                }))));
            }
            println!("max_age_hours: {}", hours);
            println!("reclaimed: {}", reclaimed.len());
            for tag in &reclaimed {
                println!("  {}", tag);
            }
            Ok(Outcome::done(None))
        }
    }
}

/// Aborted runs already name their tag and phase; anything else failed
/// before a tag existed.
fn run_error(err: QaError) -> anyhow::Error {
    match err {
        QaError::RunAborted { .. } => err.into(),
        other => {
            anyhow::Error::new(other).context(format!("phase {} failed", Phase::Allocate))
        }
    }
}

fn format_secs(secs: f64) -> String {
    format!("{:.1}s", secs)
}

fn print_report(report: &RunReport) {
    let rt = &report.stats.runtimes;
    println!("tag: {}", report.tag);
    println!("cluster_ip: {}", report.cluster_ip);
    println!("instances: {}", report.instance_names.join(", "));
    println!("stats_dir: {}", report.stats_dir.display());
    println!("state: {}", report.state());
    println!("instance_create_runtime: {}", format_secs(rt.instance_create));
    println!("playbook_runtime: {}", format_secs(rt.playbook));
    println!("qa_runtime: {}", format_secs(rt.qa));
    println!("overall_runtime: {}", format_secs(rt.overall));
    if let Some(failure) = &report.failure {
        println!("failed_phase: {}", failure.phase);
        println!("error: {}", failure.error);
    }
    if report.torn_down {
        println!("instances_removed: true");
    }
    if let Some(err) = &report.cleanup_error {
        println!("cleanup_error: {}", err);
    }
}

fn report_to_json(report: &RunReport) -> Value {
    json!({
        "ok": report.succeeded(),
        "command": "run",
        "tag": report.tag,
        "cluster_ip": report.cluster_ip,
        "instances": report.instance_names,
        "stats_dir": report.stats_dir.display().to_string(),
        "stats": serde_json::to_value(&report.stats).unwrap_or(Value::Null),
        "failure": report.failure.as_ref().map(|f| json!({
            "phase": f.phase.as_str(),
            "message": f.error.to_string()
        })),
        "instances_removed": report.torn_down,
        "cleanup_error": report.cleanup_error.as_ref().map(|e| e.to_string())
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Remove { json, .. }
        | Commands::List { json }
        | Commands::Sweep { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_requires_os_version_and_recipe() {
        assert!(Cli::try_parse_from(["qa", "run", "--recipe", "kvm"]).is_err());
        assert!(Cli::try_parse_from(["qa", "run", "--os-version", "bookworm"]).is_err());
        let cli = Cli::try_parse_from([
            "qa",
            "--config",
            "lab.yaml",
            "run",
            "--os-version",
            "bookworm",
            "--recipe",
            "kvm",
            "--remove-instances-on-error",
        ])
        .expect("parse");
        assert_eq!(cli.config, PathBuf::from("lab.yaml"));
        match cli.command {
            Commands::Run {
                source,
                branch,
                remove_instances_on_error,
                remove_instances_on_success,
                ..
            } => {
                assert_eq!(source, "ganeti/ganeti");
                assert_eq!(branch, "master");
                assert!(remove_instances_on_error);
                assert!(!remove_instances_on_success);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn remove_requires_tag() {
        assert!(Cli::try_parse_from(["qa", "remove"]).is_err());
        let cli = Cli::try_parse_from(["qa", "remove", "--tag", "brave-homer", "--json"])
            .expect("parse");
        assert!(command_json_mode(&cli.command));
    }

    #[test]
    fn sweep_threshold_is_optional() {
        let cli = Cli::try_parse_from(["qa", "sweep"]).expect("parse");
        match cli.command {
            Commands::Sweep { max_age_hours, .. } => assert_eq!(max_age_hours, None),
            _ => panic!("expected sweep"),
        }
        assert_eq!(format_secs(3.24), "3.2s");
    }

    #[test]
    fn run_errors_name_the_failed_phase() {
        let early = run_error(QaError::TagCollision {
            tag: "brave-homer".to_string(),
        });
        assert!(format!("{:#}", early).starts_with("phase allocate failed: "));

        let late = run_error(QaError::RunAborted {
            tag: "brave-homer".to_string(),
            phase: Phase::Finalize.as_str(),
            source: Box::new(QaError::Config("disk full".to_string())),
        });
        let message = format!("{:#}", late);
        assert!(message.contains("'brave-homer'"), "{}", message);
        assert!(message.contains("during finalize"), "{}", message);
        assert!(!message.contains("allocate"), "{}", message);
    }
}
