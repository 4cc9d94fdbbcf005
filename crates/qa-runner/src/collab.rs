//! External collaborators: the configuration playbook, the remote shell and
//! file copy, plus the files handed to them.
//!
//! All of them are subprocesses whose only contract is the exit status. Output
//! is tee'd to the console and to a log file in the run's stats directory.

use crate::error::{QaError, Result};
use crate::ensure_dir;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Runs the configuration-management playbook for a recipe.
pub trait PlaybookRunner {
    /// `Ok(false)` when the playbook ran but failed.
    fn run_playbook(
        &self,
        inventory: &Path,
        extra_vars: &BTreeMap<String, String>,
        recipe: &str,
        log_file: &Path,
    ) -> Result<bool>;
}

/// Command execution and file transfer on cluster nodes.
pub trait RemoteShell {
    /// `Ok(false)` when the command ran but exited non-zero.
    fn run(&self, host: &str, command: &str, log_file: &Path) -> Result<bool>;
    fn copy_to(&self, source: &Path, host: &str, dest: &str) -> Result<()>;
    fn copy_dir_from(&self, host: &str, source: &str, dest: &Path) -> Result<()>;

    /// Address used as the node's secondary (replication) IP.
    fn resolve_node(&self, host: &str) -> Result<String> {
        resolve_ipv4(host)
    }
}

pub struct AnsiblePlaybook {
    pub playbook_dir: PathBuf,
    pub user: String,
    pub echo: bool,
}

impl PlaybookRunner for AnsiblePlaybook {
    fn run_playbook(
        &self,
        inventory: &Path,
        extra_vars: &BTreeMap<String, String>,
        recipe: &str,
        log_file: &Path,
    ) -> Result<bool> {
        // The playbook runs from its own directory.
        let inventory = fs::canonicalize(inventory)?;
        let mut cmd = Command::new("ansible-playbook");
        cmd.arg("-u")
            .arg(&self.user)
            .arg("-i")
            .arg(&inventory)
            .arg("-e")
            .arg(format_extra_vars(extra_vars))
            .arg(format!("{}.yml", recipe))
            .current_dir(&self.playbook_dir);
        run_logged(cmd, log_file, self.echo)
    }
}

pub struct SshShell {
    pub user: String,
    pub echo: bool,
}

impl SshShell {
    fn remote(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }
}

impl RemoteShell for SshShell {
    fn run(&self, host: &str, command: &str, log_file: &Path) -> Result<bool> {
        let mut cmd = Command::new("ssh");
        cmd.arg(self.remote(host)).arg(command);
        run_logged(cmd, log_file, self.echo)
    }

    fn copy_to(&self, source: &Path, host: &str, dest: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.arg(source).arg(format!("{}:{}", self.remote(host), dest));
        run_checked(cmd, "copy file to", host)
    }

    fn copy_dir_from(&self, host: &str, source: &str, dest: &Path) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .arg("-r")
            .arg(format!("{}:{}", self.remote(host), source))
            .arg(dest);
        run_checked(cmd, "copy directory from", host)
    }
}

fn run_checked(mut cmd: Command, operation: &str, host: &str) -> Result<()> {
    info!(command = %describe_command(&cmd), "running");
    let output = cmd.stdin(Stdio::null()).output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr_tail = String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .to_string();
    Err(QaError::remote(
        operation,
        host,
        format!("{} ({})", stderr_tail, exit_label(output.status.code())),
    ))
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|c| format!("exit status {}", c))
        .unwrap_or_else(|| "killed by signal".to_string())
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Run `cmd`, copying its stdout and stderr line by line to `log_file` and,
/// if `echo` is set, to our stdout. Returns whether it exited successfully.
pub fn run_logged(mut cmd: Command, log_file: &Path, echo: bool) -> Result<bool> {
    info!(command = %describe_command(&cmd), log = %log_file.display(), "running");
    if let Some(parent) = log_file.parent() {
        ensure_dir(parent)?;
    }
    let mut log = io::BufWriter::new(fs::File::create(log_file)?);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(spawn_line_reader(out, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(spawn_line_reader(err, tx.clone()));
    }
    drop(tx);

    // Keep draining after a log write error so the child never blocks on a full pipe.
    let mut write_error: Option<io::Error> = None;
    let stdout = io::stdout();
    for line in rx {
        if echo {
            let _ = writeln!(stdout.lock(), "{}", line);
        }
        if write_error.is_none() {
            if let Err(e) = writeln!(log, "{}", line) {
                write_error = Some(e);
            }
        }
    }
    for reader in readers {
        let _ = reader.join();
    }
    let status = child.wait()?;
    if let Some(e) = write_error {
        return Err(e.into());
    }
    log.flush()?;
    debug!(status = %exit_label(status.code()), "command finished");
    Ok(status.success())
}

pub fn describe_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    shell_join(&parts)
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// `k=v` pairs for `ansible-playbook -e`, values quoted when needed.
pub fn format_extra_vars(vars: &BTreeMap<String, String>) -> String {
    vars.iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inventory with the first node as master and the rest as non-masters.
pub fn render_inventory(nodes: &[String]) -> String {
    let master = nodes.first().map(String::as_str).unwrap_or_default();
    let others = nodes.iter().skip(1).cloned().collect::<Vec<_>>().join("\n");
    format!(
        "[ganeti_nodes:children]\nmaster_node\nnon_master_nodes\n\n[master_node]\n{}\n\n[non_master_nodes]\n{}\n",
        master, others
    )
}

/// First IPv4 address `host` resolves to.
pub fn resolve_ipv4(host: &str) -> Result<String> {
    let addrs = (host, 0u16).to_socket_addrs()?;
    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Ok(v4.to_string());
        }
    }
    Err(QaError::remote(
        "resolve",
        host,
        "no IPv4 address found",
    ))
}

/// Load the recipe's QA description and attach the node list.
///
/// Each node becomes `{"primary": <fqdn>, "secondary": <ipv4>}`.
pub fn render_recipe<F>(recipe_file: &Path, nodes: &[String], mut resolve: F) -> Result<Value>
where
    F: FnMut(&str) -> Result<String>,
{
    let raw = fs::read(recipe_file)?;
    let mut recipe: Value = serde_json::from_slice(&raw)?;
    let obj = recipe.as_object_mut().ok_or_else(|| {
        QaError::Config(format!(
            "recipe {} must be a JSON object",
            recipe_file.display()
        ))
    })?;
    let mut node_list = Vec::with_capacity(nodes.len());
    for node in nodes {
        node_list.push(json!({
            "primary": node,
            "secondary": resolve(node)?,
        }));
    }
    obj.insert("nodes".to_string(), Value::Array(node_list));
    Ok(recipe)
}

/// Gzip every `*.log` file below `dir` in place. Returns the number compressed.
pub fn compress_logs(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_log = path.extension().and_then(|e| e.to_str()) == Some("log");
        if !entry.file_type().is_file() || !is_log {
            continue;
        }
        let mut gz_name = path.as_os_str().to_owned();
        gz_name.push(".gz");
        let gz_path = PathBuf::from(gz_name);
        let mut input = fs::File::open(path)?;
        let mut encoder = GzEncoder::new(fs::File::create(&gz_path)?, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        fs::remove_file(path)?;
        count += 1;
    }
    Ok(count)
}

/// Make the stats tree world-readable for the report web server.
pub fn fix_permissions(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in WalkDir::new(dir).min_depth(1).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable path");
                    continue;
                }
            };
            let mode = if entry.file_type().is_dir() { 0o755 } else { 0o644 };
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))?;
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
