//! Restic subprocess utilities
//!
//! Every command runs with `--json` where restic supports it so that progress
//! and results can be parsed line by line.

use crate::config::RetentionPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Upper bound for commands that only read repository metadata
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(300);

/// Environment variables for restic
#[derive(Clone)]
pub struct ResticEnv {
    vars: HashMap<String, String>,
}

impl ResticEnv {
    /// Create new ResticEnv with password and repository location
    pub fn new(password: &str, repository: &Path) -> Self {
        let mut vars = HashMap::new();
        vars.insert("RESTIC_PASSWORD".to_string(), password.to_string());
        vars.insert(
            "RESTIC_REPOSITORY".to_string(),
            repository.display().to_string(),
        );
        Self { vars }
    }

    /// Add custom environment variable
    pub fn add(&mut self, key: String, value: String) {
        self.vars.insert(key, value);
    }

    /// Get all environment variables
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn repository(&self) -> Option<&str> {
        self.vars.get("RESTIC_REPOSITORY").map(String::as_str)
    }

    pub fn password(&self) -> Option<&str> {
        self.vars.get("RESTIC_PASSWORD").map(String::as_str)
    }
}

impl std::fmt::Debug for ResticEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResticEnv")
            .field("repository", &self.repository())
            .finish_non_exhaustive()
    }
}

/// How to invoke the restic binary
#[derive(Debug, Clone)]
pub struct Restic {
    binary: String,
    cache_dir: Option<PathBuf>,
}

impl Restic {
    pub fn new(binary: impl Into<String>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cache_dir,
        }
    }

    /// Resolve the binary through PATH
    pub fn locate(&self) -> Result<PathBuf> {
        which::which(&self.binary)
            .with_context(|| format!("restic binary '{}' not found in PATH", self.binary))
    }

    fn command(&self, env: &ResticEnv, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(cache_dir) = &self.cache_dir {
            cmd.arg("--cache-dir").arg(cache_dir);
        }
        cmd.args(args);
        for (key, value) in env.vars() {
            cmd.env(key, value);
        }
        cmd.env("RESTIC_PROGRESS_FPS", "1");
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run restic to completion and return stdout
    pub async fn output(
        &self,
        env: &ResticEnv,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<String> {
        debug!("Running restic {}", args.join(" "));

        let mut cmd = self.command(env, args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| anyhow::anyhow!("restic {} timed out after {:?}", args[0], limit))?,
            None => cmd.output().await,
        }
        .with_context(|| format!("Failed to execute restic {}", args[0]))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(describe_failure(&stderr, output.status));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run restic, handing every stdout line to `on_line` as it arrives
    pub async fn stream(
        &self,
        env: &ResticEnv,
        args: &[String],
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<()> {
        debug!("Streaming restic {}", args.join(" "));

        let mut cmd = self.command(env, args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute restic {}", args[0]))?;

        let stdout = child.stdout.take().context("restic stdout not captured")?;
        let mut stderr = child.stderr.take().context("restic stderr not captured")?;
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read restic output")?
        {
            on_line(&line);
        }

        let status = child.wait().await.context("Failed to wait for restic")?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            anyhow::bail!(describe_failure(&stderr, status));
        }

        Ok(())
    }

    /// Start a long-running restic process (used by `mount`)
    pub fn spawn(&self, env: &ResticEnv, args: &[String]) -> Result<Child> {
        debug!("Spawning restic {}", args.join(" "));

        let mut cmd = self.command(env, args);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.spawn()
            .with_context(|| format!("Failed to execute restic {}", args[0]))
    }
}

/// Turn restic's stderr into a single error message. With `--json` restic
/// reports fatal errors as `{"message_type":"exit_error","message":...}`.
pub fn describe_failure(stderr: &str, status: ExitStatus) -> String {
    let mut messages = Vec::new();
    for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => {
                if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
                    messages.push(message.to_string());
                } else if let Some(error) = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                {
                    messages.push(error.to_string());
                }
            }
            Err(_) => messages.push(line.to_string()),
        }
    }

    if messages.is_empty() {
        format!("restic exited with {}", status)
    } else {
        messages.join("\n")
    }
}

/// True if restic rejected the repository password
pub fn is_wrong_password(message: &str) -> bool {
    message.contains("wrong password")
}

/// Progress record normalized from restic's status messages
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ToolProgress {
    /// 0.0 ..= 100.0
    pub percent: f64,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub bytes_per_second: Option<u64>,
    pub seconds_remaining: Option<u64>,
}

/// Status line emitted by `backup --json` and `restore --json`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusMessage {
    #[serde(default)]
    pub percent_done: f64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub bytes_done: u64,
    #[serde(default)]
    pub bytes_restored: u64,
    #[serde(default)]
    pub seconds_elapsed: u64,
    #[serde(default)]
    pub seconds_remaining: Option<u64>,
}

impl StatusMessage {
    pub fn to_progress(&self) -> ToolProgress {
        let bytes_done = self.bytes_done.max(self.bytes_restored);
        let bytes_per_second = if self.seconds_elapsed > 0 {
            Some(bytes_done / self.seconds_elapsed)
        } else {
            None
        };

        ToolProgress {
            percent: (self.percent_done * 100.0).clamp(0.0, 100.0),
            bytes_done,
            total_bytes: self.total_bytes,
            bytes_per_second,
            seconds_remaining: self.seconds_remaining,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryMessage {
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub total_bytes_processed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ResticMessage {
    Status(StatusMessage),
    Summary(SummaryMessage),
    #[serde(other)]
    Other,
}

/// Parse one line of `--json` output; non-JSON lines yield `None`
pub fn parse_message(line: &str) -> Option<ResticMessage> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Snapshot information as reported by `restic snapshots --json`
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub summary: Option<SnapshotSummary>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotSummary {
    #[serde(default)]
    pub total_bytes_processed: u64,
}

impl Snapshot {
    /// Creation time as milliseconds since the Unix epoch
    pub fn timestamp_millis(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(&self.time)
            .ok()
            .map(|t| t.timestamp_millis())
    }

    /// Bytes processed when the snapshot was taken
    pub fn size(&self) -> u64 {
        self.summary
            .as_ref()
            .map(|s| s.total_bytes_processed)
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct LsEntry {
    #[serde(default)]
    struct_type: String,
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct StatsOutput {
    #[serde(default)]
    total_size: u64,
}

/// Initialize a restic repository
pub async fn init_repository(restic: &Restic, env: &ResticEnv) -> Result<()> {
    info!("Initializing restic repository at {:?}", env.repository());

    match restic
        .output(env, &["init".to_string()], Some(METADATA_TIMEOUT))
        .await
    {
        Ok(_) => {
            info!("Repository initialized successfully");
            Ok(())
        }
        Err(e) if e.to_string().contains("already initialized") => {
            info!("Repository already initialized");
            Ok(())
        }
        Err(e) => Err(e.context("Failed to initialize repository")),
    }
}

/// Open the repository and read its config to prove location and password
pub async fn verify_repository(restic: &Restic, env: &ResticEnv) -> Result<()> {
    restic
        .output(
            env,
            &["cat".to_string(), "config".to_string()],
            Some(METADATA_TIMEOUT),
        )
        .await?;
    Ok(())
}

pub fn build_backup_args(paths: &[PathBuf], exclude_file: &Path, hostname: &str) -> Vec<String> {
    let mut args = vec![
        "backup".to_string(),
        "--json".to_string(),
        "--one-file-system".to_string(),
        "--host".to_string(),
        hostname.to_string(),
        "--exclude-file".to_string(),
        exclude_file.display().to_string(),
    ];
    args.extend(paths.iter().map(|p| p.display().to_string()));
    args
}

/// Back up `paths`, reporting progress; returns the new snapshot id
pub async fn backup(
    restic: &Restic,
    env: &ResticEnv,
    paths: &[PathBuf],
    exclude_file: &Path,
    hostname: &str,
    on_progress: &mut (dyn FnMut(ToolProgress) + Send),
) -> Result<String> {
    info!("Starting restic backup of {} paths", paths.len());

    let args = build_backup_args(paths, exclude_file, hostname);
    let mut snapshot_id = None;
    let mut on_line = |line: &str| match parse_message(line) {
        Some(ResticMessage::Status(status)) => on_progress(status.to_progress()),
        Some(ResticMessage::Summary(summary)) => snapshot_id = summary.snapshot_id,
        _ => {}
    };
    restic.stream(env, &args, &mut on_line).await?;

    snapshot_id.context("restic backup finished without reporting a snapshot id")
}

pub fn build_forget_args(retention: &RetentionPolicy) -> Vec<String> {
    let mut args = vec!["forget".to_string(), "--prune".to_string()];
    let rules = [
        ("--keep-last", retention.last),
        ("--keep-hourly", retention.hourly),
        ("--keep-daily", retention.daily),
        ("--keep-weekly", retention.weekly),
        ("--keep-monthly", retention.monthly),
        ("--keep-yearly", retention.yearly),
    ];
    for (flag, count) in rules {
        if count > 0 {
            args.push(flag.to_string());
            args.push(count.to_string());
        }
    }
    args
}

/// Apply retention policy to repository
pub async fn apply_retention(
    restic: &Restic,
    env: &ResticEnv,
    retention: &RetentionPolicy,
) -> Result<()> {
    let args = build_forget_args(retention);
    if args.len() == 2 {
        warn!("Retention policy keeps nothing, skipping forget");
        return Ok(());
    }

    info!("Applying retention policy...");
    restic.output(env, &args, None).await?;
    info!("Retention policy applied successfully");
    Ok(())
}

/// List snapshots in a repository
pub async fn list_snapshots(restic: &Restic, env: &ResticEnv) -> Result<Vec<Snapshot>> {
    let stdout = restic
        .output(
            env,
            &["snapshots".to_string(), "--json".to_string()],
            Some(METADATA_TIMEOUT),
        )
        .await?;

    let snapshots: Vec<Snapshot> =
        serde_json::from_str(stdout.trim()).context("Failed to parse snapshots JSON")?;
    debug!("Found {} snapshots", snapshots.len());
    Ok(snapshots)
}

/// Names of the direct children of `directory` inside a snapshot
pub async fn list_snapshot_files(
    restic: &Restic,
    env: &ResticEnv,
    snapshot_id: &str,
    directory: &Path,
) -> Result<Vec<String>> {
    let args = vec![
        "ls".to_string(),
        "--json".to_string(),
        snapshot_id.to_string(),
        directory.display().to_string(),
    ];
    let stdout = restic.output(env, &args, Some(METADATA_TIMEOUT)).await?;
    Ok(parse_ls_output(&stdout, directory))
}

pub fn parse_ls_output(stdout: &str, directory: &Path) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<LsEntry>(line).ok())
        .filter(|entry| entry.struct_type == "node" || entry.message_type == "node")
        .filter(|entry| Path::new(&entry.path).parent() == Some(directory))
        .map(|entry| entry.name)
        .collect()
}

/// Restore `source` from a snapshot into `target`, reporting progress
pub async fn restore_snapshot(
    restic: &Restic,
    env: &ResticEnv,
    snapshot_id: &str,
    source: &Path,
    target: &Path,
    on_progress: &mut (dyn FnMut(ToolProgress) + Send),
) -> Result<()> {
    info!("Restoring {}:{} into {:?}", snapshot_id, source.display(), target);

    let args = vec![
        "restore".to_string(),
        "--json".to_string(),
        format!("{}:{}", snapshot_id, source.display()),
        "--target".to_string(),
        target.display().to_string(),
    ];
    let mut on_line = |line: &str| {
        if let Some(ResticMessage::Status(status)) = parse_message(line) {
            on_progress(status.to_progress());
        }
    };
    restic.stream(env, &args, &mut on_line).await?;

    info!("Restore completed successfully");
    Ok(())
}

/// Bytes the repository occupies on its storage
pub async fn raw_data_size(restic: &Restic, env: &ResticEnv) -> Result<u64> {
    let args = vec![
        "stats".to_string(),
        "--json".to_string(),
        "--mode".to_string(),
        "raw-data".to_string(),
    ];
    let stdout = restic.output(env, &args, Some(METADATA_TIMEOUT)).await?;
    let stats: StatsOutput =
        serde_json::from_str(stdout.trim()).context("Failed to parse stats JSON")?;
    Ok(stats.total_size)
}
