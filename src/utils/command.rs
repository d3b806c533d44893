//! Short-lived host commands (`mount`, `umount`, `reboot`)
//!
//! restic itself is driven through [`super::restic::Restic`], which streams
//! its output; these helpers are for one-shot commands whose only interesting
//! result is whether they worked.

use anyhow::{Context, Result};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

/// Run `program`, failing on timeout or a non-zero exit status
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let command_line = format!("{} {}", program, args.join(" "));
    debug!("Running command: {}", command_line.trim_end());

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", program, timeout))?
        .with_context(|| format!("Failed to execute {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Command failed: {}: {}", command_line.trim_end(), stderr.trim());
        anyhow::bail!(
            "{} failed with exit code {:?}: {}",
            program,
            output.status.code(),
            stderr.trim()
        );
    }

    Ok(output)
}
