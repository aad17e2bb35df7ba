// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launching the external checkpoint/restore tool.
//!
//! The tool itself is a black box: the core hands it a state directory
//! and flags, consumes its exit status, and logs its output. The
//! action-script callback it can invoke mid-dump is handled by the
//! daemon's migration source, not here.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use slog::{debug, warn, Logger};
use thiserror::Error;

use crate::container::Container;

/// Name of the checkpoint tool binary looked up on PATH.
pub const TOOL: &str = "criu";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to spawn checkpoint tool: {0}")]
    Spawn(std::io::Error),

    #[error("checkpoint tool exited with {status}: {stderr}")]
    Failed { status: std::process::ExitStatus, stderr: String },

    #[error("checkpoint tool exited before signalling dump completion")]
    EarlyExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAction {
    Dump,
    Restore,
}

/// Arguments for one invocation of the checkpoint tool, mirroring the
/// flags the container runtime accepts.
#[derive(Debug, Clone)]
pub struct CheckpointArgs {
    pub action: CheckpointAction,
    pub state_dir: PathBuf,
    /// Stop (kill) the container once the dump is complete.
    pub stop: bool,
    /// Install the action script from the state directory so the tool
    /// calls back after the dump instead of exiting.
    pub action_script: bool,
}

/// A container runtime version, used to gate action-script support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RuntimeVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> RuntimeVersion {
        RuntimeVersion { major, minor, patch }
    }

    pub fn at_least(&self, other: RuntimeVersion) -> bool {
        *self >= other
    }
}

/// Runtimes older than this cannot run an action script during the dump;
/// for them the dump is driven synchronously instead.
pub const ACTION_SCRIPT_MIN_VERSION: RuntimeVersion = RuntimeVersion::new(2, 0, 4);

/// Whether the checkpoint tool is present on PATH. Live migration is
/// refused up front on either side when it is not.
pub fn tool_available() -> bool {
    binary_on_path(TOOL)
}

/// PATH lookup for an external tool.
pub fn binary_on_path(name: &str) -> bool {
    let path = match std::env::var_os("PATH") {
        Some(path) => path,
        None => return false,
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(OsStr::new(name));
        candidate.is_file()
    })
}

/// Runs the checkpoint tool for `container` and waits for it to exit.
///
/// With an action script installed the wait spans the whole dump plus the
/// script's hang-until-restore-outcome; callers that need the
/// dump-complete signal watch the action-script websocket concurrently.
/// Tool stderr after a success is logged and swallowed: by then the
/// container has already been handed over.
pub async fn run(
    container: &dyn Container,
    args: &CheckpointArgs,
    log: &Logger,
) -> Result<(), CheckpointError> {
    let mut cmd = container.checkpoint_command(args);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(log, "running checkpoint tool";
        "action" => ?args.action,
        "state_dir" => %args.state_dir.display(),
        "stop" => args.stop,
        "action_script" => args.action_script,
    );

    let output = cmd.output().await.map_err(CheckpointError::Spawn)?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(log, "checkpoint tool: {}", line);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(CheckpointError::Failed {
            status: output.status,
            stderr: last_lines(&stderr, 5),
        });
    }

    if !stderr.is_empty() {
        warn!(log, "checkpoint tool wrote to stderr after success";
            "stderr" => last_lines(&stderr, 5));
    }

    Ok(())
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(RuntimeVersion::new(2, 0, 4).at_least(ACTION_SCRIPT_MIN_VERSION));
        assert!(RuntimeVersion::new(2, 1, 0).at_least(ACTION_SCRIPT_MIN_VERSION));
        assert!(RuntimeVersion::new(3, 0, 0).at_least(ACTION_SCRIPT_MIN_VERSION));
        assert!(!RuntimeVersion::new(2, 0, 3).at_least(ACTION_SCRIPT_MIN_VERSION));
        assert!(!RuntimeVersion::new(1, 9, 9).at_least(ACTION_SCRIPT_MIN_VERSION));
    }

    #[test]
    fn last_lines_trims() {
        assert_eq!(last_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(last_lines("a", 5), "a");
        assert_eq!(last_lines("", 5), "");
    }
}
