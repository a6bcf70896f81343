//! Captured result of a single engine command.

use serde::Serialize;

/// Per-stream capture limit for engine commands (1 MiB).
///
/// `logs` on a long-lived container can replay a lot; anything past the
/// limit is cut and marked.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Output of an engine command.
///
/// A failed command is still a `CommandOutput`: callers decide whether a
/// non-zero exit is a normal outcome (e.g. "no such container") or an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error, or a description of the failure if the command
    /// produced none.
    pub stderr: String,
    /// Exit code, `None` if the process was never spawned or died from a signal.
    pub exit_code: Option<i32>,
    /// Whether the engine binary could be started at all.
    pub spawned: bool,
}

impl CommandOutput {
    /// Output for a process that could not be started.
    pub(crate) fn spawn_failure(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_code: None,
            spawned: false,
        }
    }

    /// True only for a clean exit with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// True when the engine binary itself could not be run (missing,
    /// not executable). Lets callers tell a broken engine apart from a
    /// command that ran and failed.
    pub fn is_spawn_failure(&self) -> bool {
        !self.spawned
    }

    /// Trimmed stdout.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Cap captured engine output at `limit` bytes, cutting on a char boundary.
pub(crate) fn cap_output(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let cut = (0..=limit)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    text.truncate(cut);
    text.push_str("\n... [engine output truncated]");
    text
}
