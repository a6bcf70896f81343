//! ContainerEngine - runs container engine subcommands and probes state.

use crate::output::{cap_output, CommandOutput, MAX_CAPTURE_BYTES};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Engine binary used when none is configured.
pub const DEFAULT_ENGINE: &str = "docker";

/// Handle to an external container engine binary (`docker`, `podman`, ...).
///
/// Every call spawns one process. There is no queueing or concurrency
/// limit here; callers that fan out add their own.
#[derive(Debug, Clone)]
pub struct ContainerEngine {
    binary: String,
    base_args: Vec<String>,
}

impl Default for ContainerEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ENGINE)
    }
}

impl ContainerEngine {
    /// Create a handle for the given engine binary (name or path).
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            base_args: Vec::new(),
        }
    }

    /// Arguments placed before every subcommand (e.g. `--context remote`).
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The engine binary this handle invokes.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run an engine subcommand and capture its output.
    ///
    /// Never fails. A non-zero exit is logged and returned with whatever
    /// the command wrote; when it wrote nothing to stderr, stderr carries a
    /// description of the exit status instead. If the binary cannot be
    /// spawned, stderr holds the spawn error and `exit_code` is `None`.
    pub async fn execute<S: AsRef<str>>(&self, args: &[S]) -> CommandOutput {
        let args: Vec<&str> = self
            .base_args
            .iter()
            .map(String::as_str)
            .chain(args.iter().map(AsRef::as_ref))
            .collect();
        debug!(engine = %self.binary, ?args, "executing engine command");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) => {
                let exit_code = out.status.code();
                let stdout = cap_output(
                    String::from_utf8_lossy(&out.stdout).into_owned(),
                    MAX_CAPTURE_BYTES,
                );
                let mut stderr = cap_output(
                    String::from_utf8_lossy(&out.stderr).into_owned(),
                    MAX_CAPTURE_BYTES,
                );

                if out.status.success() {
                    debug!(
                        engine = %self.binary,
                        stdout_len = stdout.len(),
                        stderr_len = stderr.len(),
                        "engine command completed"
                    );
                } else {
                    if stderr.trim().is_empty() {
                        stderr = format!("{} {} failed: {}", self.binary, args.join(" "), out.status);
                    }
                    warn!(
                        engine = %self.binary,
                        ?args,
                        ?exit_code,
                        stderr = %stderr.trim(),
                        "engine command failed"
                    );
                }
                trace!(stdout = %stdout, stderr = %stderr, "engine command output");

                CommandOutput {
                    stdout,
                    stderr,
                    exit_code,
                    spawned: true,
                }
            }
            Err(e) => {
                warn!(engine = %self.binary, ?args, error = %e, "engine command could not be spawned");
                CommandOutput::spawn_failure(format!("failed to execute {}: {}", self.binary, e))
            }
        }
    }

    /// Check whether the engine binary runs and reaches its daemon.
    pub async fn is_engine_available(&self) -> bool {
        let available = self.execute(&["version"]).await.success();
        debug!(engine = %self.binary, available, "engine availability probed");
        available
    }

    /// Check whether a network with this name exists.
    pub async fn network_exists(&self, name: &str) -> bool {
        self.execute(&["network", "inspect", name]).await.success()
    }

    /// Create a network.
    ///
    /// Returns true only if the engine confirmed creation. Any failure,
    /// including "already exists", is false.
    pub async fn create_network(&self, name: &str) -> bool {
        let created = self.execute(&["network", "create", name]).await.success();
        if created {
            debug!(network = %name, "network created");
        }
        created
    }

    /// Check whether a container with this name or id exists.
    pub async fn container_exists(&self, id: &str) -> bool {
        self.execute(&["container", "inspect", id]).await.success()
    }

    /// Check whether a container is running.
    ///
    /// Parses the templated `.State.Running` query; anything other than a
    /// successful `true` is false.
    pub async fn is_container_running(&self, id: &str) -> bool {
        let out = self
            .execute(&["inspect", "-f", "{{.State.Running}}", id])
            .await;
        out.success() && out.stdout_trimmed() == "true"
    }

    /// Internal IP address of a container, if the engine reports one.
    pub async fn container_ip(&self, id: &str) -> Option<String> {
        let out = self
            .execute(&[
                "inspect",
                "-f",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                id,
            ])
            .await;
        if !out.success() {
            return None;
        }
        out.stdout_trimmed()
            .split_whitespace()
            .next()
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSING_BINARY: &str = "devbox-engine-test-missing-binary";

    #[tokio::test]
    async fn test_execute_bogus_subcommand_does_not_fail() {
        // Whether or not docker is installed, this must come back as output
        let engine = ContainerEngine::default();
        let out = engine.execute(&["definitely-not-a-subcommand"]).await;
        assert!(!out.success());
        assert!(!out.stderr.trim().is_empty());
    }

    #[tokio::test]
    async fn test_execute_missing_binary() {
        let engine = ContainerEngine::new(MISSING_BINARY);
        let out = engine.execute(&["ps"]).await;
        assert!(out.is_spawn_failure());
        assert_eq!(out.exit_code, None);
        assert!(out.stderr.contains(MISSING_BINARY));
    }

    #[tokio::test]
    async fn test_execute_captures_streams_and_exit_code() {
        let engine = ContainerEngine::new("sh");
        let out = engine
            .execute(&["-c", "echo out; echo err >&2; exit 3"])
            .await;
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.is_spawn_failure());
    }

    #[tokio::test]
    async fn test_silent_failure_gets_stderr_message() {
        let engine = ContainerEngine::new("false");
        let out = engine.execute(&["anything"]).await;
        assert!(!out.success());
        assert!(out.stderr.contains("false anything failed"));
    }

    #[tokio::test]
    async fn test_probes_false_for_missing_container() {
        let engine = ContainerEngine::default();
        assert!(!engine.container_exists("devbox-no-such-container-xyz").await);
        assert!(!engine.is_container_running("devbox-no-such-container-xyz").await);
        assert!(engine.container_ip("devbox-no-such-container-xyz").await.is_none());
    }

    #[tokio::test]
    async fn test_probes_false_when_engine_missing() {
        let engine = ContainerEngine::new(MISSING_BINARY);
        assert!(!engine.is_engine_available().await);
        assert!(!engine.network_exists("devbox-network").await);
        assert!(!engine.create_network("devbox-network").await);
        assert!(!engine.container_exists("abc").await);
        assert!(!engine.is_container_running("abc").await);
    }

    #[tokio::test]
    async fn test_base_args_prepended() {
        let engine = ContainerEngine::new("sh").with_base_args(["-c", "echo \"$0 $1\""]);
        let out = engine.execute(&["ps", "-q"]).await;
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "ps -q");
    }

    #[tokio::test]
    async fn test_running_probe_requires_literal_true() {
        // `echo` exits 0 but prints its arguments, not "true"
        let engine = ContainerEngine::new("echo");
        assert!(!engine.is_container_running("abc").await);
        // `true` exits 0, so existence holds
        assert!(ContainerEngine::new("true").container_exists("abc").await);
    }
}
