//! Shell command seam.
//!
//! Every external process quarry starts goes through a [`Connector`]:
//! configuration callouts, instance provisioning, enumeration and the
//! test workers themselves. The caller decides what commands to run;
//! the connector only runs them. Tests substitute their own implementation
//! or point the [`ShellConnector`] at scripted `sh` fragments.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

/// Collected output of a completed command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs shell commands on behalf of the orchestrator.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Runs `command` to completion with stdin closed, collecting stdout
    /// and stderr.
    async fn run(&self, command: &str) -> std::io::Result<ExecOutput>;

    /// Spawns `command` as a worker: stdout piped for the event stream,
    /// stdin closed so runners cannot stall on reads, stderr passed
    /// through to the user.
    fn spawn(&self, command: &str) -> std::io::Result<Child>;

    /// Connector name, for logging.
    fn name(&self) -> &str;
}

/// The production connector: `sh -c` on the local host.
#[derive(Debug, Default)]
pub struct ShellConnector {
    working_dir: Option<PathBuf>,
}

impl ShellConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd.stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Connector for ShellConnector {
    async fn run(&self, command: &str) -> std::io::Result<ExecOutput> {
        debug!("running: {}", command);
        let output = self
            .command(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn spawn(&self, command: &str) -> std::io::Result<Child> {
        debug!("spawning worker: {}", command);
        let mut cmd = self.command(command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        // If the run is interrupted the child must not outlive us.
        cmd.kill_on_drop(true);
        cmd.spawn()
    }

    fn name(&self) -> &str {
        "shell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_collects_output_and_exit_code() {
        let connector = ShellConnector::new();
        let output = connector
            .run("printf out; printf err >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, b"out");
        assert_eq!(output.stderr, b"err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn spawn_pipes_stdout() {
        use tokio::io::AsyncReadExt;

        let connector = ShellConnector::new();
        let mut child = connector.spawn("printf 'worker output'").unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let mut collected = Vec::new();
        stdout.read_to_end(&mut collected).await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(collected, b"worker output");
    }

    #[tokio::test]
    async fn stdin_is_closed() {
        // `cat` with a closed stdin terminates immediately instead of
        // blocking the run.
        let connector = ShellConnector::new();
        let output = connector.run("cat").await.unwrap();
        assert!(output.success());
        assert!(output.stdout.is_empty());
    }

    #[tokio::test]
    async fn working_dir_applies() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ShellConnector::new().with_working_dir(dir.path().to_path_buf());
        let output = connector.run("pwd").await.unwrap();
        let reported = output.stdout_text();
        let reported = reported.trim();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(reported).canonicalize().unwrap(),
            canonical
        );
    }
}
