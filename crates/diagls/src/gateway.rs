//
// gateway.rs
//
// Cancellable external process execution
//

use std::borrow::Cow;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::context::{Interrupt, RequestContext};

/// Deadline for `docker ps` when probing a container.
const VALIDATE_TARGET_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for `which <binary>` inside a container.
const VALIDATE_BINARY_TIMEOUT: Duration = Duration::from_secs(15);
/// How long to keep draining pipes after a kill. A grandchild that inherited
/// the pipe can hold it open long after the direct child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start command: {0}")]
    Spawn(String),
    #[error("failed waiting for command: {0}")]
    Wait(String),
    #[error("command cancelled")]
    Cancelled,
    #[error("command deadline exceeded")]
    DeadlineExceeded,
}

impl CommandError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CommandError::Cancelled | CommandError::DeadlineExceeded)
    }
}

impl From<Interrupt> for CommandError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => CommandError::Cancelled,
            Interrupt::DeadlineExceeded => CommandError::DeadlineExceeded,
        }
    }
}

/// Outcome of one external command.
///
/// A non-zero exit is not an error: `exit_code` carries it so callers can
/// tell tool-specific "found something" codes apart from real failures.
/// `error` is set only when the process could not be started or waited on,
/// or was killed because its context ended. Output captured up to that
/// point is kept in every case.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process never ran or was terminated by a signal
    pub exit_code: Option<i32>,
    pub error: Option<CommandError>,
}

impl CommandResult {
    pub fn completed(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn failed(error: CommandError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(CommandError::is_cancellation)
    }

    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

async fn drain<R>(mut pipe: R, sink: SharedBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend_from_slice(&chunk[..n]),
            Err(e) => {
                log::trace!("Pipe read failed: {e}");
                break;
            }
        }
    }
}

fn take_buffer(buffer: &SharedBuffer) -> Vec<u8> {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

async fn join_reader(handle: Option<JoinHandle<()>>, grace: Option<Duration>) {
    let Some(handle) = handle else {
        return;
    };
    match grace {
        Some(grace) => {
            if tokio::time::timeout(grace, handle).await.is_err() {
                log::trace!("Pipe still open {grace:?} after kill; keeping partial output");
            }
        }
        None => {
            let _ = handle.await;
        }
    }
}

/// Run `program` with `args` until it exits or `ctx` ends.
///
/// When `ctx` is cancelled or its deadline passes first, the process is
/// killed and reaped before returning. Both pipes are drained while the
/// process runs.
pub async fn run_process(
    ctx: &RequestContext,
    program: &str,
    args: &[String],
    stdin: Option<&str>,
) -> CommandResult {
    if let Some(interrupt) = ctx.interrupted() {
        return CommandResult::failed(interrupt.into());
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return CommandResult::failed(CommandError::Spawn(format!("{program}: {e}"))),
    };

    let stdout_buf = SharedBuffer::default();
    let stderr_buf = SharedBuffer::default();
    let stdout_reader = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stdout_buf.clone())));
    let stderr_reader = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain(pipe, stderr_buf.clone())));

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_owned();
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                log::trace!("Failed to write command stdin: {e}");
            }
            // dropping the pipe closes it so the child sees EOF
        });
    }

    let waited = tokio::select! {
        status = child.wait() => Ok(status),
        interrupt = ctx.done() => Err(interrupt),
    };

    let (exit_code, error, grace) = match waited {
        Ok(Ok(status)) => (status.code(), None, None),
        Ok(Err(e)) => (None, Some(CommandError::Wait(e.to_string())), Some(DRAIN_GRACE)),
        Err(interrupt) => {
            log::info!("Command interrupted ({interrupt:?}), killing: {program} {}", args.join(" "));
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill {program}: {e}");
            }
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    log::warn!("Failed to reap {program} after kill: {e}");
                    None
                }
            };
            (code, Some(interrupt.into()), Some(DRAIN_GRACE))
        }
    };

    join_reader(stdout_reader, grace).await;
    join_reader(stderr_reader, grace).await;

    CommandResult {
        stdout: take_buffer(&stdout_buf),
        stderr: take_buffer(&stderr_buf),
        exit_code,
        error,
    }
}

/// Executes analysis commands inside an execution target.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a shell command line in `target`, feeding `stdin` when given.
    async fn run(
        &self,
        ctx: &RequestContext,
        target: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> CommandResult;

    /// Check that `target` exists and is running.
    async fn validate_target(&self, target: &str) -> anyhow::Result<()>;

    /// Check that `binary` resolves inside `target`.
    async fn validate_binary(&self, target: &str, binary: &str) -> anyhow::Result<()>;
}

/// Runs commands with `docker exec` in a running container.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    docker: String,
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }
}

impl DockerRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different docker-compatible CLI (e.g. `podman`).
    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            docker: executable.into(),
        }
    }
}

/// `-i` keeps stdin attached and is only passed when there is input to send.
pub fn docker_exec_args(container: &str, command: &str, interactive: bool) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if interactive {
        args.push("-i".to_string());
    }
    args.extend([
        container.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]);
    args
}

#[async_trait]
impl CommandRunner for DockerRunner {
    async fn run(
        &self,
        ctx: &RequestContext,
        target: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> CommandResult {
        let stdin = stdin.filter(|input| !input.is_empty());
        log::debug!("Running in {target}: {command}");
        let args = docker_exec_args(target, command, stdin.is_some());
        run_process(ctx, &self.docker, &args, stdin).await
    }

    async fn validate_target(&self, target: &str) -> anyhow::Result<()> {
        let ctx = RequestContext::new().with_timeout(VALIDATE_TARGET_TIMEOUT);
        let args = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("name={target}"),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let result = run_process(&ctx, &self.docker, &args, None).await;

        match &result.error {
            Some(CommandError::DeadlineExceeded) => {
                bail!("container validation timed out for {target}")
            }
            Some(e) => return Err(anyhow!("container validation failed for {target}: {e}")),
            None => {}
        }
        if !result.success() {
            bail!(
                "container validation failed for {target}: {}",
                result.stderr_text().trim()
            );
        }

        let stdout = result.stdout_text();
        if stdout.lines().any(|name| name.trim() == target) {
            Ok(())
        } else {
            bail!("container {target} is not running; docker output: {}", stdout.trim())
        }
    }

    async fn validate_binary(&self, target: &str, binary: &str) -> anyhow::Result<()> {
        let ctx = RequestContext::new().with_timeout(VALIDATE_BINARY_TIMEOUT);
        let result = self.run(&ctx, target, &format!("which {binary}"), None).await;
        if result.error == Some(CommandError::DeadlineExceeded) {
            bail!("binary validation timed out for {binary} in container {target}");
        }

        let stdout = result.stdout_text();
        if stdout.trim() == binary {
            Ok(())
        } else {
            bail!(
                "binary {binary} not found in container {target}; docker output: {}",
                stdout.trim()
            )
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_docker_exec_args_without_stdin() {
        assert_eq!(
            docker_exec_args("php", "phpstan analyze a.php", false),
            args(&["exec", "php", "sh", "-c", "phpstan analyze a.php"])
        );
    }

    #[test]
    fn test_docker_exec_args_with_stdin() {
        assert_eq!(
            docker_exec_args("php", "php-cs-fixer fix -", true),
            args(&["exec", "-i", "php", "sh", "-c", "php-cs-fixer fix -"])
        );
    }

    #[tokio::test]
    async fn test_run_process_captures_stdout() {
        let result = run_process(&RequestContext::new(), "echo", &args(&["hello"]), None).await;
        assert!(result.success());
        assert_eq!(result.stdout_text(), "hello\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported_structurally() {
        let result = run_process(
            &RequestContext::new(),
            "sh",
            &args(&["-c", "echo oops >&2; exit 8"]),
            None,
        )
        .await;
        assert_eq!(result.exit_code, Some(8));
        assert!(result.error.is_none());
        assert!(!result.success());
        assert_eq!(result.stderr_text(), "oops\n");
    }

    #[tokio::test]
    async fn test_stdin_is_piped_and_closed() {
        let result = run_process(&RequestContext::new(), "cat", &[], Some("<?php\necho 1;\n")).await;
        assert!(result.success());
        assert_eq!(result.stdout_text(), "<?php\necho 1;\n");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = run_process(
            &RequestContext::new(),
            "/definitely/not/a/real/binary",
            &[],
            None,
        )
        .await;
        assert!(matches!(result.error, Some(CommandError::Spawn(_))));
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_already_cancelled_context_never_spawns() {
        let ctx = RequestContext::new();
        ctx.cancel();
        let result = run_process(&ctx, "/definitely/not/a/real/binary", &[], None).await;
        assert_eq!(result.error, Some(CommandError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = run_process(&ctx, "sleep", &args(&["30"]), None).await;
        assert_eq!(result.error, Some(CommandError::Cancelled));
        assert!(result.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let result = run_process(&ctx, "sleep", &args(&["30"]), None).await;
        assert_eq!(result.error, Some(CommandError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_partial_output_survives_kill() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(500));
        let result = run_process(&ctx, "sh", &args(&["-c", "echo partial; sleep 30"]), None).await;
        assert_eq!(result.error, Some(CommandError::DeadlineExceeded));
        assert!(result.stdout_text().contains("partial"));
    }

    #[test]
    fn test_cancellation_errors() {
        assert!(CommandError::Cancelled.is_cancellation());
        assert!(CommandError::DeadlineExceeded.is_cancellation());
        assert!(!CommandError::Spawn("x".into()).is_cancellation());
    }
}
