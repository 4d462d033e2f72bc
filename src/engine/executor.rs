//! Child process execution with stream capture, timeout, and cancellation.

use crate::store::INTERRUPTED_STDERR;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How long to keep draining pipes after a kill. A grandchild that survives
/// the kill and holds the pipe open must not wedge the worker.
const POST_KILL_DRAIN: Duration = Duration::from_secs(2);

/// Structured outcome of one command execution.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// True iff the command exited zero and did not time out.
    pub success: bool,
    /// `-1` when no exit code is available (killed, spawn failure).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Run `command` through the OS shell with a bounded lifetime.
///
/// Stdout and stderr are drained concurrently so a chatty child can never
/// dead-lock against a full pipe buffer. On timeout the whole process tree
/// is killed and the result carries `timed_out = true`; on cancellation the
/// result is tagged as interrupted instead.
pub async fn execute(
    command: &str,
    working_dir: Option<&Path>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> JobResult {
    let mut cmd = shell_command(command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return JobResult {
                success: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("spawn error: {e}"),
                timed_out: false,
            }
        }
    };

    let stdout_task = drain(child.stdout.take());
    let stderr_task = drain(child.stderr.take());

    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        () = tokio::time::sleep(timeout) => Waited::TimedOut,
        () = cancel.cancelled() => Waited::Cancelled,
    };

    match waited {
        Waited::Exited(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            let exit_code = status.code().unwrap_or(-1);
            JobResult {
                success: status.success(),
                exit_code,
                stdout,
                stderr,
                timed_out: false,
            }
        }
        Waited::Exited(Err(e)) => {
            let _ = kill_tree(&mut child).await;
            JobResult {
                success: false,
                exit_code: -1,
                stdout: bounded_join(stdout_task).await,
                stderr: format!("wait error: {e}"),
                timed_out: false,
            }
        }
        Waited::TimedOut => {
            let code = kill_tree(&mut child).await;
            JobResult {
                success: false,
                exit_code: code.unwrap_or(-1),
                stdout: bounded_join(stdout_task).await,
                stderr: bounded_join(stderr_task).await,
                timed_out: true,
            }
        }
        Waited::Cancelled => {
            let _ = kill_tree(&mut child).await;
            JobResult {
                success: false,
                exit_code: -1,
                stdout: bounded_join(stdout_task).await,
                stderr: INTERRUPTED_STDERR.to_string(),
                timed_out: false,
            }
        }
    }
}

/// Build the platform shell invocation. The spawned shell leads its own
/// process group on Unix so a timeout kill reaches the whole tree; on
/// Windows the child gets no console window.
fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.process_group(0);
        cmd
    }
}

/// Drain one pipe to EOF off-task. Read failures after a kill surface as
/// empty output, not errors.
fn drain<R>(stream: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Collect whatever a drain task produced, bounded so a surviving
/// grandchild holding the pipe cannot wedge the worker.
async fn bounded_join(task: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(POST_KILL_DRAIN, task).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}

/// Kill the child's process tree and reap it. An attempt to kill an
/// already-exited process is swallowed. Returns the exit code, if any.
async fn kill_tree(child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The shell leads its own process group; a negative pid signals
        // every process in it.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) => status.code(),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    const LONG: Duration = Duration::from_secs(30);

    fn idle_token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let result = execute("echo executor-ok", None, LONG, &idle_token()).await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("executor-ok"));
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stderr_and_exit_code_on_failure() {
        let result = execute(
            "ls definitely_missing_file_for_executor_test",
            None,
            LONG,
            &idle_token(),
        )
        .await;
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert!(result.stderr.contains("definitely_missing_file_for_executor_test"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_the_requested_working_directory() {
        let tmp = TempDir::new().unwrap();
        let result = execute("pwd", Some(tmp.path()), LONG, &idle_token()).await;
        assert!(result.success);
        let reported = result.stdout.trim();
        let expected = tmp.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(reported).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn spawn_failure_becomes_a_result_not_a_panic() {
        let missing = Path::new("/definitely/not/a/directory");
        let result = execute("echo hi", Some(missing), LONG, &idle_token()).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("spawn error"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child_quickly() {
        let started = Instant::now();
        let result = execute(
            "sleep 60",
            None,
            Duration::from_millis(200),
            &idle_token(),
        )
        .await;
        assert!(result.timed_out);
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_keeps_output_produced_before_the_kill() {
        let result = execute(
            "echo early-output; sleep 60",
            None,
            Duration::from_millis(300),
            &idle_token(),
        )
        .await;
        assert!(result.timed_out);
        assert!(result.stdout.contains("early-output"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_is_tagged_as_interrupted() {
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { execute("sleep 60", None, LONG, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stderr, INTERRUPTED_STDERR);
    }
}
