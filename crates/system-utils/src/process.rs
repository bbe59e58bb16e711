use std::io::Write;
use std::process::{Output, Stdio};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Runs `cmd` to completion, feeding `input` on stdin and capturing stdout/stderr.
///
/// The child is killed and reaped when `command_timeout` elapses.
pub async fn run_command_with_input(
    cmd: &mut Command,
    input: &[u8],
    command_timeout: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {label}"))?;

    let mut stdin_pipe = child.stdin.take();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let input = input.to_vec();

    let feed = async move {
        if let Some(mut pipe) = stdin_pipe.take() {
            // the child may exit without reading its input
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        }
    };
    let read_stdout = async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };
    let read_stderr = async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };

    let run = async {
        let ((), stdout, stderr, status) =
            tokio::join!(feed, read_stdout, read_stderr, child.wait());
        (stdout, stderr, status)
    };

    let result = timeout(command_timeout, run).await;
    match result {
        Ok((stdout, stderr, status)) => Ok(Output {
            status: status.with_context(|| format!("{label} failed"))?,
            stdout,
            stderr,
        }),
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            anyhow::bail!("{label} timed out after {}s", command_timeout.as_secs())
        }
    }
}

/// Flushes stdout and stderr, then exits the process with `code`.
///
/// Planned exits go through here so buffered command output is never lost.
pub fn drain_and_exit(code: i32) -> ! {
    let _ = std::io::stdout().lock().flush();
    let _ = std::io::stderr().lock().flush();
    std::process::exit(code)
}
