use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Completion notice of a supervised child process, delivered on the
/// spawner's completion channel so it can be multiplexed in the worker's
/// event loop.
#[derive(Debug)]
pub struct ChildFinished<T> {
    pub tag: T,
    pub success: bool,
}

/// Handle to a supervised child: a stop control (writes `q\n` to the child's
/// stdin, the convention both the MP3 encoder and the audio player honor)
/// and a kill switch for shutdown.
pub struct ChildHandle {
    stdin: Option<ChildStdin>,
    token: CancellationToken,
}

impl ChildHandle {
    /// Ask the child to quit on its own terms.
    pub async fn stop(&mut self) {
        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(err) = stdin.write_all(b"q\n").await {
                warn!(%err, "unable to signal child to stop");
                return;
            }
            if let Err(err) = stdin.flush().await {
                warn!(%err, "unable to flush child stop signal");
            }
        }
    }

    /// Hard-kill the child; used on worker shutdown.
    pub fn kill(&self) {
        self.token.cancel();
    }
}

/// Spawn `command_line` through the shell with piped stdin and report its
/// termination as a `ChildFinished` message on `done_tx`. The child never
/// blocks the spawning loop: waiting happens on a detached task.
pub fn spawn_supervised<T: Send + 'static>(
    command_line: &str,
    tag: T,
    done_tx: mpsc::UnboundedSender<ChildFinished<T>>,
) -> Result<ChildHandle> {
    debug!(command = command_line, "spawning child process");
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn child: {}", command_line))?;

    let stdin = child.stdin.take();
    let token = CancellationToken::new();
    let task_token = token.clone();

    tokio::spawn(async move {
        let success = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status.success(),
                Err(err) => {
                    warn!(%err, "waiting on child failed");
                    false
                }
            },
            _ = task_token.cancelled() => {
                child.kill().await.ok();
                false
            }
        };
        done_tx.send(ChildFinished { tag, success }).ok();
    });

    Ok(ChildHandle {
        stdin,
        token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_event_carries_the_tag_and_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_supervised("true", 42u32, tx).unwrap();
        let done = rx.recv().await.unwrap();
        assert_eq!(done.tag, 42);
        assert!(done.success);
    }

    #[tokio::test]
    async fn failing_child_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_supervised("exit 3", "enc", tx).unwrap();
        let done = rx.recv().await.unwrap();
        assert!(!done.success);
    }

    #[tokio::test]
    async fn stop_writes_the_quit_convention() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // `head -n1` exits once it reads the line the stop control writes.
        let mut handle = spawn_supervised("head -n1 > /dev/null", (), tx).unwrap();
        handle.stop().await;
        let done = rx.recv().await.unwrap();
        assert!(done.success);
    }
}
