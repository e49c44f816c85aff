//! Sandboxed runtime abstraction.
//!
//! Defines the [`Runtime`] and [`Container`] traits the session manager drives.
//! A runtime boots containers; a container is one live instance with its own
//! filesystem, process table and "server ready" event stream. Currently one
//! provider ships with the crate:
//!
//! - [`local::LocalRuntime`]: a host directory per instance, processes via
//!   `tokio::process` (no isolation; development and headless use)
//!
//! Embedders with a real browser sandbox implement these traits over it.

pub mod local;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::tree::FileTree;

/// Emitted by a container when a process starts listening on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    /// The [`SpawnedProcess::pid`] that opened the port.
    pub pid: u32,
    pub port: u16,
    pub url: String,
}

/// A process started inside a container.
///
/// `output` yields stdout and stderr lines (interleaved) and closes when the
/// process exits; `exit` resolves with the exit code.
pub struct SpawnedProcess {
    pub pid: u32,
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

impl SpawnedProcess {
    /// Drain output (forwarding each line to `on_line`) and wait for exit.
    /// A dropped exit channel counts as exit code `-1`.
    pub async fn wait_with_output<F>(mut self, mut on_line: F) -> i32
    where
        F: FnMut(&str),
    {
        while let Some(line) = self.output.recv().await {
            on_line(&line);
        }
        self.exit.await.unwrap_or(-1)
    }
}

/// Boots container instances. Implementations decide what "boot" costs; the
/// session manager guarantees at most one boot in flight per manager.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn boot(&self) -> anyhow::Result<Arc<dyn Container>>;
}

/// One booted sandbox instance.
///
/// Paths are project-relative and slash-separated.
#[async_trait]
pub trait Container: Send + Sync {
    /// Unique identity of this instance; caches are keyed by it.
    fn id(&self) -> &str;

    /// Write a whole tree in one call, creating directories as needed.
    async fn mount(&self, tree: &FileTree) -> anyhow::Result<()>;

    /// Write a single file. The parent directory must exist.
    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;

    /// Create a directory and any missing parents.
    async fn mkdir(&self, path: &str) -> anyhow::Result<()>;

    /// Remove a file or directory. Missing paths are not an error.
    async fn remove(&self, path: &str, recursive: bool) -> anyhow::Result<()>;

    /// Start `program args..` in the container's root directory.
    async fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<SpawnedProcess>;

    /// Terminate a process started by [`Container::spawn`].
    async fn kill(&self, pid: u32) -> anyhow::Result<()>;

    /// Subscribe to "server ready" events from every process in the
    /// instance. Subscribe before spawning the server process so the event
    /// cannot be missed, and match on [`ServerReady::pid`].
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Release the instance. Called once, on session disposal.
    async fn teardown(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_with_output_collects_lines_and_exit_code() {
        let (out_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        out_tx.send("added 12 packages".to_string()).unwrap();
        out_tx.send("done".to_string()).unwrap();
        drop(out_tx);
        exit_tx.send(0).unwrap();

        let process = SpawnedProcess { pid: 1, output, exit };
        let mut lines = Vec::new();
        let code = process.wait_with_output(|l| lines.push(l.to_string())).await;

        assert_eq!(code, 0);
        assert_eq!(lines, vec!["added 12 packages", "done"]);
    }

    #[tokio::test]
    async fn dropped_exit_channel_reports_failure() {
        let (out_tx, output) = mpsc::unbounded_channel::<String>();
        let (exit_tx, exit) = oneshot::channel::<i32>();
        drop(out_tx);
        drop(exit_tx);

        let process = SpawnedProcess { pid: 2, output, exit };
        assert_eq!(process.wait_with_output(|_| {}).await, -1);
    }
}
