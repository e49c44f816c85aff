//! Dev-server supervision.
//!
//! At most one dev server runs per instance. Its bookkeeping is shared with
//! background tasks (output pump, exit watcher, late-ready listener); each task
//! carries the generation it was started for and only touches bookkeeping of
//! the same generation, so a stale task can never overwrite a newer server.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};

use super::{ErrorSink, Inner, SessionManager, Transcript};
use crate::bundle::ProjectId;
use crate::error::{PreviewError, Result};
use crate::runtime::{Container, ServerReady};

#[derive(Debug, Clone)]
pub(crate) struct DevServer {
    pub(crate) project: ProjectId,
    pub(crate) pid: u32,
    pub(crate) generation: u64,
    pub(crate) url: Option<String>,
    pub(crate) alive: bool,
}

/// Next ready event emitted by `pid`. Other processes in the instance (a
/// superseded dev server still shutting down, say) share the channel.
async fn next_ready(rx: &mut broadcast::Receiver<ServerReady>, pid: u32) -> Option<ServerReady> {
    loop {
        match rx.recv().await {
            Ok(ready) if ready.pid == pid => return Some(ready),
            Ok(ready) => {
                tracing::debug!("Ignoring ready event from pid {} at {}", ready.pid, ready.url);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn with_server<R>(inner: &Weak<Inner>, generation: u64, f: impl FnOnce(&mut DevServer) -> R) -> Option<R> {
    let inner = inner.upgrade()?;
    let mut slot = inner.server.lock();
    match slot.as_mut() {
        Some(server) if server.generation == generation => Some(f(server)),
        _ => None,
    }
}

impl SessionManager {
    /// Project served by a live dev server.
    pub fn served_project(&self) -> Option<ProjectId> {
        self.inner
            .server
            .lock()
            .as_ref()
            .filter(|s| s.alive)
            .map(|s| s.project)
    }

    /// URL of the live dev server, once it has reported ready.
    pub fn preview_url(&self) -> Option<String> {
        self.inner
            .server
            .lock()
            .as_ref()
            .filter(|s| s.alive)
            .and_then(|s| s.url.clone())
    }

    /// URL of a live dev server for `project`, if there is one.
    pub(crate) fn live_url_for(&self, project: ProjectId) -> Option<String> {
        self.inner
            .server
            .lock()
            .as_ref()
            .filter(|s| s.alive && s.project == project)
            .and_then(|s| s.url.clone())
    }

    fn ready_timeout(&self) -> Duration {
        self.inner.config.dev_server.ready_timeout()
    }

    /// Reuse the live server for `project`, or replace whatever runs with a
    /// fresh one, and wait for it to report ready.
    pub(crate) async fn ensure_dev_server(
        &self,
        container: &Arc<dyn Container>,
        project: ProjectId,
        transcript: &Transcript,
        on_error: Option<ErrorSink>,
    ) -> Result<String> {
        // Subscribed before the check so a server that is still starting
        // cannot announce itself unseen in between.
        let starting_rx = container.server_ready();
        let existing = self.inner.server.lock().clone();
        match existing {
            Some(server) if server.alive && server.project == project => {
                if let Some(url) = &server.url {
                    transcript.line(format!("Reusing dev server at {url}"));
                    return Ok(url.clone());
                }
                transcript.line("Dev server is still starting, waiting for it...");
                return self.await_ready(starting_rx, &server, transcript).await;
            }
            _ => {}
        }
        drop(starting_rx);

        self.stop_dev_server(container, transcript).await;
        let mut ready_rx = container.server_ready();

        let generation = self.inner.server_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let dev = &self.inner.config.dev_server;
        transcript.line(format!("Starting dev server: {} {}", dev.program, dev.args.join(" ")));
        let process = container
            .spawn(&dev.program, &dev.args)
            .await
            .map_err(|e| PreviewError::Spawn(PreviewError::describe(&e)))?;
        let pid = process.pid;

        *self.inner.server.lock() = Some(DevServer {
            project,
            pid,
            generation,
            url: None,
            alive: true,
        });
        tracing::info!("Dev server for project {project} started (pid {})", process.pid);

        let (exited_tx, mut exited_rx) = oneshot::channel::<i32>();
        let weak = Arc::downgrade(&self.inner);
        let pump_transcript = transcript.clone();
        tokio::spawn(async move {
            let code = process
                .wait_with_output(|line| pump_transcript.line(line))
                .await;
            let was_ready = with_server(&weak, generation, |s| {
                s.alive = false;
                s.url.is_some()
            });
            tracing::info!("Dev server (generation {generation}) exited with code {code}");
            if was_ready == Some(true) {
                if let Some(on_error) = &on_error {
                    on_error(&format!("Dev server exited with code {code}"));
                }
            }
            let _ = exited_tx.send(code);
        });

        let timeout = self.ready_timeout();
        let waited = tokio::time::timeout(timeout, async {
            tokio::select! {
                ready = next_ready(&mut ready_rx, pid) => Ok(ready),
                code = &mut exited_rx => Err(code.unwrap_or(-1)),
            }
        })
        .await;

        match waited {
            Ok(Ok(Some(ready))) => {
                self.record_ready(generation, &ready.url);
                transcript.line(format!("Dev server ready at {}", ready.url));
                Ok(ready.url)
            }
            Ok(Ok(None)) => Err(PreviewError::Spawn(
                "sandbox closed its server-ready channel".to_string(),
            )),
            Ok(Err(code)) => Err(PreviewError::Spawn(format!(
                "dev server exited with code {code} before it was ready"
            ))),
            Err(_) => {
                self.listen_for_late_ready(ready_rx, generation, pid);
                transcript.line(format!(
                    "Dev server did not report ready within {}s; leaving it running",
                    timeout.as_secs()
                ));
                Err(PreviewError::ServerStartTimeout(timeout))
            }
        }
    }

    /// Wait for an already running `server` to come up.
    async fn await_ready(
        &self,
        mut ready_rx: broadcast::Receiver<ServerReady>,
        server: &DevServer,
        transcript: &Transcript,
    ) -> Result<String> {
        let generation = server.generation;
        let timeout = self.ready_timeout();
        match tokio::time::timeout(timeout, next_ready(&mut ready_rx, server.pid)).await {
            Ok(Some(ready)) => {
                self.record_ready(generation, &ready.url);
                transcript.line(format!("Dev server ready at {}", ready.url));
                Ok(ready.url)
            }
            Ok(None) => Err(PreviewError::Spawn(
                "sandbox closed its server-ready channel".to_string(),
            )),
            Err(_) => {
                // The earlier listener may have recorded it meanwhile.
                if let Some(url) = self.url_of(generation) {
                    return Ok(url);
                }
                self.listen_for_late_ready(ready_rx, generation, server.pid);
                Err(PreviewError::ServerStartTimeout(timeout))
            }
        }
    }

    fn url_of(&self, generation: u64) -> Option<String> {
        self.inner
            .server
            .lock()
            .as_ref()
            .filter(|s| s.generation == generation && s.alive)
            .and_then(|s| s.url.clone())
    }

    fn record_ready(&self, generation: u64, url: &str) {
        let recorded = with_server(&Arc::downgrade(&self.inner), generation, |s| {
            s.url = Some(url.to_string());
        });
        if recorded.is_none() {
            tracing::debug!("Ignoring ready event for superseded dev server (generation {generation})");
        }
    }

    /// Keep listening after a timeout so a slow server's URL is still
    /// recorded for the next load of the same project.
    fn listen_for_late_ready(
        &self,
        mut ready_rx: broadcast::Receiver<ServerReady>,
        generation: u64,
        pid: u32,
    ) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Some(ready) = next_ready(&mut ready_rx, pid).await {
                let recorded = with_server(&weak, generation, |s| {
                    if s.alive && s.url.is_none() {
                        s.url = Some(ready.url.clone());
                        true
                    } else {
                        false
                    }
                });
                if recorded == Some(true) {
                    tracing::info!("Dev server became ready late at {}", ready.url);
                }
            }
        });
    }

    /// Forget the current server and best-effort kill its process.
    pub(crate) async fn stop_dev_server(&self, container: &Arc<dyn Container>, transcript: &Transcript) {
        let previous = self.inner.server.lock().take();
        let Some(previous) = previous else {
            return;
        };
        if previous.alive {
            transcript.line(format!(
                "Stopping dev server for project {}",
                previous.project
            ));
            if let Err(e) = container.kill(previous.pid).await {
                tracing::warn!("Failed to stop dev server (pid {}): {e}", previous.pid);
            }
        }
    }
}
