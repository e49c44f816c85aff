//! Local runtime provider: each instance is a directory on the host.
//!
//! Processes run through `tokio::process` with the instance directory as the
//! working directory. "Server ready" is inferred from process output: the
//! first `http://localhost:<port>` style URL a process prints. There is no
//! isolation beyond path containment checks on file operations.
//!
//! On unix every process leads its own process group, and killing it signals
//! the whole group: `npm run dev` forks the real server, which would otherwise
//! outlive npm while holding the output pipes and the port.

use super::{Container, Runtime, ServerReady, SpawnedProcess};
use crate::tree::FileTree;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Time between SIGTERM and SIGKILL when stopping a process group.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long output pumps may keep reading after the process itself exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static ANSI regex"));

static LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):(\d{2,5})")
        .expect("static URL regex")
});

/// Remove terminal color/cursor sequences from a line of process output.
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

/// Parse a "server is listening" announcement out of a line printed by `pid`.
pub fn detect_server_ready(pid: u32, line: &str) -> Option<ServerReady> {
    let caps = LOCAL_URL.captures(line)?;
    let port: u16 = caps.get(1)?.as_str().parse().ok()?;
    Some(ServerReady {
        pid,
        port,
        url: format!("http://localhost:{port}"),
    })
}

/// Boots one host directory per instance under `root`.
pub struct LocalRuntime {
    root: PathBuf,
}

impl LocalRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn boot(&self) -> anyhow::Result<Arc<dyn Container>> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create instance dir {}: {e}", dir.display()))?;

        tracing::info!(instance = %id, dir = %dir.display(), "booted local sandbox instance");
        Ok(Arc::new(LocalContainer::new(id, dir)))
    }
}

/// A booted local instance.
pub struct LocalContainer {
    id: String,
    root: PathBuf,
    ready_tx: broadcast::Sender<ServerReady>,
    next_pid: AtomicU32,
    /// Kill switches for live processes, by pid.
    kills: Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>>,
}

impl LocalContainer {
    fn new(id: String, root: PathBuf) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            id,
            root,
            ready_tx,
            next_pid: AtomicU32::new(1),
            kills: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a project-relative path inside the instance directory,
    /// rejecting anything that would escape it.
    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    anyhow::ensure!(normalized.pop(), "path escapes sandbox: {path}");
                }
                Component::Prefix(_) => anyhow::bail!("unsupported path: {path}"),
            }
        }
        Ok(self.root.join(normalized))
    }
}

fn pump_lines<R>(
    pid: u32,
    reader: R,
    tx: mpsc::UnboundedSender<String>,
    ready_tx: broadcast::Sender<ServerReady>,
    announced: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = strip_ansi(&line);
            if !announced.load(Ordering::SeqCst) {
                if let Some(ready) = detect_server_ready(pid, &line) {
                    announced.store(true, Ordering::SeqCst);
                    // No subscribers is fine; nobody is waiting for this server.
                    let _ = ready_tx.send(ready);
                }
            }
            // Receiver may be gone; keep draining so the process never blocks on a full pipe.
            let _ = tx.send(line);
        }
    })
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // A negative pid addresses every process in the group.
    if unsafe { libc::kill(-pgid, signal) } != 0 {
        tracing::debug!(
            "signal {signal} to process group {pgid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Stop `child` and everything it started: SIGTERM to the group, then
/// SIGKILL once the grace period runs out.
#[cfg(unix)]
async fn terminate(child: &mut Child, pgid: Option<u32>) {
    let Some(pgid) = pgid else {
        // Already reaped.
        return;
    };
    signal_group(pgid, libc::SIGTERM);
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
    // Grandchildren may ignore SIGTERM even after the leader is gone.
    signal_group(pgid, libc::SIGKILL);
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _pgid: Option<u32>) {
    if let Err(e) = child.kill().await {
        tracing::debug!("kill: {e}");
    }
}

/// Wait for the pumps to hit EOF, aborting any still held open by an orphan.
async fn drain(pumps: Vec<JoinHandle<()>>) {
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    for mut pump in pumps {
        if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}

#[async_trait]
impl Container for LocalContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, tree: &FileTree) -> anyhow::Result<()> {
        for (path, contents) in tree.files() {
            let target = self.resolve(&path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, contents)
                .await
                .map_err(|e| anyhow::anyhow!("mount {path}: {e}"))?;
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| anyhow::anyhow!("write {path}: {e}"))
    }

    async fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| anyhow::anyhow!("mkdir {path}: {e}"))
    }

    async fn remove(&self, path: &str, recursive: bool) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        anyhow::ensure!(target != self.root, "refusing to remove the sandbox root");

        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(anyhow::anyhow!("stat {path}: {e}")),
        };

        let result = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&target).await
            } else {
                tokio::fs::remove_dir(&target).await
            }
        } else {
            tokio::fs::remove_file(&target).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::anyhow!("remove {path}: {e}")),
        }
    }

    async fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<SpawnedProcess> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {program}: {e}"))?;
        // Group leader, so the OS pid doubles as the process group id.
        let pgid = child.id();

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (out_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.kills.lock().insert(pid, kill_tx);

        let announced = Arc::new(AtomicBool::new(false));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_lines(
                pid,
                stdout,
                out_tx.clone(),
                self.ready_tx.clone(),
                Arc::clone(&announced),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_lines(
                pid,
                stderr,
                out_tx,
                self.ready_tx.clone(),
                announced,
            ));
        }

        let kills = Arc::clone(&self.kills);
        let program = program.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    tracing::debug!("stopping {program} (pid {pid})");
                    terminate(&mut child, pgid).await;
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::debug!("wait {program} (pid {pid}): {e}");
                    -1
                }
            };
            drain(pumps).await;
            kills.lock().remove(&pid);
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess { pid, output, exit })
    }

    async fn kill(&self, pid: u32) -> anyhow::Result<()> {
        match self.kills.lock().remove(&pid) {
            Some(kill) => {
                let _ = kill.send(());
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        let kills: Vec<_> = self.kills.lock().drain().collect();
        for (_, kill) in kills {
            let _ = kill.send(());
        }
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to remove instance dir {}: {e}",
                self.root.display()
            )),
        }
    }
}
