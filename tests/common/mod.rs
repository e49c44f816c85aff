#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use sandbox_preview::tree::FileTree;
use sandbox_preview::{
    BundleSource, Container, FileBundle, PreviewConfig, ProjectId, Runtime, ServerReady,
    SessionManager, SpawnedProcess,
};

/// One call made against a fake container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Mount(Vec<String>),
    Write(String),
    Mkdir(String),
    Remove(String),
    Spawn(Vec<String>),
    Kill(u32),
}

impl Op {
    pub fn touches_fs(&self) -> bool {
        matches!(self, Op::Mount(_) | Op::Write(_) | Op::Mkdir(_) | Op::Remove(_))
    }
}

/// Scripted result of one `npm install` spawn.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub lines: Vec<String>,
    pub code: i32,
}

impl InstallOutcome {
    pub fn ok() -> Self {
        Self {
            lines: vec!["added 42 packages in 3s".to_string()],
            code: 0,
        }
    }

    pub fn cache_corruption() -> Self {
        Self {
            lines: vec![
                "npm ERR! code ENOTEMPTY".to_string(),
                "npm ERR! syscall rename".to_string(),
            ],
            code: 1,
        }
    }

    pub fn failure(message: &str) -> Self {
        Self {
            lines: vec![message.to_string()],
            code: 1,
        }
    }
}

/// Knobs shared by every container a [`FakeRuntime`] boots.
pub struct Behavior {
    pub installs: Mutex<VecDeque<InstallOutcome>>,
    /// `None` means the dev server never reports ready.
    pub dev_ready_after: Mutex<Option<Duration>>,
    /// Per-spawn overrides of `dev_ready_after`, consumed in spawn order.
    pub dev_ready_plan: Mutex<VecDeque<Option<Duration>>>,
    /// Dev server exits with code 1 this long after reporting ready.
    pub dev_crash_after: Mutex<Option<Duration>>,
    /// Dev servers outlive `kill`, like an orphaned child holding its port.
    pub ignore_kills: AtomicBool,
    pub failing_removes: Mutex<HashSet<String>>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            installs: Mutex::new(VecDeque::new()),
            dev_ready_after: Mutex::new(Some(Duration::from_millis(200))),
            dev_ready_plan: Mutex::new(VecDeque::new()),
            dev_crash_after: Mutex::new(None),
            ignore_kills: AtomicBool::new(false),
            failing_removes: Mutex::new(HashSet::new()),
        }
    }
}

/// Preview URL a fake dev server with `pid` announces.
pub fn dev_url(container: &str, pid: u32) -> String {
    format!("https://{container}-{pid}.preview.test")
}

pub struct FakeContainer {
    id: String,
    behavior: Arc<Behavior>,
    ops: Mutex<Vec<Op>>,
    files: Mutex<BTreeMap<String, String>>,
    ready_tx: broadcast::Sender<ServerReady>,
    next_pid: AtomicU32,
    dev_pids: Mutex<Vec<u32>>,
    kills: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

impl FakeContainer {
    fn new(id: String, behavior: Arc<Behavior>) -> Self {
        let (ready_tx, _) = broadcast::channel(8);
        Self {
            id,
            behavior,
            ops: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            ready_tx,
            next_pid: AtomicU32::new(100),
            dev_pids: Mutex::new(Vec::new()),
            kills: Mutex::new(HashMap::new()),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub fn fs_ops(&self) -> Vec<Op> {
        self.ops().into_iter().filter(Op::touches_fs).collect()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().get(path).cloned()
    }

    pub fn install_spawns(&self) -> Vec<Vec<String>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Spawn(args) if args.get(1).map(String::as_str) == Some("install") => Some(args),
                _ => None,
            })
            .collect()
    }

    pub fn dev_spawns(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Spawn(args) if args.get(1).map(String::as_str) != Some("install")))
            .count()
    }

    /// URLs the dev servers spawned so far announce (or would), in spawn order.
    pub fn dev_urls(&self) -> Vec<String> {
        self.dev_pids
            .lock()
            .iter()
            .map(|pid| dev_url(&self.id, *pid))
            .collect()
    }

    pub fn kills(&self) -> Vec<u32> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Kill(pid) => Some(pid),
                _ => None,
            })
            .collect()
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }

    fn install_process(&self, pid: u32) -> SpawnedProcess {
        let outcome = self
            .behavior
            .installs
            .lock()
            .pop_front()
            .unwrap_or_else(InstallOutcome::ok);
        let (out_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        for line in outcome.lines {
            out_tx.send(line).unwrap();
        }
        exit_tx.send(outcome.code).unwrap();
        SpawnedProcess { pid, output, exit }
    }

    fn dev_process(&self, pid: u32) -> SpawnedProcess {
        let (out_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.kills.lock().insert(pid, kill_tx);
        self.dev_pids.lock().push(pid);

        let ready_after = self
            .behavior
            .dev_ready_plan
            .lock()
            .pop_front()
            .unwrap_or(*self.behavior.dev_ready_after.lock());
        let crash_after = *self.behavior.dev_crash_after.lock();
        let stubborn = self.behavior.ignore_kills.load(Ordering::SeqCst);
        let ready_tx = self.ready_tx.clone();
        let url = dev_url(&self.id, pid);

        tokio::spawn(async move {
            let _ = out_tx.send("> vite".to_string());
            let lifecycle = async {
                let Some(delay) = ready_after else {
                    return std::future::pending::<i32>().await;
                };
                tokio::time::sleep(delay).await;
                let _ = out_tx.send(format!("  Local: {url}"));
                let _ = ready_tx.send(ServerReady { pid, port: 5173, url });
                match crash_after {
                    Some(after) => {
                        tokio::time::sleep(after).await;
                        1
                    }
                    None => std::future::pending::<i32>().await,
                }
            };
            let code = tokio::select! {
                _ = kill_rx, if !stubborn => 143,
                code = lifecycle => code,
            };
            drop(out_tx);
            let _ = exit_tx.send(code);
        });

        SpawnedProcess { pid, output, exit }
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self, tree: &FileTree) -> anyhow::Result<()> {
        let files = tree.files();
        self.record(Op::Mount(files.iter().map(|(p, _)| p.clone()).collect()));
        let mut fs = self.files.lock();
        for (path, contents) in files {
            fs.insert(path, contents.to_string());
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.record(Op::Write(path.to_string()));
        self.files.lock().insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        self.record(Op::Mkdir(path.to_string()));
        Ok(())
    }

    async fn remove(&self, path: &str, _recursive: bool) -> anyhow::Result<()> {
        self.record(Op::Remove(path.to_string()));
        if self.behavior.failing_removes.lock().contains(path) {
            anyhow::bail!("EBUSY: resource busy or locked, rmdir '{path}'");
        }
        let prefix = format!("{path}/");
        self.files
            .lock()
            .retain(|p, _| p != path && !p.starts_with(&prefix));
        Ok(())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<SpawnedProcess> {
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().cloned());
        self.record(Op::Spawn(argv));

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if args.first().map(String::as_str) == Some("install") {
            Ok(self.install_process(pid))
        } else {
            Ok(self.dev_process(pid))
        }
    }

    async fn kill(&self, pid: u32) -> anyhow::Result<()> {
        self.record(Op::Kill(pid));
        if let Some(kill) = self.kills.lock().remove(&pid) {
            let _ = kill.send(());
        }
        Ok(())
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        let kills: Vec<_> = self.kills.lock().drain().collect();
        for (_, kill) in kills {
            let _ = kill.send(());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pub behavior: Arc<Behavior>,
    boots: AtomicUsize,
    failing_boots: AtomicUsize,
    boot_delay: Mutex<Duration>,
    containers: Mutex<Vec<Arc<FakeContainer>>>,
}

impl FakeRuntime {
    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn fail_next_boots(&self, n: usize) {
        self.failing_boots.store(n, Ordering::SeqCst);
    }

    pub fn set_boot_delay(&self, delay: Duration) {
        *self.boot_delay.lock() = delay;
    }

    /// Most recently booted container.
    pub fn container(&self) -> Arc<FakeContainer> {
        self.containers
            .lock()
            .last()
            .cloned()
            .expect("no container booted yet")
    }

    pub fn containers(&self) -> Vec<Arc<FakeContainer>> {
        self.containers.lock().clone()
    }

    pub fn script_installs(&self, outcomes: impl IntoIterator<Item = InstallOutcome>) {
        self.behavior.installs.lock().extend(outcomes);
    }

    pub fn set_dev_ready_after(&self, delay: Option<Duration>) {
        *self.behavior.dev_ready_after.lock() = delay;
    }

    /// Ready delays for the next dev-server spawns, in order.
    pub fn script_dev_ready(&self, delays: impl IntoIterator<Item = Option<Duration>>) {
        self.behavior.dev_ready_plan.lock().extend(delays);
    }

    pub fn ignore_kills(&self) {
        self.behavior.ignore_kills.store(true, Ordering::SeqCst);
    }

    pub fn fail_removes_of(&self, path: &str) {
        self.behavior.failing_removes.lock().insert(path.to_string());
    }

    pub fn set_dev_crash_after(&self, after: Option<Duration>) {
        *self.behavior.dev_crash_after.lock() = after;
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn boot(&self) -> anyhow::Result<Arc<dyn Container>> {
        let n = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.boot_delay.lock();
        tokio::time::sleep(delay).await;

        let should_fail = self
            .failing_boots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("simulated boot failure #{n}");
        }

        let container = Arc::new(FakeContainer::new(
            format!("fake-{n}"),
            Arc::clone(&self.behavior),
        ));
        self.containers.lock().push(Arc::clone(&container));
        Ok(container)
    }
}

/// In-memory bundle backend.
#[derive(Default)]
pub struct FakeBundles {
    bundles: Mutex<HashMap<ProjectId, FileBundle>>,
    fetches: AtomicUsize,
}

impl FakeBundles {
    pub fn set(&self, project: u64, files: &[(&str, &str)]) {
        let bundle = files
            .iter()
            .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
            .collect();
        self.bundles.lock().insert(ProjectId(project), bundle);
    }

    pub fn get(&self, project: u64) -> Option<FileBundle> {
        self.bundles.lock().get(&ProjectId(project)).cloned()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleSource for FakeBundles {
    async fn fetch_bundle(&self, project: ProjectId) -> anyhow::Result<FileBundle> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.bundles
            .lock()
            .get(&project)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Backend returned 404 Not Found: project {project}"))
    }
}

pub struct Harness {
    pub manager: SessionManager,
    pub runtime: Arc<FakeRuntime>,
    pub bundles: Arc<FakeBundles>,
}

pub fn harness() -> Harness {
    harness_with(PreviewConfig::default())
}

pub fn harness_with(config: PreviewConfig) -> Harness {
    init_tracing();
    let runtime = Arc::new(FakeRuntime::default());
    let bundles = Arc::new(FakeBundles::default());
    let manager = SessionManager::new(config, runtime.clone(), bundles.clone());
    Harness {
        manager,
        runtime,
        bundles,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A small valid project on top of the base scaffold's dependencies.
pub fn manifest(extra_deps: &[(&str, &str)]) -> String {
    let mut deps = serde_json::Map::new();
    deps.insert("react".into(), "^18.3.1".into());
    deps.insert("react-dom".into(), "^18.3.1".into());
    for (name, range) in extra_deps {
        deps.insert((*name).into(), (*range).into());
    }
    serde_json::to_string_pretty(&serde_json::json!({
        "name": "demo",
        "private": true,
        "scripts": { "dev": "vite" },
        "dependencies": deps,
        "devDependencies": { "vite": "^5.4.11", "@vitejs/plugin-react": "^4.3.4" }
    }))
    .unwrap()
}

pub const INDEX_HTML: &str =
    "<!DOCTYPE html>\n<html>\n  <body>\n    <div id=\"root\"></div>\n  </body>\n</html>\n";
