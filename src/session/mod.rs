//! The preview session manager.
//!
//! [`SessionManager`] owns one sandbox instance and everything derived from
//! it: the file cache, the installed-dependency set, the dev-server handle and
//! the pre-warm status. The embedding application constructs one manager,
//! clones it freely (clones share state) and calls [`SessionManager::dispose`]
//! on teardown.
//!
//! Entry points:
//!
//! - [`SessionManager::prewarm`] boots the sandbox and installs the base
//!   scaffold's dependencies ahead of the first load
//! - [`SessionManager::load_project`] is the cold path (fetch, patch, sync,
//!   install, start or reuse the dev server)
//! - [`SessionManager::load_project_fast`] re-syncs a project whose server is
//!   already live and returns the existing URL
//! - [`SessionManager::reload_project_files`] syncs without touching the server
//! - [`SessionManager::update_project_files`] writes an explicit file list

mod install;
mod load;
mod prewarm;
mod server;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::bundle::{BundleSource, HttpBundleSource};
use crate::config::PreviewConfig;
use crate::deps::InstalledDependencies;
use crate::error::{PreviewError, Result};
use crate::runtime::local::LocalRuntime;
use crate::runtime::{Container, Runtime};
use crate::single_flight::SingleFlight;
use crate::status::{PreWarmPhase, PreWarmStatus, StatusBroadcaster, Subscription};
use crate::sync::FileCache;

use server::DevServer;

/// Receives human-readable progress lines.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives failure messages, including dev-server crashes after a load.
pub type ErrorSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional observers for a load call.
#[derive(Clone, Default)]
pub struct LoadHooks {
    pub on_log: Option<LogSink>,
    pub on_error: Option<ErrorSink>,
}

impl LoadHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_log(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for LoadHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadHooks")
            .field("on_log", &self.on_log.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Result of a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Externally reachable dev-server URL.
    pub url: String,
    /// Every log line emitted during the call.
    pub logs: Vec<String>,
}

/// Where the session is in its load lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    Loading,
    Ready,
    Reloading,
    Error(String),
}

/// Caches that are only valid for one container instance. Both are reset
/// together whenever the bound instance changes.
#[derive(Debug, Default)]
pub(crate) struct Workspace {
    owner: Option<String>,
    pub(crate) files: FileCache,
    pub(crate) deps: InstalledDependencies,
}

impl Workspace {
    /// Bind to `instance_id`, clearing both caches if it differs from the
    /// current owner. Returns whether a reset happened.
    pub(crate) fn bind(&mut self, instance_id: &str) -> bool {
        if self.owner.as_deref() == Some(instance_id) {
            return false;
        }
        if let Some(previous) = &self.owner {
            tracing::info!("Sandbox instance changed ({previous} -> {instance_id}); clearing caches");
        }
        self.reset(Some(instance_id.to_string()));
        true
    }

    pub(crate) fn reset(&mut self, owner: Option<String>) {
        self.owner = owner;
        self.files.clear();
        self.deps.clear();
    }
}

/// Collects the log lines of one call and forwards them to its sink. After
/// [`Transcript::finish`] lines only go to the sink, so background tasks that
/// outlive the call can keep using a clone.
#[derive(Clone)]
pub(crate) struct Transcript {
    sink: Option<LogSink>,
    lines: Arc<Mutex<Option<Vec<String>>>>,
}

impl Transcript {
    pub(crate) fn new(sink: Option<LogSink>) -> Self {
        Self {
            sink,
            lines: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    pub(crate) fn line(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        if let Some(buf) = self.lines.lock().as_mut() {
            buf.push(line.to_string());
        }
        if let Some(sink) = &self.sink {
            sink(line);
        }
    }

    /// A sink that feeds this transcript.
    pub(crate) fn as_sink(&self) -> LogSink {
        let this = self.clone();
        Arc::new(move |line: &str| this.line(line))
    }

    pub(crate) fn finish(&self) -> Vec<String> {
        self.lines.lock().take().unwrap_or_default()
    }
}

pub(crate) struct Inner {
    pub(crate) config: PreviewConfig,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) bundles: Arc<dyn BundleSource>,
    pub(crate) instance: RwLock<Option<Arc<dyn Container>>>,
    pub(crate) boot: SingleFlight<Arc<dyn Container>>,
    pub(crate) prewarm: SingleFlight<()>,
    pub(crate) status: StatusBroadcaster,
    /// Id of the instance the last successful pre-warm ran against.
    pub(crate) warm_instance: Mutex<Option<String>>,
    /// Caches plus the lock every filesystem-mutating entry point holds.
    pub(crate) workspace: tokio::sync::Mutex<Workspace>,
    pub(crate) server: Mutex<Option<DevServer>>,
    pub(crate) server_generation: AtomicU64,
    pub(crate) phase: Mutex<SessionPhase>,
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: PreviewConfig,
        runtime: Arc<dyn Runtime>,
        bundles: Arc<dyn BundleSource>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                bundles,
                instance: RwLock::new(None),
                boot: SingleFlight::new("boot"),
                prewarm: SingleFlight::new("prewarm"),
                status: StatusBroadcaster::new(),
                warm_instance: Mutex::new(None),
                workspace: tokio::sync::Mutex::new(Workspace::default()),
                server: Mutex::new(None),
                server_generation: AtomicU64::new(0),
                phase: Mutex::new(SessionPhase::NoSession),
            }),
        }
    }

    /// Manager backed by [`LocalRuntime`] and the HTTP bundle endpoint.
    pub fn local(config: PreviewConfig) -> anyhow::Result<Self> {
        let runtime = Arc::new(LocalRuntime::new(config.local.resolved_root()));
        let bundles = Arc::new(HttpBundleSource::new(&config.api_base_url)?);
        Ok(Self::new(config, runtime, bundles))
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.inner.config
    }

    /// Return the sandbox instance, booting it if needed. Concurrent callers
    /// share one boot; a failed boot can be retried.
    pub async fn acquire_sandbox(&self) -> Result<Arc<dyn Container>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .boot
            .run(
                || self.inner.instance.read().clone(),
                move || async move {
                    tracing::info!("Booting sandbox instance");
                    let container = inner
                        .runtime
                        .boot()
                        .await
                        .map_err(|e| PreviewError::Boot(PreviewError::describe(&e)))?;
                    *inner.instance.write() = Some(Arc::clone(&container));
                    Ok(container)
                },
            )
            .await
    }

    /// The instance, if one has been booted.
    pub fn sandbox(&self) -> Option<Arc<dyn Container>> {
        self.inner.instance.read().clone()
    }

    pub(crate) fn require_sandbox(&self) -> Result<Arc<dyn Container>> {
        self.sandbox().ok_or(PreviewError::NoActiveSandbox)
    }

    /// Watch pre-warm status. Dropping the handle unsubscribes.
    pub fn subscribe_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PreWarmStatus) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(callback)
    }

    pub fn status(&self) -> PreWarmStatus {
        self.inner.status.current()
    }

    /// Whether the current instance has finished pre-warming.
    pub fn is_ready(&self) -> bool {
        let Some(instance) = self.sandbox() else {
            return false;
        };
        self.inner.status.current().phase == PreWarmPhase::Ready
            && self.inner.warm_instance.lock().as_deref() == Some(instance.id())
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.inner.phase.lock().clone()
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        *self.inner.phase.lock() = phase;
    }

    /// Tear down the instance and forget everything derived from it. The
    /// manager stays usable; the next call boots a fresh instance.
    pub async fn dispose(&self) {
        let mut workspace = self.inner.workspace.lock().await;
        let container = self.inner.instance.write().take();
        let server = self.inner.server.lock().take();
        workspace.reset(None);
        drop(workspace);
        *self.inner.warm_instance.lock() = None;

        if let Some(container) = container {
            if let Some(server) = server.filter(|s| s.alive) {
                if let Err(e) = container.kill(server.pid).await {
                    tracing::warn!("Failed to stop dev server (pid {}): {e}", server.pid);
                }
            }
            if let Err(e) = container.teardown().await {
                tracing::warn!("Sandbox teardown failed: {e}");
            }
            tracing::info!("Disposed sandbox instance {}", container.id());
        }

        self.set_phase(SessionPhase::NoSession);
        self.inner.status.publish(PreWarmStatus::idle());
    }
}
