use std::collections::BTreeMap;
use std::sync::Arc;

use super::install::{InstallRequest, Installer};
use super::{LoadHooks, LoadOutcome, LogSink, SessionManager, SessionPhase, Transcript, Workspace};
use crate::bundle::{normalize_path, FileBundle, FileUpdate, ProjectId};
use crate::compat::patch_bundle;
use crate::deps::{InstallPlan, PackageManifest};
use crate::error::{PreviewError, Result};
use crate::inject::{inject_helpers, inject_into_bundle, ENTRY_HTML};
use crate::runtime::Container;
use crate::sync::{self, SyncPlan, SyncReport};

const MANIFEST_PATH: &str = "package.json";

/// Dependency work decided before files are synced and run after.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingInstall {
    request: InstallRequest,
    /// Names to record as installed once the request succeeds.
    names: Vec<String>,
}

impl SessionManager {
    /// Cold path: make sure the sandbox is warm, fetch and prepare the
    /// project's files, sync them, install new dependencies and start (or
    /// reuse) the dev server for `project`.
    pub async fn load_project(&self, project: ProjectId, hooks: LoadHooks) -> Result<LoadOutcome> {
        self.set_phase(SessionPhase::Loading);
        let transcript = Transcript::new(hooks.on_log.clone());
        let result = self.cold_load(project, &transcript, &hooks).await;
        self.finish_load(result, transcript, &hooks)
    }

    /// Same-project fast path. When `project` already has a live dev server
    /// with a known URL, only the files are synced (dependencies are checked
    /// only if `package.json` changed) and the existing URL is returned.
    /// Anything else falls back to [`SessionManager::load_project`].
    pub async fn load_project_fast(
        &self,
        project: ProjectId,
        hooks: LoadHooks,
    ) -> Result<LoadOutcome> {
        if self.live_url_for(project).is_none() {
            return self.load_project(project, hooks).await;
        }

        self.set_phase(SessionPhase::Reloading);
        let transcript = Transcript::new(hooks.on_log.clone());
        let result = match self.fast_load(project, &transcript).await {
            Ok(Some(url)) => Ok(url),
            Ok(None) => {
                transcript.line("Dev server is gone, doing a full load");
                self.set_phase(SessionPhase::Loading);
                self.cold_load(project, &transcript, &hooks).await
            }
            Err(e) => Err(e),
        };
        self.finish_load(result, transcript, &hooks)
    }

    /// Sync the project's current files into the sandbox without restarting
    /// the dev server.
    pub async fn reload_project_files(
        &self,
        project: ProjectId,
        on_log: Option<LogSink>,
    ) -> Result<()> {
        let transcript = Transcript::new(on_log);
        let container = self.require_sandbox()?;
        self.set_phase(SessionPhase::Reloading);

        let result = async {
            let files = self.fetch_prepared(project, &transcript).await?;
            let mut workspace = self.inner.workspace.lock().await;
            workspace.bind(container.id());
            self.sync_and_install(&container, &mut workspace, &files, &transcript, false)
                .await
                .map(|_| ())
        }
        .await;

        self.finish_quiet(result, &transcript)
    }

    /// Write an explicit file list in path order, bypassing fetch and diff.
    /// A later entry for the same path wins. `index.html` gets the helper
    /// scripts; a pushed `package.json` triggers a dependency install.
    pub async fn update_project_files(
        &self,
        files: Vec<FileUpdate>,
        on_log: Option<LogSink>,
    ) -> Result<()> {
        let transcript = Transcript::new(on_log);
        let container = self.require_sandbox()?;
        if files.is_empty() {
            return Ok(());
        }
        let settled = self.session_phase() == SessionPhase::Ready;
        if settled {
            self.set_phase(SessionPhase::Reloading);
        }

        let result = self.push_files(&container, files, &transcript).await;
        match &result {
            Ok(()) if settled => self.set_phase(SessionPhase::Ready),
            Ok(()) => {}
            Err(e) => self.set_phase(SessionPhase::Error(e.to_string())),
        }
        result
    }

    async fn cold_load(
        &self,
        project: ProjectId,
        transcript: &Transcript,
        hooks: &LoadHooks,
    ) -> Result<String> {
        transcript.line(format!("Loading project {project}..."));
        self.prewarm(Some(transcript.as_sink())).await?;

        let files = self.fetch_prepared(project, transcript).await?;
        let container = self.acquire_sandbox().await?;

        let mut workspace = self.inner.workspace.lock().await;
        if workspace.bind(container.id()) {
            transcript.line("Sandbox instance changed, starting from a clean cache");
        }
        self.sync_and_install(&container, &mut workspace, &files, transcript, false)
            .await?;

        let url = self
            .ensure_dev_server(&container, project, transcript, hooks.on_error.clone())
            .await?;
        drop(workspace);
        Ok(url)
    }

    /// `Ok(None)` when the server died or the instance changed, and a cold
    /// load is needed instead.
    async fn fast_load(
        &self,
        project: ProjectId,
        transcript: &Transcript,
    ) -> Result<Option<String>> {
        transcript.line(format!("Refreshing project {project}..."));
        let container = self.require_sandbox()?;
        let files = self.fetch_prepared(project, transcript).await?;

        let mut workspace = self.inner.workspace.lock().await;
        if workspace.bind(container.id()) {
            return Ok(None);
        }
        self.sync_and_install(&container, &mut workspace, &files, transcript, true)
            .await?;
        drop(workspace);

        Ok(self.live_url_for(project))
    }

    /// Fetch the bundle and produce the copy that goes into the sandbox.
    async fn fetch_prepared(&self, project: ProjectId, transcript: &Transcript) -> Result<FileBundle> {
        let bundle = self
            .inner
            .bundles
            .fetch_bundle(project)
            .await
            .map_err(|e| PreviewError::BundleFetch {
                project,
                detail: PreviewError::describe(&e),
            })?;
        transcript.line(format!("Fetched {} files", bundle.len()));
        Ok(prepare_bundle(&bundle, transcript))
    }

    /// Compute the dependency delta, sync files, then install. The manifest
    /// must be in place before the package manager runs. With
    /// `manifest_gate`, dependencies are only diffed when `package.json`
    /// differs from the cached copy.
    async fn sync_and_install(
        &self,
        container: &Arc<dyn Container>,
        workspace: &mut Workspace,
        files: &FileBundle,
        transcript: &Transcript,
        manifest_gate: bool,
    ) -> Result<SyncReport> {
        let manifest_changed =
            files.get(MANIFEST_PATH).map(String::as_str) != workspace.files.get(MANIFEST_PATH);
        let pending = if manifest_gate && !manifest_changed {
            None
        } else {
            self.plan_install(workspace, files.get(MANIFEST_PATH).map(String::as_str), transcript)
        };

        let plan = SyncPlan::compute(&workspace.files, files, &self.inner.config.dependency_dir);
        let report = sync::apply(container.as_ref(), &mut workspace.files, plan).await?;
        log_report(&report, transcript);

        if let Some(pending) = pending {
            self.install(container, workspace, pending, transcript).await?;
        }
        Ok(report)
    }

    fn plan_install(
        &self,
        workspace: &Workspace,
        manifest_text: Option<&str>,
        transcript: &Transcript,
    ) -> Option<PendingInstall> {
        let text = manifest_text?;
        let manifest = match PackageManifest::parse(text) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!("Skipping dependency check: {e}");
                transcript.line(format!("Skipping dependency check: {e}"));
                return None;
            }
        };

        let missing = workspace.deps.diff(&manifest);
        let threshold = self.inner.config.install.incremental_threshold;
        match InstallPlan::decide(&missing, &manifest, threshold) {
            InstallPlan::UpToDate => None,
            InstallPlan::Incremental(specs) => {
                transcript.line(format!("Installing {} new packages: {}", specs.len(), specs.join(" ")));
                Some(PendingInstall {
                    request: InstallRequest::Packages(specs),
                    names: missing,
                })
            }
            InstallPlan::Full => {
                transcript.line(format!(
                    "{} new packages (more than {threshold}), running a full install",
                    missing.len()
                ));
                Some(PendingInstall {
                    request: InstallRequest::Full,
                    names: manifest.names().into_iter().collect(),
                })
            }
        }
    }

    async fn install(
        &self,
        container: &Arc<dyn Container>,
        workspace: &mut Workspace,
        pending: PendingInstall,
        transcript: &Transcript,
    ) -> Result<()> {
        let config = &self.inner.config;
        Installer::new(&config.install, &config.package_cache_dir)
            .run(container.as_ref(), &pending.request, |line| transcript.line(line))
            .await?;
        workspace.deps.record_installed(pending.names);
        transcript.line("Dependencies installed");
        Ok(())
    }

    async fn push_files(
        &self,
        container: &Arc<dyn Container>,
        files: Vec<FileUpdate>,
        transcript: &Transcript,
    ) -> Result<()> {
        let ordered: BTreeMap<String, String> = files
            .into_iter()
            .map(|f| (normalize_path(&f.path), f.content))
            .filter(|(path, _)| !path.is_empty())
            .map(|(path, content)| {
                if path == ENTRY_HTML {
                    let injected = inject_helpers(&content).into_owned();
                    (path, injected)
                } else {
                    (path, content)
                }
            })
            .collect();

        let mut workspace = self.inner.workspace.lock().await;
        workspace.bind(container.id());

        let pending = match ordered.get(MANIFEST_PATH) {
            Some(text) if workspace.files.get(MANIFEST_PATH) != Some(text.as_str()) => {
                self.plan_install(&workspace, Some(text), transcript)
            }
            _ => None,
        };

        let mut dirs = sync::known_dirs(&workspace.files);
        for (path, content) in ordered {
            sync::write_one(container.as_ref(), &mut dirs, &path, &content).await?;
            transcript.line(format!("Updated {path}"));
            workspace.files.insert(path, content);
        }

        if let Some(pending) = pending {
            self.install(container, &mut workspace, pending, transcript).await?;
        }
        Ok(())
    }

    fn finish_load(
        &self,
        result: Result<String>,
        transcript: Transcript,
        hooks: &LoadHooks,
    ) -> Result<LoadOutcome> {
        match result {
            Ok(url) => {
                self.set_phase(SessionPhase::Ready);
                Ok(LoadOutcome {
                    url,
                    logs: transcript.finish(),
                })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Load failed: {message}");
                transcript.line(format!("Error: {message}"));
                transcript.finish();
                self.set_phase(SessionPhase::Error(message.clone()));
                if let Some(on_error) = &hooks.on_error {
                    on_error(&message);
                }
                Err(e)
            }
        }
    }

    fn finish_quiet(&self, result: Result<()>, transcript: &Transcript) -> Result<()> {
        match &result {
            Ok(()) => self.set_phase(SessionPhase::Ready),
            Err(e) => {
                transcript.line(format!("Error: {e}"));
                self.set_phase(SessionPhase::Error(e.to_string()));
            }
        }
        result
    }
}

/// Patch and inject. The fetched bundle itself is left as fetched.
fn prepare_bundle(bundle: &FileBundle, transcript: &Transcript) -> FileBundle {
    let outcome = patch_bundle(bundle);
    for fix in &outcome.fixes {
        transcript.line(format!("Compatibility fix: {fix}"));
    }
    let mut files = outcome.bundle.into_owned();
    inject_into_bundle(&mut files);
    files
}

fn log_report(report: &SyncReport, transcript: &Transcript) {
    if report.is_noop() {
        transcript.line("Files are up to date");
        return;
    }
    transcript.line(format!(
        "Synced files: {} written, {} deleted",
        report.written.len(),
        report.deleted.len()
    ));
    for path in &report.failed_deletes {
        transcript.line(format!("Could not delete {path}"));
    }
}
