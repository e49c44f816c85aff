use super::install::{InstallRequest, Installer};
use super::{LogSink, SessionManager, Transcript};
use crate::error::{PreviewError, Result};
use crate::status::PreWarmPhase;
use crate::sync::{self, SyncPlan};
use crate::template;

const INSTALL_PROGRESS_START: u8 = 40;
const INSTALL_PROGRESS_END: u8 = 85;

impl SessionManager {
    /// Boot the sandbox and install the base dependency set.
    ///
    /// Returns immediately when the current instance is already warm, and
    /// joins the running attempt when one is in flight (a joiner's `on_log`
    /// is not attached to the running attempt). A failed attempt leaves the
    /// status at `error` and can be retried by calling this again.
    pub async fn prewarm(&self, on_log: Option<LogSink>) -> Result<()> {
        let this = self.clone();
        self.inner
            .prewarm
            .run(
                || self.is_ready().then_some(()),
                move || async move { this.run_prewarm(on_log).await },
            )
            .await
    }

    async fn run_prewarm(&self, on_log: Option<LogSink>) -> Result<()> {
        let transcript = Transcript::new(on_log);
        let outcome = self.prewarm_steps(&transcript).await;
        if let Err(e) = &outcome {
            tracing::warn!("Pre-warm failed: {e}");
            transcript.line(format!("Pre-warm failed: {e}"));
            self.inner
                .status
                .set(PreWarmPhase::Error, e.to_string(), 0);
        }
        outcome
    }

    async fn prewarm_steps(&self, transcript: &Transcript) -> Result<()> {
        let status = &self.inner.status;
        let config = &self.inner.config;

        status.set(PreWarmPhase::Booting, "Starting sandbox...", 10);
        transcript.line("Starting sandbox...");
        let container = self.acquire_sandbox().await?;

        let mut workspace = self.inner.workspace.lock().await;
        workspace.bind(container.id());

        status.set(PreWarmPhase::Booting, "Mounting base template...", 20);
        if workspace.files.is_empty() {
            let plan = SyncPlan::writes_only(template::base_files());
            sync::apply(container.as_ref(), &mut workspace.files, plan).await?;
        }

        status.set(PreWarmPhase::Booting, "Cleaning package cache...", 30);
        if let Err(e) = container.remove(&config.package_cache_dir, true).await {
            tracing::warn!("Failed to clean package cache: {e}");
        }

        status.set(PreWarmPhase::Installing, "Installing dependencies...", 35);
        transcript.line("Installing base dependencies...");
        let mut progress = INSTALL_PROGRESS_START;
        status.set(PreWarmPhase::Installing, "Installing dependencies...", progress);
        Installer::new(&config.install, &config.package_cache_dir)
            .run(container.as_ref(), &InstallRequest::Full, |line| {
                transcript.line(line);
                progress = (progress + 1).min(INSTALL_PROGRESS_END);
                status.set(PreWarmPhase::Installing, "Installing dependencies...", progress);
            })
            .await?;

        let names = template::base_dependency_names()
            .map_err(|e| PreviewError::Internal(PreviewError::describe(&e)))?;
        workspace.deps.record_installed(names);
        *self.inner.warm_instance.lock() = Some(container.id().to_string());
        drop(workspace);

        status.set(PreWarmPhase::Ready, "Sandbox ready", 100);
        transcript.line("Sandbox ready");
        tracing::info!("Pre-warm complete for instance {}", container.id());
        Ok(())
    }
}
