//! The run itself: stage, serve, test, tear down.

use std::any::Any;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{RunConfig, RunLayout, RunSettings, ServerChoice};
use crate::error::{Error, Result, EXIT_TEST_FAILURES};
use crate::harness::{HarnessOptions, TestHarness};
use crate::manifest::{BuildManifest, BuildTarget};
use crate::resolver::{resolve, ExecutionPlan};
use crate::server::{Httpd, ServiceProcess, Svnserve};
use crate::stager::{create_target_dir, ArtifactStager, CleanupReport};

/// httpd modules the build produces, relative to the object dir.
pub const HTTPD_MODULES: [&str; 3] = [
    "subversion/mod_dav_svn/mod_dav_svn.so",
    "subversion/mod_authz_svn/mod_authz_svn.so",
    "tools/server-side/mod_dontdothat/mod_dontdothat.so",
];

/// What a finished run reports back.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    /// True if the harness reported failures.
    pub failed: bool,
    pub plan: ExecutionPlan,
    /// Test references that were skipped.
    pub warnings: Vec<String>,
    /// Name of the server that bracketed the harness, if any.
    pub server: Option<String>,
    pub cleanup: CleanupReport,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.failed {
            EXIT_TEST_FAILURES
        } else {
            0
        }
    }
}

enum HarnessRun {
    Finished(bool),
    Panicked(Box<dyn Any + Send + 'static>),
}

struct Executed {
    run: HarnessRun,
    plan: ExecutionPlan,
    warnings: Vec<String>,
    server: Option<String>,
}

/// Resolves with the signal name once SIGINT or, on unix, SIGTERM arrives.
///
/// A listener that cannot be installed never resolves.
pub async fn shutdown_signal() -> String {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "SIGINT".to_string(),
        () = terminate => "SIGTERM".to_string(),
    }
}

/// Runs `body` until it finishes or `interrupt` resolves, whichever is first.
pub async fn interruptible<F, I, T>(body: F, interrupt: I) -> Result<T>
where
    F: Future<Output = Result<T>>,
    I: Future<Output = String>,
{
    tokio::select! {
        result = body => result,
        signal = interrupt => {
            tracing::warn!(signal = %signal, "run interrupted");
            Err(Error::Interrupted(signal))
        }
    }
}

/// Starts `service`, runs `body`, then stops the service.
///
/// The service is stopped whatever `body` returns. A failed start still
/// gets a `stop` call and the body never runs. SIGINT and SIGTERM end the
/// body early with [`Error::Interrupted`].
pub async fn with_service<F, T>(
    service: &mut dyn ServiceProcess,
    args: Option<&[String]>,
    body: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_service_until(service, args, body, shutdown_signal()).await
}

/// [`with_service`] with the interrupt source supplied by the caller.
pub async fn with_service_until<F, I, T>(
    service: &mut dyn ServiceProcess,
    args: Option<&[String]>,
    body: F,
    interrupt: I,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
    I: Future<Output = String>,
{
    if let Err(e) = service.start(args).await {
        tracing::error!(server = %service.name(), error = %e, "server failed to start");
        service.stop().await;
        return Err(e);
    }

    let result = interruptible(body, interrupt).await;
    service.stop().await;
    result
}

/// Orchestrates one test run.
pub struct ExecutionDriver {
    run_id: String,
    config: RunConfig,
    settings: RunSettings,
    manifest: BuildManifest,
    harness: Arc<dyn TestHarness>,
    stager: ArtifactStager,
}

impl ExecutionDriver {
    pub fn new(
        config: RunConfig,
        settings: RunSettings,
        manifest: BuildManifest,
        harness: Arc<dyn TestHarness>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            config,
            settings,
            manifest,
            harness,
            stager: ArtifactStager::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn stager(&self) -> &ArtifactStager {
        &self.stager
    }

    /// `Testing <Variant> configuration on <location>`, or `Listing ...`.
    pub fn banner(&self) -> String {
        format!(
            "{} {} configuration on {}",
            if self.config.list { "Listing" } else { "Testing" },
            self.settings.layout.variant,
            self.settings.repo_location()
        )
    }

    /// Copies libraries, modules and executables into the build dir.
    ///
    /// Fails on the first required file that does not exist.
    pub fn stage_artifacts(&mut self) -> Result<()> {
        let layout = &self.settings.layout;
        create_target_dir(&layout.build_dir)?;

        stage_libraries(&mut self.stager, &self.manifest, layout)?;

        if matches!(self.settings.server, ServerChoice::Httpd(_)) && self.manifest.has_httpd_modules
        {
            for module in HTTPD_MODULES {
                self.stager
                    .stage_into(relative_to(&layout.obj_dir, module), &layout.build_dir, false)?;
            }
        }

        if layout.relocate_executables {
            stage_executables(&mut self.stager, &self.manifest, layout)?;
        }

        create_target_dir(layout.cmdline_dir())?;
        Ok(())
    }

    /// Builds the server the settings ask for, without starting it.
    pub async fn build_service(&self) -> Result<Option<Box<dyn ServiceProcess>>> {
        let layout = &self.settings.layout;
        match &self.settings.server {
            ServerChoice::None => Ok(None),
            ServerChoice::Svnserve { .. } => Ok(Some(Box::new(Svnserve::new(layout)))),
            ServerChoice::Httpd(options) => {
                let version = self.manifest.server_version()?;
                Ok(Some(Box::new(Httpd::configure(options, layout, version).await?)))
            }
        }
    }

    fn service_args(&self) -> Option<Vec<String>> {
        match &self.settings.server {
            ServerChoice::Svnserve { args } => args.clone(),
            _ => None,
        }
    }

    /// Runs with the server the settings ask for.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let executed = self.execute(None, shutdown_signal()).await;
        self.finish(executed)
    }

    /// Runs with `service` in place of the configured server.
    pub async fn run_with_service(
        &mut self,
        service: Box<dyn ServiceProcess>,
    ) -> Result<RunOutcome> {
        let executed = self.execute(Some(service), shutdown_signal()).await;
        self.finish(executed)
    }

    async fn execute<I>(
        &mut self,
        service: Option<Box<dyn ServiceProcess>>,
        interrupt: I,
    ) -> Result<Executed>
    where
        I: Future<Output = String>,
    {
        tracing::info!(
            run_id = %self.run_id,
            variant = %self.settings.layout.variant,
            fs_type = %self.settings.fs_type,
            base_url = ?self.settings.base_url,
            "starting run"
        );

        self.stage_artifacts()?;

        let service = if self.config.list {
            None
        } else {
            match service {
                Some(service) => Some(service),
                None => self.build_service().await?,
            }
        };

        match service {
            Some(mut service) => {
                let server = service.name().to_string();
                let args = self.service_args();
                let (run, plan, warnings) = with_service_until(
                    service.as_mut(),
                    args.as_deref(),
                    self.resolve_and_run(),
                    interrupt,
                )
                .await?;
                Ok(Executed {
                    run,
                    plan,
                    warnings,
                    server: Some(server),
                })
            }
            None => {
                let (run, plan, warnings) =
                    interruptible(self.resolve_and_run(), interrupt).await?;
                Ok(Executed {
                    run,
                    plan,
                    warnings,
                    server: None,
                })
            }
        }
    }

    async fn resolve_and_run(&self) -> Result<(HarnessRun, ExecutionPlan, Vec<String>)> {
        let catalog = self.manifest.catalog(&self.settings.fs_type);
        let resolution = resolve(&self.config.tests, &catalog);

        let options = HarnessOptions::new(&self.run_id, &self.config, &self.settings);
        let run = spawn_harness(
            Arc::clone(&self.harness),
            resolution.plan.clone(),
            options,
        )
        .await?;

        Ok((run, resolution.plan, resolution.warnings))
    }

    fn finish(&mut self, executed: Result<Executed>) -> Result<RunOutcome> {
        let cleanup = self.stager.cleanup_all();
        if !cleanup.failures.is_empty() {
            tracing::warn!(
                run_id = %self.run_id,
                failures = cleanup.failures.len(),
                "some staged files could not be removed"
            );
        }

        let executed = executed?;
        let failed = match executed.run {
            HarnessRun::Finished(failed) => failed,
            HarnessRun::Panicked(payload) => std::panic::resume_unwind(payload),
        };

        tracing::info!(
            run_id = %self.run_id,
            failed = failed,
            tests = executed.plan.len(),
            removed = cleanup.removed.len(),
            "run finished"
        );

        Ok(RunOutcome {
            run_id: self.run_id.clone(),
            failed,
            plan: executed.plan,
            warnings: executed.warnings,
            server: executed.server,
            cleanup,
        })
    }
}

/// Aborts the task when dropped, so an interrupted run does not leave the
/// harness behind.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs the harness on its own task so a panic comes back as a value.
async fn spawn_harness(
    harness: Arc<dyn TestHarness>,
    plan: ExecutionPlan,
    options: HarnessOptions,
) -> Result<HarnessRun> {
    tracing::debug!(harness = %harness.name(), tests = plan.len(), "starting harness");

    let task = tokio::spawn(async move { harness.run(&plan, &options).await });
    let _guard = AbortOnDrop(task.abort_handle());
    match task.await {
        Ok(result) => result.map(HarnessRun::Finished),
        Err(e) if e.is_panic() => {
            tracing::error!("test harness panicked");
            Ok(HarnessRun::Panicked(e.into_panic()))
        }
        Err(e) => Err(Error::Harness(format!("harness task failed: {}", e))),
    }
}

fn stage_libraries(
    stager: &mut ArtifactStager,
    manifest: &BuildManifest,
    layout: &RunLayout,
) -> Result<()> {
    for lib in &manifest.libraries {
        let (name, dir) = lib.dll_for(layout.variant);

        if let (Some(name), Some(dir)) = (name, dir) {
            let source = dir.join(name);
            if source.exists() {
                stager.stage_into(&source, &layout.build_dir, false)?;
            }
        }

        for extra in &lib.extra_bin {
            let source = match dir {
                Some(dir) => dir.join(extra),
                None => PathBuf::from(extra),
            };
            stager.stage_into(&source, &layout.build_dir, true)?;
        }
    }

    for target in &manifest.targets {
        if let BuildTarget::Library {
            filename,
            msvc_export: true,
        } = target
        {
            let source = relative_to(&layout.obj_dir, filename);
            if source.is_file() {
                stager.stage_into(&source, &layout.build_dir, false)?;
            }
        }
    }

    Ok(())
}

fn stage_executables(
    stager: &mut ArtifactStager,
    manifest: &BuildManifest,
    layout: &RunLayout,
) -> Result<()> {
    for target in &manifest.targets {
        let BuildTarget::Executable { filename } = target else {
            continue;
        };

        let source = relative_to(&layout.obj_dir, filename);
        if !source.is_file() {
            continue;
        }

        let destination = relative_to(&layout.build_dir, filename);
        if let Some(parent) = destination.parent() {
            create_target_dir(parent)?;
        }
        stager.stage(&source, &destination, true)?;
    }
    Ok(())
}

/// Joins a slash-separated manifest path onto `base`.
fn relative_to(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(base.to_path_buf(), |path, part| path.join(part))
}
