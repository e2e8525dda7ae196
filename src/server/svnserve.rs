//! Direct repository server for `svn://` tests.

use std::ffi::OsString;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{BuildVariant, RunLayout};
use crate::error::{Error, Result};

use super::{ServiceHandle, ServiceKind, ServiceProcess};

/// svnserve launched from the object directory, serving the test root.
pub struct Svnserve {
    name: String,
    binary: PathBuf,
    root: PathBuf,
    variant: BuildVariant,
    child_path: OsString,
    handle: Option<ServiceHandle>,
}

impl Svnserve {
    /// Creates an svnserve for the given build layout.
    pub fn new(layout: &RunLayout) -> Self {
        let name = format!("svnserve{}", std::env::consts::EXE_SUFFIX);
        Self {
            binary: layout.obj_dir.join("subversion").join("svnserve").join(&name),
            name,
            root: layout.cmdline_dir(),
            variant: layout.variant,
            child_path: layout.child_path(),
            handle: None,
        }
    }

    /// Overrides the binary location.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Arguments used when the caller supplies none: daemon mode rooted at
    /// the test directory.
    pub fn default_args(&self) -> Vec<String> {
        vec![
            "-d".to_string(),
            "-r".to_string(),
            self.root.display().to_string(),
        ]
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Returns the live handle, if started.
    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }
}

#[async_trait]
impl ServiceProcess for Svnserve {
    async fn start(&mut self, args: Option<&[String]>) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::ServiceStart(format!("{} is already running", self.name)));
        }

        let args = match args {
            Some(args) => args.to_vec(),
            None => self.default_args(),
        };

        tracing::info!(
            variant = %self.variant,
            binary = ?self.binary,
            args = ?args,
            "starting svnserve"
        );

        let child = Command::new(&self.binary)
            .args(&args)
            .env("PATH", &self.child_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ServiceStart(format!("failed to spawn {}: {}", self.binary.display(), e))
            })?;

        self.handle = Some(ServiceHandle::for_child(ServiceKind::Svnserve, child, None));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.terminate(&self.name).await;
        }
    }

    fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
