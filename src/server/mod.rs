//! Test servers that stand in for a remote repository.
//!
//! This module provides the [`ServiceProcess`] trait and two
//! implementations: [`Svnserve`], which serves repositories directly, and
//! [`Httpd`], which serves them over HTTP through the DAV module.

mod httpd;
mod httpd_conf;
mod svnserve;

pub use httpd::{random_port, Httpd, HttpdMode, HttpdOptions, TEST_PASSWORD, TEST_USERS};
pub use httpd_conf::{
    quote, synthesize, HttpdSettings, LogMode, PathAuthz, ServerVersion, REPOSITORY_ROOTS,
};
pub use svnserve::Svnserve;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Child;

use crate::error::Result;

/// Which kind of server a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Svnserve,
    HttpdDaemon,
    HttpdService,
}

/// A started server.
///
/// Exists between a successful `start` and the next `stop`.
#[derive(Debug)]
pub struct ServiceHandle {
    pub kind: ServiceKind,
    /// Config file the server was started with, if any.
    pub config_path: Option<PathBuf>,
    /// The child process, when the driver launched it directly.
    child: Option<Child>,
}

impl ServiceHandle {
    /// Creates a handle for a directly launched child process.
    pub fn for_child(kind: ServiceKind, child: Child, config_path: Option<PathBuf>) -> Self {
        Self {
            kind,
            config_path,
            child: Some(child),
        }
    }

    /// Creates a handle for a server run by the system service manager.
    pub fn for_service(kind: ServiceKind, config_path: Option<PathBuf>) -> Self {
        Self {
            kind,
            config_path,
            child: None,
        }
    }

    /// Returns the OS process id, if the driver launched the process.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Polls once and kills the child if it is still running.
    pub async fn terminate(&mut self, name: &str) {
        let Some(child) = self.child.as_mut() else {
            return;
        };

        tracing::info!(server = %name, pid = ?child.id(), "stopping server");
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(server = %name, status = %status, "server already exited");
            }
            Ok(None) | Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %name, error = %e, "failed to kill server");
                }
            }
        }
    }
}

/// A server process started for the duration of a test run.
#[async_trait]
pub trait ServiceProcess: Send + Sync {
    /// Starts the server.
    ///
    /// `args` replaces the default command line where the server
    /// supports it.
    async fn start(&mut self, args: Option<&[String]>) -> Result<()>;

    /// Stops the server. Does nothing if it is not running; never fails.
    async fn stop(&mut self);

    /// Returns true while a handle from `start` is held.
    fn is_running(&self) -> bool;

    /// Returns the server's name for log output.
    fn name(&self) -> &str;
}
