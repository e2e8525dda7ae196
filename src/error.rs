//! Error types for the test driver.

use std::path::PathBuf;
use thiserror::Error;

/// Exit status for a run whose harness reported failures.
pub const EXIT_TEST_FAILURES: i32 = 1;

/// Exit status for a missing build output or server installation.
pub const EXIT_MISSING_ARTIFACT: i32 = 2;

/// Exit status for a server that could not be launched.
pub const EXIT_SERVICE_START: i32 = 3;

/// Exit status for any other setup or configuration problem.
pub const EXIT_SETUP: i32 = 4;

/// Exit status for a run stopped by SIGINT or SIGTERM.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Top-level error type for driver operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A required build output does not exist.
    #[error("could not find {}", path.display())]
    MissingArtifact { path: PathBuf },

    /// Neither known httpd executable exists under the installation.
    #[error("could not find a valid httpd binary under {}", dir.display())]
    ServerBinaryNotFound { dir: PathBuf },

    /// The test server failed to launch.
    #[error("failed to start server: {0}")]
    ServiceStart(String),

    /// The build manifest could not be read or is inconsistent.
    #[error("build manifest error: {0}")]
    Manifest(String),

    /// Run configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A `#` subtest suffix could not be parsed.
    #[error("invalid subtest set '{0}'")]
    InvalidSubtestSet(String),

    /// The harness collaborator could not be run at all.
    #[error("test harness error: {0}")]
    Harness(String),

    /// The run was stopped by a signal; the payload names it.
    #[error("interrupted by {0}")]
    Interrupted(String),

    /// IO error during staging or config synthesis.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the process exit status this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MissingArtifact { .. } | Error::ServerBinaryNotFound { .. } => {
                EXIT_MISSING_ARTIFACT
            }
            Error::ServiceStart(_) => EXIT_SERVICE_START,
            Error::Interrupted(_) => EXIT_INTERRUPTED,
            _ => EXIT_SETUP,
        }
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
