//! svn-test-driver - runs the Subversion test suite against a finished build
//!
//! This library stages build outputs into the test directory, supervises the
//! svnserve or httpd server the remote tests talk to, resolves which tests to
//! run and hands the resulting plan to the external test harness.

pub mod config;
pub mod driver;
pub mod error;
pub mod harness;
pub mod manifest;
pub mod resolver;
pub mod server;
pub mod stager;

pub use config::{
    BuildVariant, HttpdConfig, LogFiles, RunConfig, RunLayout, RunSettings, ServerChoice,
    Validate, ValidationResult, KNOWN_FS_TYPES, KNOWN_MODE_FILTERS,
};
pub use driver::{
    interruptible, shutdown_signal, with_service, with_service_until, ExecutionDriver, RunOutcome,
};
pub use error::{Error, Result};
pub use harness::{CommandHarness, HarnessOptions, TestHarness};
pub use manifest::{BuildManifest, BuildTarget, Catalog, LibraryRecord, TestCatalogEntry, TestKind};
pub use resolver::{resolve, ExecutionPlan, PlanEntry, Resolution, SubtestSet, TestSpecifier};
pub use server::{Httpd, HttpdMode, HttpdOptions, ServerVersion, ServiceProcess, Svnserve};
pub use stager::{ArtifactStager, CleanupReport, StageOutcome, StagedArtifact};
