//! The external test harness that actually runs the plan.
//!
//! The driver only hands over the plan and the pass-through options and
//! reads back whether anything failed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::config::{RunConfig, RunSettings};
use crate::error::{Error, Result};
use crate::resolver::ExecutionPlan;

/// File the plan is written to, relative to the build dir.
pub const PLAN_FILE: &str = "run-plan.json";

/// HTTP client library the tests are told to use.
pub const HTTP_LIBRARY: &str = "serf";

/// Options forwarded to the harness without interpretation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HarnessOptions {
    pub run_id: String,
    pub src_dir: PathBuf,
    pub build_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub fail_log: Option<PathBuf>,
    pub base_url: Option<String>,
    pub fs_type: String,
    pub http_library: String,
    pub server_minor_version: Option<u32>,
    pub verbose: bool,
    pub quiet: bool,
    pub cleanup: bool,
    pub enable_sasl: bool,
    pub parallel: bool,
    pub config_file: Option<PathBuf>,
    pub fsfs_sharding: Option<u32>,
    pub fsfs_packing: bool,
    pub list_tests: bool,
    pub svn_bin: Option<PathBuf>,
    pub mode_filter: Option<String>,
    pub milestone_filter: Option<String>,
    pub log_level: Option<String>,
    pub ssl_cert: Option<PathBuf>,
    /// `PATH` for the harness process.
    #[serde(skip)]
    pub child_path: OsString,
}

impl HarnessOptions {
    /// Collects the options for one run.
    pub fn new(run_id: impl Into<String>, config: &RunConfig, settings: &RunSettings) -> Self {
        Self {
            run_id: run_id.into(),
            src_dir: settings.layout.src_dir.clone(),
            build_dir: settings.layout.build_dir.clone(),
            log_file: settings.log_files.log.clone(),
            fail_log: settings.log_files.fail_log.clone(),
            base_url: settings.base_url.clone(),
            fs_type: settings.fs_type.clone(),
            http_library: HTTP_LIBRARY.to_string(),
            server_minor_version: config.server_minor_version,
            verbose: config.verbose,
            quiet: config.quiet,
            cleanup: config.cleanup,
            enable_sasl: config.enable_sasl,
            parallel: config.parallel,
            config_file: config.config_file.clone(),
            fsfs_sharding: config.fsfs_sharding,
            fsfs_packing: config.fsfs_packing,
            list_tests: config.list,
            svn_bin: config.svn_bin.clone(),
            mode_filter: config.mode_filter.clone(),
            milestone_filter: config.milestone_filter.clone(),
            log_level: config.log_level.clone(),
            ssl_cert: config.ssl_cert.clone(),
            child_path: settings.layout.child_path(),
        }
    }

    /// Renders the options as `--flag[=value]` arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--srcdir={}", self.src_dir.display()),
            format!("--builddir={}", self.build_dir.display()),
            format!("--fs-type={}", self.fs_type),
            format!("--http-library={}", self.http_library),
        ];

        push_path(&mut args, "--log", self.log_file.as_deref());
        push_path(&mut args, "--faillog", self.fail_log.as_deref());
        push_value(&mut args, "--url", self.base_url.as_ref());
        push_value(&mut args, "--server-minor-version", self.server_minor_version.as_ref());
        push_path(&mut args, "--config-file", self.config_file.as_deref());
        push_value(&mut args, "--fsfs-sharding", self.fsfs_sharding.as_ref());
        push_path(&mut args, "--svn-bin", self.svn_bin.as_deref());
        push_value(&mut args, "--mode-filter", self.mode_filter.as_ref());
        push_value(&mut args, "--milestone-filter", self.milestone_filter.as_ref());
        push_value(&mut args, "--log-level", self.log_level.as_ref());
        push_path(&mut args, "--ssl-cert", self.ssl_cert.as_deref());

        for (flag, on) in [
            ("--verbose", self.verbose),
            ("--quiet", self.quiet),
            ("--cleanup", self.cleanup),
            ("--enable-sasl", self.enable_sasl),
            ("--parallel", self.parallel),
            ("--fsfs-packing", self.fsfs_packing),
            ("--list", self.list_tests),
        ] {
            if on {
                args.push(flag.to_string());
            }
        }

        args
    }
}

fn push_value(args: &mut Vec<String>, flag: &str, value: Option<&impl std::fmt::Display>) {
    if let Some(value) = value {
        args.push(format!("{}={}", flag, value));
    }
}

fn push_path(args: &mut Vec<String>, flag: &str, path: Option<&Path>) {
    if let Some(path) = path {
        args.push(format!("{}={}", flag, path.display()));
    }
}

/// Something that can run an execution plan.
#[async_trait]
pub trait TestHarness: Send + Sync {
    /// Runs the plan. Returns true if any test failed.
    async fn run(&self, plan: &ExecutionPlan, options: &HarnessOptions) -> Result<bool>;

    /// Returns the name of this harness.
    fn name(&self) -> &str;
}

#[derive(Serialize)]
struct PlanFile<'a> {
    options: &'a HarnessOptions,
    tests: &'a ExecutionPlan,
}

/// Runs an external program in the build dir.
///
/// Options go first as flags, then one `path[#subtests]` argument per plan
/// entry. A non-zero exit status counts as failures.
pub struct CommandHarness {
    program: String,
    args: Vec<String>,
}

impl CommandHarness {
    /// Creates a harness from a command line, program first.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("harness command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    fn build_args(&self, plan: &ExecutionPlan, options: &HarnessOptions) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(options.to_args());
        args.extend(plan.to_args());
        args
    }

    fn write_plan(&self, plan: &ExecutionPlan, options: &HarnessOptions) -> Result<PathBuf> {
        let path = options.build_dir.join(PLAN_FILE);
        let json = serde_json::to_string_pretty(&PlanFile {
            options,
            tests: plan,
        })
        .map_err(|e| Error::Harness(format!("failed to serialize plan: {}", e)))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

#[async_trait]
impl TestHarness for CommandHarness {
    async fn run(&self, plan: &ExecutionPlan, options: &HarnessOptions) -> Result<bool> {
        let plan_path = self.write_plan(plan, options)?;
        let args = self.build_args(plan, options);

        tracing::info!(
            program = %self.program,
            tests = plan.len(),
            plan = ?plan_path,
            working_dir = ?options.build_dir,
            "running test harness"
        );

        let status = Command::new(&self.program)
            .args(&args)
            .current_dir(&options.build_dir)
            .env("PATH", &options.child_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::Harness(format!("failed to run {}: {}", self.program, e)))?;

        if !status.success() {
            tracing::warn!(status = %status, "test runner reported failure");
        }
        Ok(!status.success())
    }

    fn name(&self) -> &str {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Catalog;
    use crate::resolver::resolve;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> HarnessOptions {
        HarnessOptions {
            run_id: "run-1".to_string(),
            src_dir: dir.path().to_path_buf(),
            build_dir: dir.path().to_path_buf(),
            fs_type: "fsfs".to_string(),
            http_library: HTTP_LIBRARY.to_string(),
            child_path: std::env::var_os("PATH").unwrap_or_default(),
            ..Default::default()
        }
    }

    fn plan() -> ExecutionPlan {
        let catalog = Catalog::new(["subversion/tests/cmdline/basic_tests.py"]);
        resolve(&["basic_tests.py#2"], &catalog).plan
    }

    #[test]
    fn options_render_set_flags_only() {
        let dir = TempDir::new().unwrap();
        let mut options = options(&dir);
        options.base_url = Some("svn://localhost".to_string());
        options.parallel = true;
        options.fsfs_sharding = Some(4);

        let args = options.to_args();
        assert!(args.contains(&"--url=svn://localhost".to_string()));
        assert!(args.contains(&"--parallel".to_string()));
        assert!(args.contains(&"--fsfs-sharding=4".to_string()));
        assert!(args.contains(&"--http-library=serf".to_string()));
        assert!(!args.contains(&"--verbose".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--log=")));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandHarness::new(&[]).is_err());
    }

    #[test]
    fn plan_entries_follow_the_options() {
        let dir = TempDir::new().unwrap();
        let harness =
            CommandHarness::new(&["python".to_string(), "run_tests.py".to_string()]).unwrap();

        let args = harness.build_args(&plan(), &options(&dir));
        assert_eq!(args.first().map(String::as_str), Some("run_tests.py"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("subversion/tests/cmdline/basic_tests.py#2")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_decides_failures() {
        let dir = TempDir::new().unwrap();

        let passing = CommandHarness::new(&["true".to_string()]).unwrap();
        assert!(!passing.run(&plan(), &options(&dir)).await.unwrap());

        let failing = CommandHarness::new(&["false".to_string()]).unwrap();
        assert!(failing.run(&plan(), &options(&dir)).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn plan_file_is_written() {
        let dir = TempDir::new().unwrap();
        let harness = CommandHarness::new(&["true".to_string()]).unwrap();
        harness.run(&plan(), &options(&dir)).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join(PLAN_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["options"]["run_id"], "run-1");
        assert_eq!(
            json["tests"]["entries"][0],
            "subversion/tests/cmdline/basic_tests.py#2"
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_harness_error() {
        let dir = TempDir::new().unwrap();
        let harness = CommandHarness::new(&["no-such-harness-program".to_string()]).unwrap();

        let err = harness.run(&plan(), &options(&dir)).await.unwrap_err();
        assert!(matches!(err, Error::Harness(_)));
    }
}
