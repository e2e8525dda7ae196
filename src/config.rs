//! Run configuration and validation.
//!
//! A [`RunConfig`] is what the user asked for (TOML file plus command-line
//! flags). [`RunConfig::resolve`] turns it into [`RunSettings`]: absolute
//! directories, the server to launch, the base URL and the log files.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::server::{random_port, HttpdMode, HttpdOptions};

/// Filesystem backends the harness knows about.
pub const KNOWN_FS_TYPES: &[&str] = &["fsfs", "bdb", "fsx"];

/// Accepted values for the mode filter.
pub const KNOWN_MODE_FILTERS: &[&str] = &["XFAIL", "SKIP", "PASS", "ALL"];

/// Command-line test scripts directory, relative to the build dir.
pub const CMDLINE_TEST_DIR: &str = "subversion/tests/cmdline";

/// Backend used when none is given.
pub const DEFAULT_FS_TYPE: &str = "fsfs";

/// Build configuration under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildVariant {
    #[default]
    Debug,
    Release,
}

impl BuildVariant {
    /// Object directory name for this variant.
    pub fn dir_name(&self) -> &'static str {
        match self {
            BuildVariant::Debug => "Debug",
            BuildVariant::Release => "Release",
        }
    }
}

impl fmt::Display for BuildVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// HTTP server settings as given by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpdConfig {
    /// httpd installation; setting it runs the DAV tests.
    pub dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub mode: HttpdMode,
    pub no_log: bool,
    pub short_circuit: bool,
    pub disable_v2: bool,
    pub disable_bulk_updates: bool,
}

/// Everything the user can ask of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub variant: BuildVariant,
    /// Source tree root; the object dir is `<src_dir>/<Variant>`.
    pub src_dir: PathBuf,
    /// Separate directory to run the tests in. Executables are copied there.
    pub build_dir: Option<PathBuf>,
    /// Build manifest listing tests and build outputs.
    pub manifest: PathBuf,
    pub fs_type: Option<String>,
    pub base_url: Option<String>,
    /// Replaces the default svnserve command line; implies svnserve.
    pub svnserve_args: Option<Vec<String>>,
    pub httpd: HttpdConfig,
    /// Test references, `<name>[#<subtests>]`.
    pub tests: Vec<String>,
    pub verbose: bool,
    pub quiet: bool,
    pub cleanup: bool,
    pub list: bool,
    pub parallel: bool,
    pub enable_sasl: bool,
    pub log_to_stdout: bool,
    pub fsfs_packing: bool,
    pub fsfs_sharding: Option<u32>,
    pub server_minor_version: Option<u32>,
    pub config_file: Option<PathBuf>,
    pub svn_bin: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub log_level: Option<String>,
    pub mode_filter: Option<String>,
    pub milestone_filter: Option<String>,
    /// Program and leading arguments of the test harness.
    pub harness_command: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            variant: BuildVariant::default(),
            src_dir: PathBuf::from("."),
            build_dir: None,
            manifest: PathBuf::from("build/test-manifest.yaml"),
            fs_type: None,
            base_url: None,
            svnserve_args: None,
            httpd: HttpdConfig::default(),
            tests: Vec::new(),
            verbose: false,
            quiet: false,
            cleanup: false,
            list: false,
            parallel: false,
            enable_sasl: false,
            log_to_stdout: false,
            fsfs_packing: false,
            fsfs_sharding: None,
            server_minor_version: None,
            config_file: None,
            svn_bin: None,
            ssl_cert: None,
            log_level: None,
            mode_filter: None,
            milestone_filter: None,
            harness_command: vec!["python".to_string(), "build/run_tests.py".to_string()],
        }
    }
}

/// Which server the run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerChoice {
    /// Local repository tests; nothing to launch.
    None,
    /// svnserve, with the user's arguments if any.
    Svnserve { args: Option<Vec<String>> },
    /// httpd with the DAV module.
    Httpd(HttpdOptions),
}

/// Where the harness writes its logs. `None` means stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFiles {
    pub log: Option<PathBuf>,
    pub fail_log: Option<PathBuf>,
}

/// Directories used by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub src_dir: PathBuf,
    /// Where the build wrote its outputs.
    pub obj_dir: PathBuf,
    /// Where the tests run.
    pub build_dir: PathBuf,
    pub variant: BuildVariant,
    /// Whether executables are copied from the object dir to the build dir.
    pub relocate_executables: bool,
}

impl RunLayout {
    pub fn new(src_dir: impl Into<PathBuf>, variant: BuildVariant, build_dir: Option<PathBuf>) -> Self {
        let src_dir = src_dir.into();
        let obj_dir = src_dir.join(variant.dir_name());
        let relocate_executables = build_dir.is_some();
        Self {
            build_dir: build_dir.unwrap_or_else(|| obj_dir.clone()),
            src_dir,
            obj_dir,
            variant,
            relocate_executables,
        }
    }

    /// Directory holding the command-line test scripts.
    pub fn cmdline_dir(&self) -> PathBuf {
        CMDLINE_TEST_DIR
            .split('/')
            .fold(self.build_dir.clone(), |dir, part| dir.join(part))
    }

    /// Scratch directory the tests create repositories in.
    pub fn test_work_dir(&self) -> PathBuf {
        self.cmdline_dir().join("svn-test-work")
    }

    /// `PATH` for child processes: the build dir first, then the inherited
    /// search path.
    pub fn child_path(&self) -> OsString {
        let mut dirs = vec![self.build_dir.clone()];
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        std::env::join_paths(dirs).unwrap_or_else(|_| self.build_dir.clone().into_os_string())
    }
}

/// A run configuration with every default filled in.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub layout: RunLayout,
    pub fs_type: String,
    pub base_url: Option<String>,
    pub server: ServerChoice,
    pub log_files: LogFiles,
}

impl RunSettings {
    /// Human-readable description of the repository under test.
    pub fn repo_location(&self) -> String {
        match &self.base_url {
            Some(url) => format!("remote repository {}.", url),
            None => "local repository.".to_string(),
        }
    }
}

impl RunConfig {
    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Returns the filesystem backend, defaulting to fsfs.
    pub fn fs_type(&self) -> &str {
        self.fs_type.as_deref().unwrap_or(DEFAULT_FS_TYPE)
    }

    fn runs_svnserve(&self, base_url: Option<&str>) -> bool {
        self.svnserve_args.is_some() || base_url.is_some_and(|url| url.starts_with("svn"))
    }

    /// Fills in defaults and derives the server, URL and log files.
    ///
    /// A random httpd port is chosen here, once per run.
    pub fn resolve(&self) -> Result<RunSettings> {
        let src_dir = std::path::absolute(&self.src_dir)?;
        let build_dir = self
            .build_dir
            .as_deref()
            .map(std::path::absolute)
            .transpose()?;
        let layout = RunLayout::new(src_dir, self.variant, build_dir);

        let mut base_url = self.base_url.clone();
        if self.enable_sasl {
            base_url = Some("svn://localhost/".to_string());
        }

        let mut server = ServerChoice::None;
        if let Some(dir) = &self.httpd.dir {
            let port = self.httpd.port.unwrap_or_else(random_port);
            base_url.get_or_insert_with(|| format!("http://localhost:{}", port));
            server = ServerChoice::Httpd(HttpdOptions {
                httpd_dir: std::path::absolute(dir)?,
                port: Some(port),
                mode: self.httpd.mode,
                no_log: self.httpd.no_log,
                advertise_v2: !self.httpd.disable_v2,
                short_circuit: self.httpd.short_circuit,
                bulk_updates: !self.httpd.disable_bulk_updates,
            });
        } else if self.runs_svnserve(base_url.as_deref()) {
            server = ServerChoice::Svnserve {
                args: self.svnserve_args.clone(),
            };
        }

        let (log, fail_log) = match base_url.as_deref() {
            None => ("tests.log", "fails.log"),
            Some(url) if url.starts_with("http") => ("dav-tests.log", "dav-fails.log"),
            Some(url) if url.starts_with("svn") => ("svn-tests.log", "svn-fails.log"),
            Some(_) => ("url-tests.log", "url-fails.log"),
        };
        let log_files = if self.log_to_stdout {
            LogFiles {
                log: None,
                fail_log: None,
            }
        } else {
            LogFiles {
                log: Some(layout.build_dir.join(log)),
                fail_log: Some(layout.build_dir.join(fail_log)),
            }
        };

        Ok(RunSettings {
            layout,
            fs_type: self.fs_type().to_string(),
            base_url,
            server,
            log_files,
        })
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for RunConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !KNOWN_FS_TYPES.contains(&self.fs_type()) {
            result.add_error(format!("unknown filesystem type '{}'", self.fs_type()));
        }

        if self.httpd.port == Some(0) {
            result.add_error("httpd port must be between 1 and 65535");
        }

        if let Some(filter) = &self.mode_filter {
            if !KNOWN_MODE_FILTERS.contains(&filter.to_uppercase().as_str()) {
                result.add_error(format!(
                    "unknown mode filter '{}', expected one of {}",
                    filter,
                    KNOWN_MODE_FILTERS.join(", ")
                ));
            }
        }

        if self.httpd.dir.is_some() && self.runs_svnserve(self.base_url.as_deref()) {
            result.add_error("cannot run httpd and svnserve in the same run");
        }

        if self.harness_command.is_empty() {
            result.add_error("harness_command cannot be empty");
        }

        if self.milestone_filter.is_some() && !self.list {
            result.add_warning("milestone filter only applies when listing tests");
        }

        if self.verbose && self.quiet {
            result.add_warning("both verbose and quiet requested; quiet wins for the harness");
        }

        result
    }
}
