//! Integration tests for whole runs against a fake build tree.
//!
//! Servers and the harness are stood in for by small shell scripts, so
//! the process-control tests only run on unix.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use svn_test_driver::config::HttpdConfig;
use svn_test_driver::harness::PLAN_FILE;
use svn_test_driver::{
    BuildManifest, CommandHarness, Error, ExecutionDriver, RunConfig, RunOutcome, Validate,
};

const MANIFEST: &str = r#"
test_programs:
  - subversion/tests/libsvn_subr/string-test.exe
scripts:
  - subversion/tests/cmdline/basic_tests.py
  - subversion/tests/cmdline/copy_tests.py
httpd_version: "2.4"
has_httpd_modules: true
targets:
  - kind: executable
    filename: subversion/svn/svn
"#;

/// A source tree with a Debug build in it.
struct Tree {
    _dir: TempDir,
    src: PathBuf,
    build: PathBuf,
    manifest: PathBuf,
}

impl Tree {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let src = dir.path().join("src");
        let build = dir.path().join("build");
        let obj = src.join("Debug");

        write_file(&obj.join("subversion/svn/svn"), "svn");
        for module in svn_test_driver::driver::HTTPD_MODULES {
            write_file(&obj.join(module), module);
        }

        let manifest = src.join("test-manifest.yaml");
        write_file(&manifest, MANIFEST);

        Self {
            _dir: dir,
            src,
            build,
            manifest,
        }
    }

    fn config(&self, harness: &str) -> RunConfig {
        RunConfig {
            src_dir: self.src.clone(),
            build_dir: Some(self.build.clone()),
            manifest: self.manifest.clone(),
            harness_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                harness.to_string(),
                "sh".to_string(),
            ],
            ..Default::default()
        }
    }

    async fn run(&self, config: RunConfig) -> svn_test_driver::Result<RunOutcome> {
        assert!(config.validate().is_valid());
        let settings = config.resolve()?;
        let manifest = BuildManifest::load(&config.manifest)?;
        let harness = CommandHarness::new(&config.harness_command)?;
        let mut driver = ExecutionDriver::new(config, settings, manifest, Arc::new(harness));
        driver.run().await
    }
}

fn write_file(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().expect("path has a parent"))
        .expect("failed to create parent dir");
    std::fs::write(path, content).expect("failed to write file");
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    write_file(path, &format!("#!/bin/sh\n{}\n", body));
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to make script executable");
}

#[cfg(unix)]
#[tokio::test]
async fn local_run_hands_the_plan_to_the_harness() {
    let tree = Tree::new();
    let mut config = tree.config(r#"printf '%s\n' "$@" > args.txt"#);
    config.tests = vec!["basic_tests.py#1,4-5".to_string(), "string".to_string()];

    let outcome = tree.run(config).await.expect("run failed");

    assert!(!outcome.failed);
    assert!(outcome.server.is_none());
    assert_eq!(outcome.plan.len(), 2);

    let args = std::fs::read_to_string(tree.build.join("args.txt")).expect("no harness args");
    let args: Vec<&str> = args.lines().collect();
    assert!(args.contains(&"--fs-type=fsfs"));
    assert!(args.contains(&"--http-library=serf"));
    assert!(args.iter().any(|a| a.starts_with("--log=") && a.ends_with("tests.log")));
    assert_eq!(
        &args[args.len() - 2..],
        &[
            "subversion/tests/cmdline/basic_tests.py#1,4-5",
            "subversion/tests/libsvn_subr/string-test.exe",
        ]
    );

    assert!(tree.build.join(PLAN_FILE).is_file());
    assert!(tree.build.join("subversion/tests/cmdline").is_dir());
    // Relocated executables do not outlive the run.
    assert!(!tree.build.join("subversion/svn/svn").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn harness_failure_sets_the_exit_code() {
    let tree = Tree::new();

    let outcome = tree.run(tree.config("exit 3")).await.expect("run failed");

    assert!(outcome.failed);
    assert_eq!(outcome.exit_code(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn svnserve_runs_for_the_length_of_the_harness() {
    let tree = Tree::new();
    let log = tree.build.join("svnserve.log");
    write_script(
        &tree.src.join("Debug/subversion/svnserve/svnserve"),
        &format!("echo \"$@\" > '{}'\nexec sleep 30", log.display()),
    );

    let mut config = tree.config(
        "for i in $(seq 50); do [ -f svnserve.log ] && exit 0; sleep 0.1; done; exit 1",
    );
    config.base_url = Some("svn://localhost".to_string());

    let outcome = tree.run(config).await.expect("run failed");

    assert!(!outcome.failed, "svnserve never started");
    assert_eq!(outcome.server.as_deref(), Some("svnserve"));
    let args = std::fs::read_to_string(&log).expect("no svnserve log");
    let root = tree.build.join("subversion/tests/cmdline");
    assert_eq!(args.trim(), format!("-d -r {}", root.display()));
}

#[cfg(unix)]
#[tokio::test]
async fn httpd_service_is_installed_and_removed() {
    let tree = Tree::new();
    let httpd_dir = tree.src.join("apache");
    let log = tree.build.join("control.log");
    write_script(
        &httpd_dir.join("bin/httpd"),
        &format!("echo \"$6\" >> '{}'", log.display()),
    );

    let mut config = tree.config("exit 0");
    config.httpd = HttpdConfig {
        dir: Some(httpd_dir),
        port: Some(12345),
        no_log: true,
        ..Default::default()
    };

    let outcome = tree.run(config).await.expect("run failed");

    assert_eq!(outcome.server.as_deref(), Some("httpd"));
    let calls = std::fs::read_to_string(&log).expect("no control log");
    assert_eq!(calls, "install\nstart\nstop\nuninstall\n");

    let conf = std::fs::read_to_string(
        tree.build.join("subversion/tests/cmdline/httpd/httpd.conf"),
    )
    .expect("no httpd.conf");
    assert!(conf.contains("Listen       12345\n"));
    assert!(conf.contains("LogLevel     Crit\n"));
    assert!(!conf.contains("Customlog"));

    // Modules are durable build outputs and stay behind.
    assert!(tree.build.join("mod_dav_svn.so").is_file());
    assert!(tree.build.join("mod_dontdothat.so").is_file());
}

#[cfg(unix)]
#[tokio::test]
async fn failing_httpd_start_skips_the_tests() {
    let tree = Tree::new();
    let httpd_dir = tree.src.join("apache");
    write_script(&httpd_dir.join("bin/apache"), "[ \"$6\" = start ] && exit 1\nexit 0");

    let mut config = tree.config("touch ran");
    config.httpd.dir = Some(httpd_dir);

    let err = tree.run(config).await.expect_err("start should fail");

    assert!(matches!(err, Error::ServiceStart(_)));
    assert_eq!(err.exit_code(), 3);
    assert!(!tree.build.join("ran").exists());
    assert!(!tree.build.join("subversion/svn/svn").exists());
}

#[tokio::test]
async fn missing_manifest_is_a_setup_error() {
    let tree = Tree::new();
    let mut config = tree.config("exit 0");
    config.manifest = tree.src.join("nope.yaml");

    let err = tree.run(config).await.expect_err("manifest should be missing");
    assert!(matches!(err, Error::Manifest(_)));
    assert_eq!(err.exit_code(), 4);
}

#[test]
fn config_file_round_trips_through_validation() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("run.toml");
    std::fs::write(
        &path,
        r#"
variant = "release"
fs_type = "fsx"
mode_filter = "PASS"
harness_command = ["python3", "build/run_tests.py"]
"#,
    )
    .expect("failed to write config");

    let config = RunConfig::load(&path).expect("config should load");
    let warnings = config.validate().into_result().expect("config should be valid");

    assert!(warnings.is_empty());
    assert_eq!(config.fs_type(), "fsx");
    assert_eq!(config.harness_command[0], "python3");
}
