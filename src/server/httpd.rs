//! httpd with the DAV protocol module for `http://` tests.

use std::ffi::OsString;
use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::RunLayout;
use crate::error::{Error, Result};
use crate::stager::create_target_dir;

use super::httpd_conf::{synthesize, HttpdSettings, LogMode, PathAuthz, ServerVersion};
use super::{ServiceHandle, ServiceKind, ServiceProcess};

/// The two identities the test suite authenticates as.
pub const TEST_USERS: [&str; 2] = ["jrandom", "jconstant"];

/// Password shared by both test identities.
pub const TEST_PASSWORD: &str = "rayjandom";

/// Ports picked when the caller does not choose one.
pub const EPHEMERAL_PORTS: Range<u16> = 1024..30000;

/// Executable names looked up under `<httpd_dir>/bin`, in order.
const BINARY_NAMES: [&str; 2] = ["apache", "httpd"];

/// Picks a port from [`EPHEMERAL_PORTS`]. No collision check is made.
pub fn random_port() -> u16 {
    rand::random_range(EPHEMERAL_PORTS)
}

/// How httpd is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpdMode {
    /// Installed and started through the service manager.
    #[default]
    Service,
    /// Launched as a child process of the driver.
    Daemon,
}

/// Settings chosen by the user for the HTTP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpdOptions {
    /// httpd installation directory.
    pub httpd_dir: PathBuf,
    pub port: Option<u16>,
    pub mode: HttpdMode,
    pub no_log: bool,
    pub advertise_v2: bool,
    pub short_circuit: bool,
    pub bulk_updates: bool,
}

impl HttpdOptions {
    /// Creates options with the server defaults: service mode, full
    /// logging, v2 advertised and bulk updates on.
    pub fn new(httpd_dir: impl Into<PathBuf>) -> Self {
        Self {
            httpd_dir: httpd_dir.into(),
            port: None,
            mode: HttpdMode::default(),
            no_log: false,
            advertise_v2: true,
            short_circuit: false,
            bulk_updates: true,
        }
    }
}

/// httpd configured for one test run.
///
/// Construction writes every file the server needs; `start` only launches.
pub struct Httpd {
    name: String,
    binary: PathBuf,
    mode: HttpdMode,
    settings: HttpdSettings,
    config_path: PathBuf,
    service_name: String,
    base_args: Vec<String>,
    child_path: OsString,
    handle: Option<ServiceHandle>,
}

impl Httpd {
    /// Like [`Httpd::new`], but asks the binary for its version (`httpd -v`)
    /// when the build did not record one.
    pub async fn configure(
        options: &HttpdOptions,
        layout: &RunLayout,
        version: Option<ServerVersion>,
    ) -> Result<Self> {
        let version = match version {
            Some(version) => version,
            None => {
                let (_, binary) = locate_binary(&options.httpd_dir)?;
                detect_version(&binary).await?
            }
        };
        Self::new(options, layout, version)
    }

    /// Locates the binary and writes the config, users, mime types,
    /// authz and DontDoThat files.
    ///
    /// Fails if no httpd executable exists under `bin/`.
    pub fn new(options: &HttpdOptions, layout: &RunLayout, version: ServerVersion) -> Result<Self> {
        let (name, binary) = locate_binary(&options.httpd_dir)?;
        let port = options.port.unwrap_or_else(random_port);

        let root = layout.cmdline_dir().join("httpd");
        let work_dir = layout.test_work_dir();
        create_target_dir(&root)?;
        create_target_dir(&work_dir)?;

        let settings = HttpdSettings {
            port,
            server_root: root.clone(),
            system_modules_dir: options.httpd_dir.join("modules"),
            svn_modules_dir: layout.build_dir.clone(),
            users_file: root.join("users"),
            authz_file: work_dir.join("authz"),
            dontdothat_file: work_dir.join("dontdothat"),
            mime_types_file: root.join("mime.types"),
            work_dir,
            advertise_v2: options.advertise_v2,
            bulk_updates: options.bulk_updates,
            path_authz: if options.short_circuit {
                PathAuthz::ShortCircuit
            } else {
                PathAuthz::On
            },
            log_mode: if options.no_log {
                LogMode::ErrorsOnly
            } else {
                LogMode::Full
            },
        };

        write_users_file(&settings.users_file)?;
        std::fs::write(&settings.mime_types_file, "")?;
        std::fs::write(&settings.authz_file, "[/]\n* = rw\n")?;
        std::fs::write(&settings.dontdothat_file, "[recursive-actions]\n/ = deny\n")?;

        let config_path = root.join("httpd.conf");
        std::fs::write(&config_path, synthesize(&settings, version))?;

        let service_name = format!("svn-test-httpd-{}", port);
        let config_arg = config_path.display().to_string();
        let base_args = match options.mode {
            HttpdMode::Service => vec![
                "-n".to_string(),
                service_name.clone(),
                "-f".to_string(),
                config_arg,
            ],
            HttpdMode::Daemon => vec!["-f".to_string(), config_arg],
        };

        tracing::info!(
            binary = ?binary,
            port = port,
            version = %version,
            mode = ?options.mode,
            config = ?config_path,
            "configured httpd"
        );

        Ok(Self {
            name,
            binary,
            mode: options.mode,
            settings,
            config_path,
            service_name,
            base_args,
            child_path: layout.child_path(),
            handle: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.settings.port
    }

    pub fn mode(&self) -> HttpdMode {
        self.mode
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the settings the config file was rendered from.
    pub fn settings(&self) -> &HttpdSettings {
        &self.settings
    }

    /// Arguments shared by every invocation of the binary.
    pub fn base_args(&self) -> &[String] {
        &self.base_args
    }

    /// Runs `httpd <base args> <extra> -k <action>` and waits for it.
    async fn control(&self, extra: &[String], action: &str) -> Result<()> {
        tracing::info!(service = %self.service_name, action = %action, "httpd service control");

        let status = Command::new(&self.binary)
            .args(&self.base_args)
            .args(extra)
            .args(["-k", action])
            .env("PATH", &self.child_path)
            .status()
            .await
            .map_err(|e| {
                Error::ServiceStart(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if !status.success() {
            return Err(Error::ServiceStart(format!(
                "'{} -k {}' exited with {}",
                self.name, action, status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceProcess for Httpd {
    async fn start(&mut self, args: Option<&[String]>) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::ServiceStart(format!("{} is already running", self.name)));
        }
        let extra = args.unwrap_or_default();

        match self.mode {
            HttpdMode::Service => {
                self.control(extra, "install").await?;
                // Installed: from here on `stop` has something to undo.
                self.handle = Some(ServiceHandle::for_service(
                    ServiceKind::HttpdService,
                    Some(self.config_path.clone()),
                ));
                self.control(extra, "start").await
            }
            HttpdMode::Daemon => {
                tracing::info!(args = ?self.base_args, extra = ?extra, "starting httpd as daemon");
                let child = Command::new(&self.binary)
                    .args(&self.base_args)
                    .args(extra)
                    .env("PATH", &self.child_path)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        Error::ServiceStart(format!(
                            "failed to spawn {}: {}",
                            self.binary.display(),
                            e
                        ))
                    })?;
                self.handle = Some(ServiceHandle::for_child(
                    ServiceKind::HttpdDaemon,
                    child,
                    Some(self.config_path.clone()),
                ));
                Ok(())
            }
        }
    }

    async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        match handle.kind {
            ServiceKind::HttpdService => {
                for action in ["stop", "uninstall"] {
                    if let Err(e) = self.control(&[], action).await {
                        tracing::warn!(service = %self.service_name, error = %e, "httpd service control failed");
                    }
                }
            }
            _ => handle.terminate(&self.name).await,
        }
    }

    fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn locate_binary(httpd_dir: &Path) -> Result<(String, PathBuf)> {
    BINARY_NAMES
        .iter()
        .map(|name| format!("{}{}", name, std::env::consts::EXE_SUFFIX))
        .map(|name| {
            let path = httpd_dir.join("bin").join(&name);
            (name, path)
        })
        .find(|(_, path)| path.exists())
        .ok_or_else(|| Error::ServerBinaryNotFound {
            dir: httpd_dir.to_path_buf(),
        })
}

fn write_users_file(path: &Path) -> Result<()> {
    let content: String = TEST_USERS
        .iter()
        .map(|user| format!("{}:{}\n", user, TEST_PASSWORD))
        .collect();
    std::fs::write(path, content)?;
    Ok(())
}

/// Asks the binary for its version (`httpd -v`).
async fn detect_version(binary: &Path) -> Result<ServerVersion> {
    let output = Command::new(binary)
        .arg("-v")
        .output()
        .await
        .map_err(|e| Error::Config(format!("failed to run {} -v: {}", binary.display(), e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version_banner(&stdout).ok_or_else(|| {
        Error::Config(format!(
            "could not determine httpd version from '{}'",
            stdout.trim()
        ))
    })
}

/// Extracts the version from a `Server version: Apache/2.4.58 (Unix)` line.
fn parse_version_banner(banner: &str) -> Option<ServerVersion> {
    banner
        .lines()
        .filter_map(|line| line.split_once("Apache/"))
        .find_map(|(_, rest)| {
            let version = rest.split_whitespace().next()?;
            version.parse().ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildVariant;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        httpd_dir: PathBuf,
        layout: RunLayout,
    }

    fn fixture(binary_name: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let httpd_dir = dir.path().join("httpd");
        std::fs::create_dir_all(httpd_dir.join("bin")).unwrap();
        let binary = httpd_dir
            .join("bin")
            .join(format!("{}{}", binary_name, std::env::consts::EXE_SUFFIX));
        std::fs::write(binary, "").unwrap();

        let layout = RunLayout::new(dir.path(), BuildVariant::Release, None);
        Fixture {
            _dir: dir,
            httpd_dir,
            layout,
        }
    }

    fn options(f: &Fixture) -> HttpdOptions {
        HttpdOptions {
            port: Some(8080),
            ..HttpdOptions::new(&f.httpd_dir)
        }
    }

    #[test]
    fn random_port_stays_in_range() {
        for _ in 0..100 {
            assert!(EPHEMERAL_PORTS.contains(&random_port()));
        }
    }

    #[test]
    fn missing_binary_fails_construction() {
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path(), BuildVariant::Debug, None);
        let options = HttpdOptions::new(dir.path().join("nowhere"));

        let err = Httpd::new(&options, &layout, ServerVersion::new(2, 4))
            .err()
            .unwrap();
        assert!(matches!(err, Error::ServerBinaryNotFound { .. }));
        assert!(!layout.cmdline_dir().join("httpd").exists());
    }

    #[test]
    fn falls_back_to_httpd_binary_name() {
        let f = fixture("httpd");
        let httpd = Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();
        assert!(httpd.name().starts_with("httpd"));
    }

    #[test]
    fn construction_writes_run_files() {
        let f = fixture("apache");
        let httpd = Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();
        let settings = httpd.settings();

        let users = std::fs::read_to_string(&settings.users_file).unwrap();
        assert_eq!(users, "jrandom:rayjandom\njconstant:rayjandom\n");

        let ddt = std::fs::read_to_string(&settings.dontdothat_file).unwrap();
        assert_eq!(ddt, "[recursive-actions]\n/ = deny\n");

        assert!(settings.authz_file.exists());
        assert_eq!(std::fs::read_to_string(&settings.mime_types_file).unwrap(), "");

        let conf = std::fs::read_to_string(httpd.config_path()).unwrap();
        assert!(conf.contains("Listen       8080\n"));
        assert!(conf.contains("LogLevel     Debug\n"));
    }

    #[test]
    fn config_is_rewritten_not_appended() {
        let f = fixture("apache");
        let first = Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();
        let first_conf = std::fs::read_to_string(first.config_path()).unwrap();

        let opts = HttpdOptions {
            port: Some(9090),
            ..options(&f)
        };
        let second = Httpd::new(&opts, &f.layout, ServerVersion::new(2, 4)).unwrap();
        let second_conf = std::fs::read_to_string(second.config_path()).unwrap();

        assert_eq!(first.config_path(), second.config_path());
        assert_eq!(second_conf.len(), first_conf.len());
        assert!(!second_conf.contains("Listen       8080"));
    }

    #[test]
    fn no_log_writes_critical_error_logging_only() {
        let f = fixture("apache");
        let opts = HttpdOptions {
            no_log: true,
            ..options(&f)
        };
        let httpd = Httpd::new(&opts, &f.layout, ServerVersion::new(2, 4)).unwrap();

        let conf = std::fs::read_to_string(httpd.config_path()).unwrap();
        assert!(conf.contains("LogLevel     Crit\n"));
        assert!(!conf.contains("Customlog"));
        assert!(!conf.contains("LogFormat"));
    }

    #[test]
    fn service_mode_names_the_service_after_the_port() {
        let f = fixture("apache");
        let httpd = Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();

        assert_eq!(httpd.service_name(), "svn-test-httpd-8080");
        assert_eq!(httpd.base_args()[0], "-n");
        assert_eq!(httpd.base_args()[1], "svn-test-httpd-8080");
        assert_eq!(httpd.base_args()[2], "-f");

        let opts = HttpdOptions {
            mode: HttpdMode::Daemon,
            ..options(&f)
        };
        let daemon = Httpd::new(&opts, &f.layout, ServerVersion::new(2, 4)).unwrap();
        assert_eq!(daemon.base_args()[0], "-f");
        assert_eq!(daemon.base_args().len(), 2);
    }

    #[test]
    fn short_circuit_and_flags_reach_the_config() {
        let f = fixture("apache");
        let opts = HttpdOptions {
            short_circuit: true,
            advertise_v2: false,
            bulk_updates: false,
            ..options(&f)
        };
        let httpd = Httpd::new(&opts, &f.layout, ServerVersion::new(2, 4)).unwrap();

        let conf = std::fs::read_to_string(httpd.config_path()).unwrap();
        assert!(conf.contains("SVNPathAuthz short_circuit"));
        assert!(conf.contains("SVNAdvertiseV2Protocol off"));
        assert!(conf.contains("SVNAllowBulkUpdates off"));
    }

    #[test]
    fn version_banner_is_parsed() {
        let banner = "Server version: Apache/2.4.58 (Unix)\nServer built:   Oct 1 2024\n";
        assert_eq!(parse_version_banner(banner), Some(ServerVersion::new(2, 4)));
        assert_eq!(parse_version_banner("nginx"), None);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let f = fixture("apache");
        let mut httpd =
            Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();

        httpd.stop().await;
        httpd.stop().await;
        assert!(!httpd.is_running());
    }

    #[cfg(unix)]
    fn install_script(f: &Fixture, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = f.httpd_dir.join("bin").join("apache");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn service_mode_installs_starts_stops_and_uninstalls() {
        let f = fixture("apache");
        let log = f.layout.build_dir.join("control.log");
        install_script(&f, &format!("echo \"$5 $6\" >> '{}'", log.display()));

        let mut httpd =
            Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();
        httpd.start(None).await.unwrap();
        assert!(httpd.is_running());
        httpd.stop().await;
        httpd.stop().await;

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls, "-k install\n-k start\n-k stop\n-k uninstall\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_arguments_do_not_leak_into_later_calls() {
        let f = fixture("apache");
        let log = f.layout.build_dir.join("control.log");
        install_script(&f, &format!("printf '%s\\n' \"$*\" >> '{}'", log.display()));

        let mut httpd = Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();
        let base = httpd.base_args().join(" ");
        let extra = vec!["-DTESTING".to_string()];

        httpd.start(Some(&extra)).await.unwrap();
        httpd.stop().await;
        httpd.start(Some(&extra)).await.unwrap();
        httpd.stop().await;

        assert_eq!(httpd.base_args().join(" "), base);
        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                format!("{} -DTESTING -k install", base),
                format!("{} -DTESTING -k start", base),
                format!("{} -k stop", base),
                format!("{} -k uninstall", base),
                format!("{} -DTESTING -k install", base),
                format!("{} -DTESTING -k start", base),
                format!("{} -k stop", base),
                format!("{} -k uninstall", base),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn configure_asks_the_binary_for_its_version() {
        let f = fixture("apache");
        install_script(&f, "echo 'Server version: Apache/2.2.34 (Unix)'");

        let httpd = Httpd::configure(&options(&f), &f.layout, None).await.unwrap();

        let conf = std::fs::read_to_string(httpd.config_path()).unwrap();
        assert!(conf.contains("mod_auth_basic.so"));
        assert!(!conf.contains("mod_authz_core.so"));
    }

    #[tokio::test]
    async fn configure_without_binary_fails_before_running_it() {
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path(), BuildVariant::Debug, None);
        let options = HttpdOptions::new(dir.path().join("nowhere"));

        let err = Httpd::configure(&options, &layout, None).await.err().unwrap();
        assert!(matches!(err, Error::ServerBinaryNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_service_start_still_uninstalls_on_stop() {
        let f = fixture("apache");
        let log = f.layout.build_dir.join("control.log");
        install_script(
            &f,
            &format!(
                "echo \"$6\" >> '{}'\n[ \"$6\" = start ] && exit 1\nexit 0",
                log.display()
            ),
        );

        let mut httpd =
            Httpd::new(&options(&f), &f.layout, ServerVersion::new(2, 4)).unwrap();
        let err = httpd.start(None).await.unwrap_err();
        assert!(matches!(err, Error::ServiceStart(_)));

        httpd.stop().await;
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls, "install\nstart\nstop\nuninstall\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn daemon_mode_kills_the_child_on_stop() {
        let f = fixture("apache");
        install_script(&f, "exec sleep 30");
        let opts = HttpdOptions {
            mode: HttpdMode::Daemon,
            ..options(&f)
        };

        let mut httpd = Httpd::new(&opts, &f.layout, ServerVersion::new(2, 4)).unwrap();
        httpd.start(None).await.unwrap();
        assert!(httpd.is_running());

        httpd.stop().await;
        assert!(!httpd.is_running());
    }
}
