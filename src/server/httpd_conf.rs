//! httpd configuration synthesis.
//!
//! [`synthesize`] is a pure function of its settings and the server
//! version, and always produces the complete file.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Repository roots served by the test server, relative to the work dir.
pub const REPOSITORY_ROOTS: &[&str] = &["repositories", "local_tmp"];

/// URL prefix for the plain repository locations.
pub const WORK_LOCATION_PREFIX: &str = "/svn-test-work";

/// URL prefix for the DontDoThat-guarded repository locations.
pub const GUARDED_LOCATION_PREFIX: &str = "/ddt-test-work";

/// Major/minor version of the httpd being configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns true if this version is `major.minor` or newer.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= Self::new(major, minor)
    }
}

impl FromStr for ServerVersion {
    type Err = Error;

    /// Parses `2.4`, `2.4.58` and similar; anything past the minor is ignored.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid server version '{}'", s));
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        Ok(Self::new(major, minor))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Path-based authorization mode for the repository locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathAuthz {
    #[default]
    On,
    Off,
    ShortCircuit,
}

impl PathAuthz {
    fn as_directive(&self) -> &'static str {
        match self {
            PathAuthz::On => "on",
            PathAuthz::Off => "off",
            PathAuthz::ShortCircuit => "short_circuit",
        }
    }
}

/// How much the server logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Access and error logs at debug verbosity.
    #[default]
    Full,
    /// Error log only, at critical verbosity.
    ErrorsOnly,
}

/// Everything the config file depends on besides the server version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpdSettings {
    pub port: u16,
    /// ServerRoot and DocumentRoot.
    pub server_root: PathBuf,
    /// Directory holding the stock httpd modules.
    pub system_modules_dir: PathBuf,
    /// Directory the protocol modules were staged into.
    pub svn_modules_dir: PathBuf,
    /// Parent of the repository roots.
    pub work_dir: PathBuf,
    pub users_file: PathBuf,
    pub authz_file: PathBuf,
    pub dontdothat_file: PathBuf,
    pub mime_types_file: PathBuf,
    pub advertise_v2: bool,
    pub bulk_updates: bool,
    pub path_authz: PathAuthz,
    pub log_mode: LogMode,
}

/// Renders the complete httpd configuration.
pub fn synthesize(settings: &HttpdSettings, version: ServerVersion) -> String {
    let mut out = String::new();
    let root = quote_path(&settings.server_root);

    out.push_str("<IfModule mpm_winnt.c>\nThreadsPerChild 16\n</IfModule>\n");

    out.push_str(&format!("ServerRoot   {}\n", root));
    out.push_str(&format!("DocumentRoot {}\n", root));
    out.push_str("ServerName   localhost\n");
    out.push_str("PidFile      pid\n");
    out.push_str("ErrorLog     log\n");
    out.push_str(&format!("Listen       {}\n", settings.port));

    match settings.log_mode {
        LogMode::Full => {
            out.push_str("LogFormat    \"%h %l %u %t \\\"%r\\\" %>s %b\" common\n");
            out.push_str("Customlog    log common\n");
            out.push_str("LogLevel     Debug\n");
        }
        LogMode::ErrorsOnly => out.push_str("LogLevel     Crit\n"),
    }

    for (name, file) in system_modules(version) {
        out.push_str(&load_module(name, &settings.system_modules_dir.join(file)));
    }
    for (name, file) in [
        ("dav_svn_module", "mod_dav_svn.so"),
        ("authz_svn_module", "mod_authz_svn.so"),
        ("dontdothat_module", "mod_dontdothat.so"),
    ] {
        out.push_str(&load_module(name, &settings.svn_modules_dir.join(file)));
    }

    out.push_str("<Directory />\nAllowOverride None\nOptions None\n</Directory>\n\n");

    for name in REPOSITORY_ROOTS {
        out.push_str(&repository_locations(settings, name));
    }

    out.push_str(&format!(
        "RedirectMatch permanent ^{0}/repositories/REDIRECT-PERM-(.*)$ {0}/repositories/$1\n",
        WORK_LOCATION_PREFIX
    ));
    out.push_str(&format!(
        "RedirectMatch           ^{0}/repositories/REDIRECT-TEMP-(.*)$ {0}/repositories/$1\n",
        WORK_LOCATION_PREFIX
    ));

    out.push_str(&format!(
        "TypesConfig     {}\n",
        quote_path(&settings.mime_types_file)
    ));
    out.push_str("HostNameLookups Off\n");

    out
}

/// Stock modules to load for the given httpd version, in load order.
fn system_modules(version: ServerVersion) -> Vec<(&'static str, &'static str)> {
    let mut modules = vec![("dav_module", "mod_dav.so")];

    if version.at_least(2, 3) {
        modules.extend([
            ("access_compat_module", "mod_access_compat.so"),
            ("authz_core_module", "mod_authz_core.so"),
            ("authz_user_module", "mod_authz_user.so"),
            ("authn_core_module", "mod_authn_core.so"),
        ]);
    }
    if version.at_least(2, 2) {
        modules.extend([
            ("auth_basic_module", "mod_auth_basic.so"),
            ("authn_file_module", "mod_authn_file.so"),
        ]);
    } else {
        modules.push(("auth_module", "mod_auth.so"));
    }

    modules.extend([
        ("alias_module", "mod_alias.so"),
        ("mime_module", "mod_mime.so"),
        ("log_config_module", "mod_log_config.so"),
    ]);
    modules
}

fn load_module(name: &str, path: &Path) -> String {
    format!("LoadModule {} {}\n", name, quote_path(path))
}

fn repository_locations(settings: &HttpdSettings, name: &str) -> String {
    let parent = quote_path(&settings.work_dir.join(name));
    let body = format!(
        "  DAV             svn\n\
         \x20 SVNParentPath   {parent}\n\
         \x20 SVNAdvertiseV2Protocol {v2}\n\
         \x20 SVNPathAuthz {authz}\n\
         \x20 SVNAllowBulkUpdates {bulk}\n\
         \x20 AuthzSVNAccessFile {authz_file}\n\
         \x20 AuthType        Basic\n\
         \x20 AuthName        \"Subversion Repository\"\n\
         \x20 AuthUserFile    {users}\n\
         \x20 Require         valid-user\n",
        parent = parent,
        v2 = on_off(settings.advertise_v2),
        authz = settings.path_authz.as_directive(),
        bulk = on_off(settings.bulk_updates),
        authz_file = quote_path(&settings.authz_file),
        users = quote_path(&settings.users_file),
    );

    format!(
        "<Location {plain}/{name}>\n{body}</Location>\n\
         <Location {guarded}/{name}>\n{body}  DontDoThatConfigFile {ddt}\n</Location>\n",
        plain = WORK_LOCATION_PREFIX,
        guarded = GUARDED_LOCATION_PREFIX,
        name = name,
        body = body,
        ddt = quote_path(&settings.dontdothat_file),
    )
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Double-quotes a config argument that contains spaces.
pub fn quote(arg: &str) -> Cow<'_, str> {
    if arg.contains(' ') {
        Cow::Owned(format!("\"{}\"", arg))
    } else {
        Cow::Borrowed(arg)
    }
}

fn quote_path(path: &Path) -> String {
    quote(&path.display().to_string()).into_owned()
}
