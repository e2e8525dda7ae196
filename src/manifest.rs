//! Build manifest loading and the test catalog derived from it.
//!
//! The manifest is written by the build-description step and lists the
//! test programs, the external libraries the tests load at runtime and
//! every install target produced by the build.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::BuildVariant;
use crate::error::{Error, Result};
use crate::server::ServerVersion;

/// Kind of a catalog entry, inferred from its suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// A compiled test program.
    Program,
    /// An interpreted test script.
    Script,
}

impl TestKind {
    /// Infers the kind from a catalog path.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".py") {
            TestKind::Script
        } else {
            TestKind::Program
        }
    }
}

/// One discoverable test program or script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCatalogEntry {
    path: String,
    kind: TestKind,
}

impl TestCatalogEntry {
    /// Creates an entry from a slash-separated relative path.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let kind = TestKind::from_path(&path);
        Self { path, kind }
    }

    /// Returns the relative path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the final path segment.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns the inferred kind.
    pub fn kind(&self) -> TestKind {
        self.kind
    }
}

/// The ordered set of tests available for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<TestCatalogEntry>,
}

impl Catalog {
    /// Builds a catalog from paths, keeping discovery order.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: paths.into_iter().map(TestCatalogEntry::new).collect(),
        }
    }

    /// Returns the entries in discovery order.
    pub fn entries(&self) -> &[TestCatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An external library the test programs load at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryRecord {
    /// Library name (e.g. "apr", "httpd").
    pub name: String,

    /// Release DLL file name.
    #[serde(default)]
    pub dll_name: Option<String>,

    /// Directory holding the release DLL.
    #[serde(default)]
    pub dll_dir: Option<PathBuf>,

    /// Debug DLL file name.
    #[serde(default)]
    pub debug_dll_name: Option<String>,

    /// Directory holding the debug DLL.
    #[serde(default)]
    pub debug_dll_dir: Option<PathBuf>,

    /// Extra binaries shipped next to the DLL that the tests need.
    #[serde(default)]
    pub extra_bin: Vec<String>,
}

impl LibraryRecord {
    /// Returns the DLL name and directory for the given build variant.
    pub fn dll_for(&self, variant: BuildVariant) -> (Option<&str>, Option<&Path>) {
        match variant {
            BuildVariant::Debug => (
                self.debug_dll_name.as_deref(),
                self.debug_dll_dir.as_deref(),
            ),
            BuildVariant::Release => (self.dll_name.as_deref(), self.dll_dir.as_deref()),
        }
    }
}

/// An install target produced by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildTarget {
    /// An executable, relative to the object directory.
    Executable { filename: String },
    /// A shared library; `msvc_export` marks libraries loaded by the tests.
    Library {
        filename: String,
        #[serde(default)]
        msvc_export: bool,
    },
    /// A language binding extension module.
    BindingModule { filename: String, language: String },
    /// A support library for a language binding.
    BindingLibrary { filename: String, language: String },
}

impl BuildTarget {
    /// Returns the target path relative to the object directory.
    pub fn filename(&self) -> &str {
        match self {
            BuildTarget::Executable { filename }
            | BuildTarget::Library { filename, .. }
            | BuildTarget::BindingModule { filename, .. }
            | BuildTarget::BindingLibrary { filename, .. } => filename,
        }
    }
}

/// Everything the build-description step tells the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Test programs, in discovery order.
    #[serde(default)]
    pub test_programs: Vec<String>,

    /// Test scripts, in discovery order.
    #[serde(default)]
    pub scripts: Vec<String>,

    /// Test programs that only apply to the bdb backend.
    #[serde(default)]
    pub bdb_test_programs: Vec<String>,

    /// Test scripts that only apply to the bdb backend.
    #[serde(default)]
    pub bdb_scripts: Vec<String>,

    /// External runtime libraries.
    #[serde(default)]
    pub libraries: Vec<LibraryRecord>,

    /// Install targets.
    #[serde(default)]
    pub targets: Vec<BuildTarget>,

    /// Version of the httpd the modules were built against (e.g. "2.4.58").
    #[serde(default)]
    pub httpd_version: Option<String>,

    /// Whether the build produced the httpd protocol modules.
    #[serde(default)]
    pub has_httpd_modules: bool,
}

impl BuildManifest {
    /// Loads a manifest from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Manifest(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parses a manifest from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Manifest(format!("failed to parse manifest: {}", e)))
    }

    /// Returns the catalog of tests for the given filesystem backend.
    pub fn catalog(&self, fs_type: &str) -> Catalog {
        let mut paths: Vec<&String> = self.test_programs.iter().collect();
        if fs_type == "bdb" {
            paths.extend(&self.bdb_test_programs);
            paths.extend(&self.scripts);
            paths.extend(&self.bdb_scripts);
        } else {
            paths.extend(&self.scripts);
        }
        Catalog::new(paths.into_iter().cloned())
    }

    /// Returns the httpd version recorded in the manifest, if any.
    pub fn server_version(&self) -> Result<Option<ServerVersion>> {
        self.httpd_version
            .as_deref()
            .map(|v| v.parse::<ServerVersion>())
            .transpose()
    }
}
