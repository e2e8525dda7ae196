//! Staging of build outputs into the run directory.
//!
//! Files are copied only when the destination is missing or its content
//! differs. Destinations copied with tracking enabled are removed again by
//! [`ArtifactStager::cleanup_all`]; everything else is a durable output.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A file copied into the run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Whether the destination is removed at teardown.
    pub owned: bool,
}

/// What a single `stage` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Destination already had identical content.
    Unchanged,
    /// Source was copied over the destination.
    Copied,
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Destinations that were removed.
    pub removed: Vec<PathBuf>,
    /// Destinations that could not be removed, with the reason.
    pub failures: Vec<(PathBuf, String)>,
}

/// Copies build outputs and remembers which copies belong to this run.
#[derive(Debug, Default)]
pub struct ArtifactStager {
    staged: Vec<StagedArtifact>,
}

impl ArtifactStager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `source` to `destination` unless the content already matches.
    ///
    /// A missing source is fatal. When `track` is set and a copy happens,
    /// the destination is registered for removal at teardown.
    pub fn stage(
        &mut self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        track: bool,
    ) -> Result<StageOutcome> {
        let source = source.as_ref();
        let destination = destination.as_ref();

        if !source.is_file() {
            return Err(Error::MissingArtifact {
                path: source.to_path_buf(),
            });
        }
        if destination.is_dir() {
            return Err(Error::Config(format!(
                "staging destination {} is a directory",
                destination.display()
            )));
        }

        if destination.exists() && same_content(source, destination)? {
            tracing::debug!(source = ?source, destination = ?destination, "same");
            return Ok(StageOutcome::Unchanged);
        }

        tracing::debug!(source = ?source, destination = ?destination, "copy");
        std::fs::copy(source, destination)?;

        self.staged.push(StagedArtifact {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            owned: track,
        });
        Ok(StageOutcome::Copied)
    }

    /// Stages `source` into `dir`, keeping its file name.
    pub fn stage_into(
        &mut self,
        source: impl AsRef<Path>,
        dir: impl AsRef<Path>,
        track: bool,
    ) -> Result<StageOutcome> {
        let source = source.as_ref();
        let file_name = source.file_name().ok_or_else(|| Error::MissingArtifact {
            path: source.to_path_buf(),
        })?;
        let destination = dir.as_ref().join(file_name);
        self.stage(source, destination, track)
    }

    /// Returns every copy made so far, in staging order.
    pub fn staged(&self) -> &[StagedArtifact] {
        &self.staged
    }

    /// Returns the destinations that will be removed at teardown.
    pub fn tracked(&self) -> impl Iterator<Item = &Path> {
        self.staged
            .iter()
            .filter(|a| a.owned)
            .map(|a| a.destination.as_path())
    }

    /// Removes every tracked destination still present, in staging order.
    ///
    /// Failures are logged and reported but never stop the pass.
    pub fn cleanup_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for artifact in self.staged.iter().filter(|a| a.owned) {
            let path = &artifact.destination;
            if !path.is_file() {
                continue;
            }

            tracing::debug!(path = ?path, "kill");
            match std::fs::remove_file(path) {
                Ok(()) => report.removed.push(path.clone()),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "failed to remove staged file");
                    report.failures.push((path.clone(), e.to_string()));
                }
            }
        }

        self.staged.retain(|a| !a.owned);
        report
    }
}

/// Creates `dir` and any missing parents.
pub fn create_target_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        tracing::debug!(dir = ?dir, "mkdir");
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    if std::fs::metadata(a)?.len() != std::fs::metadata(b)?.len() {
        return Ok(false);
    }

    let mut left = BufReader::new(File::open(a)?);
    let mut right = BufReader::new(File::open(b)?);
    let mut left_buf = [0u8; 8192];
    let mut right_buf = [0u8; 8192];

    loop {
        let n = left.read(&mut left_buf)?;
        if n == 0 {
            return Ok(true);
        }
        right.read_exact(&mut right_buf[..n])?;
        if left_buf[..n] != right_buf[..n] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).expect("failed to write file");
        path
    }

    #[test]
    fn stage_copies_when_destination_missing() {
        let dir = TempDir::new().unwrap();
        let src = write(&dir, "svn.exe", "binary");
        let dst = dir.path().join("out.exe");

        let mut stager = ArtifactStager::new();
        let outcome = stager.stage(&src, &dst, true).unwrap();

        assert_eq!(outcome, StageOutcome::Copied);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "binary");
        assert_eq!(stager.tracked().collect::<Vec<_>>(), vec![dst.as_path()]);
    }

    #[test]
    fn stage_skips_identical_destination() {
        let dir = TempDir::new().unwrap();
        let src = write(&dir, "a.dll", "same bytes");
        let dst = write(&dir, "b.dll", "same bytes");
        let before = std::fs::metadata(&dst).unwrap().modified().unwrap();

        let mut stager = ArtifactStager::new();
        let outcome = stager.stage(&src, &dst, true).unwrap();

        assert_eq!(outcome, StageOutcome::Unchanged);
        assert!(stager.staged().is_empty());
        assert_eq!(
            std::fs::metadata(&dst).unwrap().modified().unwrap(),
            before
        );
    }

    #[test]
    fn stage_overwrites_same_length_different_content() {
        let dir = TempDir::new().unwrap();
        let src = write(&dir, "a.dll", "version-2");
        let dst = write(&dir, "b.dll", "version-1");

        let mut stager = ArtifactStager::new();
        let outcome = stager.stage(&src, &dst, true).unwrap();

        assert_eq!(outcome, StageOutcome::Copied);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "version-2");
        assert_eq!(stager.tracked().count(), 1);
    }

    #[test]
    fn untracked_copies_survive_cleanup() {
        let dir = TempDir::new().unwrap();
        let src = write(&dir, "libsvn_subr-1.dll", "lib");
        let out = TempDir::new().unwrap();

        let mut stager = ArtifactStager::new();
        stager.stage_into(&src, out.path(), false).unwrap();
        let report = stager.cleanup_all();

        assert!(report.removed.is_empty());
        assert!(out.path().join("libsvn_subr-1.dll").exists());
        assert_eq!(stager.staged().len(), 1);
    }

    #[test]
    fn missing_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut stager = ArtifactStager::new();

        let err = stager
            .stage(dir.path().join("nope.exe"), dir.path().join("x"), true)
            .unwrap_err();
        assert!(matches!(err, Error::MissingArtifact { .. }));
    }

    #[test]
    fn directory_destination_is_rejected() {
        let dir = TempDir::new().unwrap();
        let src = write(&dir, "a.exe", "x");
        let mut stager = ArtifactStager::new();

        assert!(stager.stage(&src, dir.path(), true).is_err());
    }

    #[test]
    fn cleanup_removes_tracked_files_and_skips_vanished_ones() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let a = write(&dir, "a-test.exe", "a");
        let b = write(&dir, "b-test.exe", "b");

        let mut stager = ArtifactStager::new();
        stager.stage_into(&a, out.path(), true).unwrap();
        stager.stage_into(&b, out.path(), true).unwrap();
        std::fs::remove_file(out.path().join("a-test.exe")).unwrap();

        let report = stager.cleanup_all();

        assert_eq!(report.removed, vec![out.path().join("b-test.exe")]);
        assert!(report.failures.is_empty());
        assert!(!out.path().join("b-test.exe").exists());
        assert_eq!(stager.tracked().count(), 0);

        // A second pass has nothing left to do.
        assert!(stager.cleanup_all().removed.is_empty());
    }

    #[test]
    fn create_target_dir_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("subversion/tests/cmdline");

        create_target_dir(&nested).unwrap();
        create_target_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
