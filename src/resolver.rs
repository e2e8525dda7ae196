//! Resolution of user test references into an execution plan.
//!
//! A reference is `<name>[#<subtests>]`. The name matches a catalog entry
//! by its final path segment, or by that segment with the 9-character
//! `-test.exe` / `_tests.py` suffix removed.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{Error, Result};
use crate::manifest::{Catalog, TestCatalogEntry};

/// Suffixes that mark a name as a full test file name.
pub const RECOGNIZED_SUFFIXES: &[&str] = &["-test.exe", "_tests.py"];

/// Length of every recognized suffix.
pub const STRIPPED_SUFFIX_LEN: usize = 9;

/// The numbered cases to run within one test program.
///
/// Keeps the user's order and repeats; the raw text is what gets
/// forwarded to the harness. Ranges are kept as written and only expanded
/// on iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtestSet {
    raw: String,
    ranges: Vec<RangeInclusive<u32>>,
}

impl SubtestSet {
    /// Iterates the case numbers in user order.
    pub fn numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().cloned().flatten()
    }

    /// Returns the parts as inclusive ranges; a single case is `n..=n`.
    pub fn ranges(&self) -> &[RangeInclusive<u32>] {
        &self.ranges
    }

    /// Returns how many cases the set names, repeats included.
    pub fn case_count(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| u64::from(*r.end() - *r.start()) + 1)
            .sum()
    }

    /// Returns the text as the user wrote it.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for SubtestSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidSubtestSet(s.to_string());
        let mut ranges = Vec::new();

        for part in s.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.trim().parse().map_err(|_| invalid())?;
                    let hi: u32 = hi.trim().parse().map_err(|_| invalid())?;
                    if hi < lo {
                        return Err(invalid());
                    }
                    ranges.push(lo..=hi);
                }
                None => {
                    let n: u32 = part.parse().map_err(|_| invalid())?;
                    ranges.push(n..=n);
                }
            }
        }

        Ok(Self {
            raw: s.to_string(),
            ranges,
        })
    }
}

impl fmt::Display for SubtestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A parsed user test reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSpecifier {
    pub name: String,
    pub subtests: Option<SubtestSet>,
}

impl FromStr for TestSpecifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('#') {
            Some((name, subtests)) => Ok(Self {
                name: name.to_string(),
                subtests: Some(subtests.parse()?),
            }),
            None => Ok(Self {
                name: s.to_string(),
                subtests: None,
            }),
        }
    }
}

impl TestSpecifier {
    fn has_recognized_suffix(&self) -> bool {
        RECOGNIZED_SUFFIXES
            .iter()
            .any(|suffix| self.name.ends_with(suffix))
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub test: TestCatalogEntry,
    pub subtests: Option<SubtestSet>,
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subtests {
            Some(subtests) => write!(f, "{}#{}", self.test.path(), subtests),
            None => f.write_str(self.test.path()),
        }
    }
}

impl Serialize for PlanEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The ordered list of tests handed to the harness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    entries: Vec<PlanEntry>,
}

impl ExecutionPlan {
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders every entry as `path[#subtests]`.
    pub fn to_args(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }

    fn push(&mut self, test: &TestCatalogEntry, subtests: Option<SubtestSet>) {
        self.entries.push(PlanEntry {
            test: test.clone(),
            subtests,
        });
    }
}

/// A plan together with the warnings produced while resolving it.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub plan: ExecutionPlan,
    pub warnings: Vec<String>,
}

/// Resolves raw test references against the catalog.
///
/// An empty reference list selects the whole catalog. References that
/// match nothing, or carry a malformed `#` suffix, are skipped with a
/// warning.
pub fn resolve<S: AsRef<str>>(specifiers: &[S], catalog: &Catalog) -> Resolution {
    let mut resolution = Resolution::default();

    if specifiers.is_empty() {
        for entry in catalog.entries() {
            resolution.plan.push(entry, None);
        }
        return resolution;
    }

    for raw in specifiers {
        let raw = raw.as_ref();
        let specifier = match raw.parse::<TestSpecifier>() {
            Ok(specifier) => specifier,
            Err(e) => {
                tracing::warn!(specifier = %raw, error = %e, "skipping test");
                resolution
                    .warnings
                    .push(format!("Skipping test '{}', {}.", raw, e));
                continue;
            }
        };

        let matches = find_matches(&specifier, catalog);
        if matches.is_empty() {
            tracing::warn!(test = %specifier.name, "skipping test, test not found");
            resolution.warnings.push(format!(
                "Skipping test '{}', test not found.",
                specifier.name
            ));
            continue;
        }

        if matches.len() > 1 && specifier.subtests.is_some() {
            tracing::warn!(
                test = %specifier.name,
                matches = matches.len(),
                first = %matches[0].path(),
                "ambiguous test name, subtests apply to the first match only"
            );
        }

        let mut subtests = specifier.subtests;
        for entry in matches {
            resolution.plan.push(entry, subtests.take());
        }
    }

    resolution
}

fn find_matches<'a>(specifier: &TestSpecifier, catalog: &'a Catalog) -> Vec<&'a TestCatalogEntry> {
    let exact: Vec<_> = catalog
        .entries()
        .iter()
        .filter(|entry| entry.file_name() == specifier.name)
        .collect();

    if !exact.is_empty() || specifier.has_recognized_suffix() {
        return exact;
    }

    catalog
        .entries()
        .iter()
        .filter(|entry| strip_suffix(entry.file_name()) == specifier.name)
        .collect()
}

fn strip_suffix(file_name: &str) -> &str {
    file_name
        .len()
        .checked_sub(STRIPPED_SUFFIX_LEN)
        .and_then(|end| file_name.get(..end))
        .unwrap_or("")
}
