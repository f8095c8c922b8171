//! Pre-flight referential consistency check
//!
//! Every declared file is streamed exactly once; the identifiers of its key
//! column, of every column it uses to reference another file, and of every
//! column other files reference are collected into [`IdentifierSet`]s. A
//! reference whose identifiers are not all present in the target column
//! (the target file's key column unless stated otherwise) produces a
//! [`ConsistencyWarning`].
//!
//! The check is advisory. Loads match endpoints by key, so orphans are simply
//! not linked; the report only surfaces gross data-quality problems before any
//! write traffic reaches the store.

use kgload_common::FileKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::error::{LoadError, Result};
use crate::reader::{csv_reader, next_raw_row, SourceFormat};
use crate::sanitize::clean_field;

/// Offending identifiers kept per warning
pub const SAMPLE_SIZE: usize = 5;

/// Name of a declared input file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        FileId(s.to_string())
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        FileId(s)
    }
}

impl From<FileKind> for FileId {
    fn from(kind: FileKind) -> Self {
        FileId(kind.as_str().to_string())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifiers in `column` must exist in `target_column` of `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub target: FileId,
    pub column: usize,
    /// Defaults to the target's key column
    pub target_column: Option<usize>,
}

/// One file taking part in the check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: PathBuf,
    pub key_column: usize,
    pub references: Vec<Reference>,
}

impl FileSpec {
    pub fn new(path: impl Into<PathBuf>, key_column: usize) -> Self {
        Self {
            path: path.into(),
            key_column,
            references: Vec::new(),
        }
    }

    /// Declare that this file's key column references `target`
    pub fn depends_on(self, target: impl Into<FileId>) -> Self {
        let column = self.key_column;
        self.references(target, column)
    }

    /// Declare that `column` of this file references the key of `target`
    pub fn references(mut self, target: impl Into<FileId>, column: usize) -> Self {
        self.references.push(Reference {
            target: target.into(),
            column,
            target_column: None,
        });
        self
    }

    /// Declare that `column` of this file references `target_column` of `target`
    pub fn references_column(
        mut self,
        target: impl Into<FileId>,
        column: usize,
        target_column: usize,
    ) -> Self {
        self.references.push(Reference {
            target: target.into(),
            column,
            target_column: Some(target_column),
        });
        self
    }

    fn columns(&self) -> BTreeSet<usize> {
        std::iter::once(self.key_column)
            .chain(self.references.iter().map(|r| r.column))
            .collect()
    }
}

/// Non-key columns of `id` that other files reference
fn referenced_columns(file_specs: &BTreeMap<FileId, FileSpec>, id: &FileId) -> BTreeSet<usize> {
    file_specs
        .values()
        .flat_map(|spec| &spec.references)
        .filter(|r| &r.target == id)
        .filter_map(|r| r.target_column)
        .collect()
}

/// Distinct identifiers of one column of one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierSet {
    ids: HashSet<String>,
}

impl IdentifierSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Identifiers of `self` absent from `other`, sorted
    pub fn missing_from(&self, other: &IdentifierSet) -> BTreeSet<String> {
        self.ids
            .iter()
            .filter(|id| !other.contains(id))
            .cloned()
            .collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for IdentifierSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }
}

/// Dangling references from `dependent` into `referenced`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyWarning {
    pub dependent: FileId,
    pub referenced: FileId,
    pub column: usize,
    pub missing_count: usize,
    /// First few offending identifiers in sorted order
    pub sample: Vec<String>,
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: {} identifiers missing (e.g. {})",
            self.dependent,
            self.referenced,
            self.missing_count,
            self.sample.join(", ")
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    /// Missing identifiers per (dependent, referenced) pair
    #[serde(skip)]
    pub missing: BTreeMap<(FileId, FileId), BTreeSet<String>>,
    /// Distinct key identifiers per file
    pub identifier_counts: BTreeMap<FileId, usize>,
    /// Unparseable or too-short lines per file
    pub malformed_lines: BTreeMap<FileId, u64>,
    pub warnings: Vec<ConsistencyWarning>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Check consistency of comma-delimited files without headers
pub fn check_consistency(file_specs: &BTreeMap<FileId, FileSpec>) -> Result<ConsistencyReport> {
    check_consistency_with(file_specs, &SourceFormat::default())
}

#[instrument(skip_all, fields(files = file_specs.len()))]
pub fn check_consistency_with(
    file_specs: &BTreeMap<FileId, FileSpec>,
    format: &SourceFormat,
) -> Result<ConsistencyReport> {
    for (id, spec) in file_specs {
        if let Some(reference) = spec.references.iter().find(|r| !file_specs.contains_key(&r.target)) {
            return Err(LoadError::config(format!(
                "{id} references undeclared file {}",
                reference.target
            )));
        }
    }

    let mut report = ConsistencyReport::default();
    let mut sets: BTreeMap<FileId, HashMap<usize, IdentifierSet>> = BTreeMap::new();

    for (id, spec) in file_specs {
        let mut wanted = spec.columns();
        wanted.extend(referenced_columns(file_specs, id));
        let (columns, malformed) = collect_identifiers(&spec.path, &wanted, format)?;
        let key_count = columns.get(&spec.key_column).map_or(0, IdentifierSet::len);
        info!(file = %id, identifiers = key_count, malformed, "Collected identifiers");
        report.identifier_counts.insert(id.clone(), key_count);
        if malformed > 0 {
            report.malformed_lines.insert(id.clone(), malformed);
        }
        sets.insert(id.clone(), columns);
    }

    let empty = IdentifierSet::default();
    for (id, spec) in file_specs {
        for reference in &spec.references {
            let current = sets
                .get(id)
                .and_then(|c| c.get(&reference.column))
                .unwrap_or(&empty);
            let related = file_specs
                .get(&reference.target)
                .and_then(|target| {
                    let column = reference.target_column.unwrap_or(target.key_column);
                    sets.get(&reference.target).and_then(|c| c.get(&column))
                })
                .unwrap_or(&empty);

            let missing = current.missing_from(related);
            if !missing.is_empty() {
                let warning = ConsistencyWarning {
                    dependent: id.clone(),
                    referenced: reference.target.clone(),
                    column: reference.column,
                    missing_count: missing.len(),
                    sample: missing.iter().take(SAMPLE_SIZE).cloned().collect(),
                };
                warn!(
                    dependent = %warning.dependent,
                    referenced = %warning.referenced,
                    missing = warning.missing_count,
                    sample = ?warning.sample,
                    "Dangling references"
                );
                report.warnings.push(warning);
            }
            report
                .missing
                .insert((id.clone(), reference.target.clone()), missing);
        }
    }

    Ok(report)
}

/// One streaming pass over `path`, collecting every wanted column
fn collect_identifiers(
    path: &Path,
    wanted: &BTreeSet<usize>,
    format: &SourceFormat,
) -> Result<(HashMap<usize, IdentifierSet>, u64)> {
    let mut reader = csv_reader(path, format)?;
    let mut buf = csv::ByteRecord::new();
    let mut malformed = 0u64;
    let mut columns: HashMap<usize, IdentifierSet> =
        wanted.iter().map(|&c| (c, IdentifierSet::default())).collect();

    while next_raw_row(&mut reader, &mut buf, &mut malformed)? {
        let Some(&last) = wanted.last() else { break };
        if buf.len() <= last {
            if buf.iter().any(|f| !f.is_empty()) {
                malformed += 1;
            }
            continue;
        }
        for (&column, set) in columns.iter_mut() {
            let raw = String::from_utf8_lossy(buf.get(column).unwrap_or_default());
            let id = clean_field(&raw);
            if !id.is_empty() {
                set.ids.insert(id);
            }
        }
    }

    Ok((columns, malformed))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_missing_identifier_detected() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.csv", "1\n2\n3\n");
        let b = write(&dir, "b.csv", "1\n2\n");

        let specs = BTreeMap::from([
            (FileId::from("a"), FileSpec::new(a, 0).depends_on("b")),
            (FileId::from("b"), FileSpec::new(b, 0)),
        ]);
        let report = check_consistency(&specs).unwrap();

        let missing = &report.missing[&(FileId::from("a"), FileId::from("b"))];
        assert_eq!(missing, &BTreeSet::from(["3".to_string()]));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].sample, vec!["3"]);
        assert_eq!(report.identifier_counts[&FileId::from("a")], 3);
    }

    #[test]
    fn test_reference_column_and_normalized_keys() {
        let dir = TempDir::new().unwrap();
        let citations = write(&dir, "citations.csv", "0001,x\n2,y\n");
        let sentences = write(&dir, "sentences.csv", "10,1\n11,02\n12,1\n");

        let specs = BTreeMap::from([
            (FileId::from(FileKind::Citation), FileSpec::new(citations, 0)),
            (
                FileId::from(FileKind::Sentence),
                FileSpec::new(sentences, 0).references(FileKind::Citation, 1),
            ),
        ]);
        let report = check_consistency(&specs).unwrap();

        assert!(report.is_clean());
        let key = (FileId::from(FileKind::Sentence), FileId::from(FileKind::Citation));
        assert!(report.missing[&key].is_empty());
    }

    #[test]
    fn test_sample_is_bounded_and_sorted() {
        let dir = TempDir::new().unwrap();
        let body: String = (0..20).map(|i| format!("x,{i:02}\n")).collect();
        let dependent = write(&dir, "dep.csv", &body);
        let target = write(&dir, "target.csv", "99\n");

        let specs = BTreeMap::from([
            (FileId::from("dep"), FileSpec::new(dependent, 0).references("target", 1)),
            (FileId::from("target"), FileSpec::new(target, 0)),
        ]);
        let report = check_consistency(&specs).unwrap();

        let warning = &report.warnings[0];
        assert_eq!(warning.missing_count, 20);
        assert_eq!(warning.sample, vec!["0", "1", "10", "11", "12"]);
    }

    #[test]
    fn test_short_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let dependent = write(&dir, "dep.csv", "1,a\n2\n3,b\n");
        let target = write(&dir, "target.csv", "a\nb\n");

        let specs = BTreeMap::from([
            (FileId::from("dep"), FileSpec::new(dependent, 0).references("target", 1)),
            (FileId::from("target"), FileSpec::new(target, 0)),
        ]);
        let report = check_consistency(&specs).unwrap();

        assert!(report.is_clean());
        assert_eq!(report.malformed_lines[&FileId::from("dep")], 1);
        assert_eq!(report.identifier_counts[&FileId::from("dep")], 2);
    }

    #[test]
    fn test_reference_to_a_non_key_column() {
        let dir = TempDir::new().unwrap();
        let concepts = write(&dir, "concepts.csv", "1,C001,Aspirin\n2,C002,Pain\n");
        let entities = write(&dir, "entities.csv", "E1,S1,C001\nE2,S1,C002\nE3,S2,C404\n");

        let specs = BTreeMap::from([
            (FileId::from("concept"), FileSpec::new(concepts, 0)),
            (
                FileId::from("entity"),
                FileSpec::new(entities, 0).references_column("concept", 2, 1),
            ),
        ]);
        let report = check_consistency(&specs).unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].sample, vec!["C404"]);
        // Key counts are unaffected by the extra column
        assert_eq!(report.identifier_counts[&FileId::from("concept")], 2);
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let specs = BTreeMap::from([(FileId::from("a"), FileSpec::new("/nonexistent/a.csv", 0))]);
        assert!(matches!(check_consistency(&specs), Err(LoadError::Io(_))));
    }

    #[test]
    fn test_undeclared_target_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.csv", "1\n");
        let specs = BTreeMap::from([(FileId::from("a"), FileSpec::new(a, 0).depends_on("b"))]);
        assert!(matches!(check_consistency(&specs), Err(LoadError::Config(_))));
    }
}
