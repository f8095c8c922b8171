//! Job catalog
//!
//! The fixed set of load jobs per stage: which file feeds which merge
//! template, and which files reference which for the pre-flight check.

use kgload_common::{FileKind, SchemaVersion, StageName};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::consistency::{FileId, FileSpec};
use crate::job::LoadJob;
use crate::schema::TableSchema;
use crate::store::{LoadQuery, NodeRef, SchemaChange};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_RELATIONSHIP_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub data_dir: PathBuf,
    pub schema_version: SchemaVersion,
    pub batch_size: usize,
    pub relationship_batch_size: usize,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            schema_version: SchemaVersion::V1,
            batch_size: DEFAULT_BATCH_SIZE,
            relationship_batch_size: DEFAULT_RELATIONSHIP_BATCH_SIZE,
        }
    }
}

/// Locate the source file of `kind`, accepting a `.gz` sibling
pub fn resolve_source(data_dir: &Path, kind: FileKind) -> Option<PathBuf> {
    let plain = data_dir.join(kind.default_file_name());
    if plain.is_file() {
        return Some(plain);
    }
    let gz = data_dir.join(format!("{}.gz", kind.default_file_name()));
    gz.is_file().then_some(gz)
}

const fn node(label: &'static str, property: &'static str, column: &'static str) -> NodeRef {
    NodeRef {
        label,
        property,
        column,
    }
}

struct FileJob {
    name: &'static str,
    stage: StageName,
    kind: FileKind,
    query: LoadQuery,
}

const fn merge(
    name: &'static str,
    stage: StageName,
    kind: FileKind,
    label: &'static str,
    key: &'static str,
) -> FileJob {
    FileJob {
        name,
        stage,
        kind,
        query: LoadQuery::MergeNodes { label, key },
    }
}

const fn link(
    name: &'static str,
    kind: FileKind,
    rel_type: &'static str,
    from: NodeRef,
    to: NodeRef,
) -> FileJob {
    FileJob {
        name,
        stage: StageName::Relationships,
        kind,
        query: LoadQuery::MergeRelationships { rel_type, from, to },
    }
}

const FILE_JOBS: &[FileJob] = &[
    merge(
        "citations",
        StageName::IndependentEntities,
        FileKind::Citation,
        "Citation",
        "pmid",
    ),
    merge(
        "generic_concepts",
        StageName::IndependentEntities,
        FileKind::GenericConcept,
        "GenericConcept",
        "concept_id",
    ),
    merge(
        "sentences",
        StageName::DependentEntities,
        FileKind::Sentence,
        "Sentence",
        "sentence_id",
    ),
    merge(
        "entities",
        StageName::DependentEntities,
        FileKind::Entity,
        "Entity",
        "entity_id",
    ),
    merge(
        "predications",
        StageName::DependentEntities,
        FileKind::Predication,
        "Predication",
        "predication_id",
    ),
    merge(
        "predication_aux",
        StageName::DependentEntities,
        FileKind::PredicationAux,
        "PredicationAux",
        "predication_aux_id",
    ),
    link(
        "has_sentence",
        FileKind::Sentence,
        "HAS_SENTENCE",
        node("Citation", "pmid", "pmid"),
        node("Sentence", "sentence_id", "sentence_id"),
    ),
    link(
        "has_entity",
        FileKind::Entity,
        "HAS_ENTITY",
        node("Sentence", "sentence_id", "sentence_id"),
        node("Entity", "entity_id", "entity_id"),
    ),
    link(
        "has_predication",
        FileKind::Predication,
        "HAS_PREDICATION",
        node("Sentence", "sentence_id", "sentence_id"),
        node("Predication", "predication_id", "predication_id"),
    ),
    link(
        "has_aux",
        FileKind::PredicationAux,
        "HAS_AUX",
        node("Predication", "predication_id", "predication_id"),
        node("PredicationAux", "predication_aux_id", "predication_aux_id"),
    ),
    link(
        "instance_of",
        FileKind::Entity,
        "INSTANCE_OF",
        node("Entity", "entity_id", "entity_id"),
        node("GenericConcept", "cui", "cui"),
    ),
    // Every sentence of the predication's citation, not only its own sentence
    link(
        "belongs_to_same_citation",
        FileKind::Predication,
        "BELONGS_TO_SAME_CITATION",
        node("Sentence", "pmid", "pmid"),
        node("Predication", "predication_id", "predication_id"),
    ),
];

/// Constraints and indexes created before any data
pub fn schema_queries() -> Vec<LoadQuery> {
    let mut queries: Vec<LoadQuery> = FILE_JOBS
        .iter()
        .filter_map(|job| match job.query {
            LoadQuery::MergeNodes { label, key } => Some(LoadQuery::Schema {
                label,
                property: key,
                change: SchemaChange::Unique,
            }),
            _ => None,
        })
        .collect();
    queries.extend([
        LoadQuery::Schema {
            label: "GenericConcept",
            property: "cui",
            change: SchemaChange::Index,
        },
        LoadQuery::Schema {
            label: "Sentence",
            property: "pmid",
            change: SchemaChange::Index,
        },
    ]);
    queries
}

/// Builds the jobs of each stage from a data directory
#[derive(Debug, Clone)]
pub struct JobCatalog {
    options: CatalogOptions,
}

impl JobCatalog {
    pub fn new(options: CatalogOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    /// Node labels reported in the final store counts
    pub fn labels(&self) -> Vec<&'static str> {
        FILE_JOBS
            .iter()
            .filter_map(|job| match job.query {
                LoadQuery::MergeNodes { label, .. } => Some(label),
                _ => None,
            })
            .collect()
    }

    /// Relationship types reported in the final store counts
    pub fn relationship_types(&self) -> Vec<&'static str> {
        FILE_JOBS
            .iter()
            .filter_map(|job| match job.query {
                LoadQuery::MergeRelationships { rel_type, .. } => Some(rel_type),
                _ => None,
            })
            .collect()
    }

    /// Fresh jobs for one stage, in catalog order
    pub fn jobs_for(&self, stage: StageName) -> Vec<LoadJob> {
        if stage == StageName::Constraints {
            return vec![LoadJob::schema("constraints", schema_queries())];
        }

        FILE_JOBS
            .iter()
            .filter(|job| job.stage == stage)
            .map(|job| self.file_job(job))
            .collect()
    }

    fn file_job(&self, job: &FileJob) -> LoadJob {
        let opts = &self.options;
        match resolve_source(&opts.data_dir, job.kind) {
            Some(path) => {
                let batch_size = match job.stage {
                    StageName::Relationships => opts.relationship_batch_size,
                    _ => opts.batch_size,
                };
                LoadJob::from_file(
                    job.name,
                    job.stage,
                    path,
                    TableSchema::for_kind(job.kind, opts.schema_version),
                    job.query,
                    batch_size,
                )
            },
            None => LoadJob::missing(
                job.name,
                job.stage,
                job.kind,
                opts.data_dir.join(job.kind.default_file_name()),
                job.query,
            ),
        }
    }

    /// Cross-file references checked before loading; absent files are left out
    pub fn consistency_specs(&self) -> BTreeMap<FileId, FileSpec> {
        let opts = &self.options;
        let present: BTreeMap<FileKind, PathBuf> = FileKind::ALL
            .into_iter()
            .filter_map(|kind| resolve_source(&opts.data_dir, kind).map(|p| (kind, p)))
            .collect();

        // (dependent, column, referenced, referenced column or its key)
        let references = [
            (FileKind::Sentence, "pmid", FileKind::Citation, None),
            (FileKind::Entity, "sentence_id", FileKind::Sentence, None),
            (FileKind::Entity, "cui", FileKind::GenericConcept, Some("cui")),
            (FileKind::Predication, "sentence_id", FileKind::Sentence, None),
            (FileKind::PredicationAux, "predication_id", FileKind::Predication, None),
        ];

        let mut specs = BTreeMap::new();
        for (kind, path) in &present {
            let schema = TableSchema::for_kind(*kind, opts.schema_version);
            let mut spec = FileSpec::new(path, schema.key_index());
            for (dependent, column, target, target_column) in references {
                if dependent != *kind || !present.contains_key(&target) {
                    continue;
                }
                let Some(index) = schema.index_of(column) else {
                    continue;
                };
                let target_schema = TableSchema::for_kind(target, opts.schema_version);
                spec = match target_column.and_then(|c| target_schema.index_of(c)) {
                    Some(target_index) => spec.references_column(target, index, target_index),
                    None => spec.references(target, index),
                };
            }
            specs.insert(FileId::from(*kind), spec);
        }
        specs
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::job::JobSource;
    use std::fs;
    use tempfile::TempDir;

    fn catalog(dir: &Path) -> JobCatalog {
        JobCatalog::new(CatalogOptions {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn test_resolve_source_prefers_plain_then_gz() {
        let dir = TempDir::new().unwrap();
        assert!(resolve_source(dir.path(), FileKind::Entity).is_none());

        fs::write(dir.path().join("entity.csv.gz"), b"").unwrap();
        assert_eq!(
            resolve_source(dir.path(), FileKind::Entity).unwrap(),
            dir.path().join("entity.csv.gz")
        );

        fs::write(dir.path().join("entity.csv"), b"").unwrap();
        assert_eq!(
            resolve_source(dir.path(), FileKind::Entity).unwrap(),
            dir.path().join("entity.csv")
        );
    }

    #[test]
    fn test_constraint_stage_has_one_schema_job() {
        let dir = TempDir::new().unwrap();
        let jobs = catalog(dir.path()).jobs_for(StageName::Constraints);
        assert_eq!(jobs.len(), 1);
        match &jobs[0].source {
            JobSource::Schema(queries) => assert_eq!(queries.len(), 8),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_missing_files_become_missing_jobs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("citations.csv"), b"1,x,2000,2000,2000\n").unwrap();
        let jobs = catalog(dir.path()).jobs_for(StageName::IndependentEntities);

        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["citations", "generic_concepts"]);
        assert!(matches!(jobs[0].source, JobSource::File { .. }));
        assert_eq!(jobs[0].batch_size, DEFAULT_BATCH_SIZE);
        assert!(matches!(jobs[1].source, JobSource::Missing { .. }));
    }

    #[test]
    fn test_relationship_jobs_use_relationship_batch_size() {
        let dir = TempDir::new().unwrap();
        for kind in FileKind::ALL {
            fs::write(dir.path().join(kind.default_file_name()), b"").unwrap();
        }
        let jobs = catalog(dir.path()).jobs_for(StageName::Relationships);
        assert_eq!(jobs.len(), 6);
        assert!(jobs
            .iter()
            .all(|j| j.batch_size == DEFAULT_RELATIONSHIP_BATCH_SIZE));
        assert_eq!(jobs[4].kind_label(), "INSTANCE_OF");
        assert_eq!(jobs[5].kind_label(), "BELONGS_TO_SAME_CITATION");
    }

    #[test]
    fn test_consistency_specs_only_reference_present_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("sentences.csv"), b"").unwrap();
        fs::write(dir.path().join("entity.csv"), b"").unwrap();

        let specs = catalog(dir.path()).consistency_specs();
        assert_eq!(specs.len(), 2);

        let sentence = &specs[&FileId::from(FileKind::Sentence)];
        assert!(sentence.references.is_empty());

        let entity = &specs[&FileId::from(FileKind::Entity)];
        assert_eq!(entity.references.len(), 1);
        assert_eq!(entity.references[0].target, FileId::from(FileKind::Sentence));
        assert_eq!(entity.references[0].column, 1);
    }

    #[test]
    fn test_entity_cui_references_concept_cui() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("entity.csv"), b"").unwrap();
        fs::write(dir.path().join("generic_concept.csv"), b"").unwrap();

        let specs = catalog(dir.path()).consistency_specs();
        let entity = &specs[&FileId::from(FileKind::Entity)];
        assert_eq!(entity.references.len(), 1);
        assert_eq!(entity.references[0].target, FileId::from(FileKind::GenericConcept));
        assert_eq!(entity.references[0].column, 2);
        assert_eq!(entity.references[0].target_column, Some(1));
    }

    #[test]
    fn test_labels_cover_every_node_kind() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(dir.path());
        assert_eq!(catalog.labels().len(), 6);
        assert_eq!(catalog.relationship_types().len(), 6);
    }
}
