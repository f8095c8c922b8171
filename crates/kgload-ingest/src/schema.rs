//! Versioned column layouts of the upstream dump
//!
//! Every source file has one fixed column order per [`SchemaVersion`]. The
//! layouts are an external contract with the data producer; the loader only
//! uses them to validate width and to address fields by name.

use kgload_common::{FileKind, SchemaVersion};

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Key or foreign key; always loaded as a string
    Identifier,
    /// Free text
    Text,
    Integer,
    /// Scores and distances
    Decimal,
    /// Small closed vocabularies (semantic types, section names, ...)
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn col(name: &'static str, ty: FieldType) -> Column {
    Column { name, ty }
}

use FieldType::{Category, Decimal, Identifier, Integer, Text};

/// Column layout of one file kind at one schema version
#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub kind: FileKind,
    /// Node label the rows are merged into
    pub label: &'static str,
    /// Merge key column
    pub key: &'static str,
    pub columns: &'static [Column],
}

impl TableSchema {
    pub fn for_kind(kind: FileKind, version: SchemaVersion) -> &'static TableSchema {
        match (kind, version) {
            (FileKind::Citation, _) => &CITATION,
            (FileKind::Sentence, SchemaVersion::V1) => &SENTENCE_V1,
            (FileKind::Sentence, SchemaVersion::V2) => &SENTENCE_V2,
            (FileKind::Entity, _) => &ENTITY,
            (FileKind::Predication, SchemaVersion::V1) => &PREDICATION_V1,
            (FileKind::Predication, SchemaVersion::V2) => &PREDICATION_V2,
            (FileKind::PredicationAux, _) => &PREDICATION_AUX,
            (FileKind::GenericConcept, _) => &GENERIC_CONCEPT,
        }
    }

    /// Declared column count
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    pub fn key_index(&self) -> usize {
        // Every layout below declares its key column.
        self.index_of(self.key).unwrap_or(0)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

static CITATION: TableSchema = TableSchema {
    kind: FileKind::Citation,
    label: "Citation",
    key: "pmid",
    columns: &[
        col("pmid", Identifier),
        col("issn", Text),
        col("dp", Text),
        col("edat", Text),
        col("pyear", Integer),
    ],
};

static SENTENCE_V1: TableSchema = TableSchema {
    kind: FileKind::Sentence,
    label: "Sentence",
    key: "sentence_id",
    columns: &[
        col("sentence_id", Identifier),
        col("pmid", Identifier),
        col("type", Category),
        col("number", Integer),
        col("sent_start_index", Integer),
        col("sent_end_index", Integer),
        col("section_header", Text),
        col("normalized_section_header", Category),
        col("sentence", Text),
    ],
};

static SENTENCE_V2: TableSchema = TableSchema {
    kind: FileKind::Sentence,
    label: "Sentence",
    key: "sentence_id",
    columns: &[
        col("sentence_id", Identifier),
        col("pmid", Identifier),
        col("type", Category),
        col("number", Integer),
        col("sent_start_index", Integer),
        col("sentence", Text),
        col("sent_end_index", Integer),
        col("section_header", Text),
        col("normalized_section_header", Category),
    ],
};

static ENTITY: TableSchema = TableSchema {
    kind: FileKind::Entity,
    label: "Entity",
    key: "entity_id",
    columns: &[
        col("entity_id", Identifier),
        col("sentence_id", Identifier),
        col("cui", Identifier),
        col("name", Text),
        col("type", Category),
        col("gene_id", Text),
        col("gene_name", Text),
        col("text", Text),
        col("start_index", Integer),
        col("end_index", Integer),
        col("score", Decimal),
    ],
};

static PREDICATION_V1: TableSchema = TableSchema {
    kind: FileKind::Predication,
    label: "Predication",
    key: "predication_id",
    columns: &[
        col("predication_id", Identifier),
        col("sentence_id", Identifier),
        col("pmid", Identifier),
        col("predicate", Category),
        col("subject_cui", Identifier),
        col("subject_name", Text),
        col("subject_semtype", Category),
        col("subject_novelty", Integer),
        col("object_cui", Identifier),
        col("object_name", Text),
        col("object_semtype", Category),
        col("object_novelty", Integer),
    ],
};

static PREDICATION_V2: TableSchema = TableSchema {
    kind: FileKind::Predication,
    label: "Predication",
    key: "predication_id",
    columns: &[
        col("predication_id", Identifier),
        col("sentence_id", Identifier),
        col("pmid", Identifier),
        col("predicate", Category),
        col("subject_cui", Identifier),
        col("subject_name", Text),
        col("subject_semtype", Category),
        col("subject_novelty", Integer),
        col("object_cui", Identifier),
        col("object_name", Text),
        col("object_semtype", Category),
        col("object_novelty", Integer),
        col("fact_value", Category),
        col("mod_scale", Category),
        col("mod_value", Decimal),
    ],
};

static PREDICATION_AUX: TableSchema = TableSchema {
    kind: FileKind::PredicationAux,
    label: "PredicationAux",
    key: "predication_aux_id",
    columns: &[
        col("predication_aux_id", Identifier),
        col("predication_id", Identifier),
        col("subject_text", Text),
        col("subject_dist", Integer),
        col("subject_maxdist", Integer),
        col("subject_start_index", Integer),
        col("subject_end_index", Integer),
        col("subject_score", Decimal),
        col("indicator_type", Category),
        col("predicate_start_index", Integer),
        col("predicate_end_index", Integer),
        col("object_text", Text),
        col("object_dist", Integer),
        col("object_maxdist", Integer),
        col("object_start_index", Integer),
        col("object_end_index", Integer),
        col("object_score", Decimal),
        col("curr_timestamp", Text),
    ],
};

static GENERIC_CONCEPT: TableSchema = TableSchema {
    kind: FileKind::GenericConcept,
    label: "GenericConcept",
    key: "concept_id",
    columns: &[
        col("concept_id", Identifier),
        col("cui", Identifier),
        col("preferred_name", Text),
    ],
};
