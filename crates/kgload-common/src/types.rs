//! Pipeline vocabulary shared by the loader library and its binary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

// ============================================================================
// Stages
// ============================================================================

/// A pipeline phase.
///
/// Jobs inside one stage have no ordering dependency on each other; every job
/// of a stage must be terminal before the next stage starts. The variant order
/// is the data-dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Uniqueness constraints and indexes
    Constraints,
    /// Nodes that reference nothing (citations, generic concepts)
    IndependentEntities,
    /// Nodes whose rows carry identifiers of other nodes
    DependentEntities,
    /// Edges, which require both endpoints to exist
    Relationships,
}

impl StageName {
    /// Every stage, in dependency order
    pub const ALL: [StageName; 4] = [
        StageName::Constraints,
        StageName::IndependentEntities,
        StageName::DependentEntities,
        StageName::Relationships,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Constraints => "constraints",
            StageName::IndependentEntities => "independent_entities",
            StageName::DependentEntities => "dependent_entities",
            StageName::Relationships => "relationships",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "constraints" | "indexes" => Ok(StageName::Constraints),
            "independent_entities" | "independent" => Ok(StageName::IndependentEntities),
            "dependent_entities" | "dependent" => Ok(StageName::DependentEntities),
            "relationships" | "edges" => Ok(StageName::Relationships),
            _ => Err(CommonError::UnknownStage(s.to_string())),
        }
    }
}

// ============================================================================
// Job status
// ============================================================================

/// Lifecycle of a load job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    /// A batch failed and is waiting out its backoff
    Retrying,
    Succeeded,
    Failed,
    /// Aborted by an operator interrupt
    Cancelled,
    /// Never started (blocked stage or missing source file)
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Source files
// ============================================================================

/// One conceptual schema per delimited input file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Citation,
    Sentence,
    Entity,
    Predication,
    PredicationAux,
    GenericConcept,
}

impl FileKind {
    pub const ALL: [FileKind; 6] = [
        FileKind::Citation,
        FileKind::Sentence,
        FileKind::Entity,
        FileKind::Predication,
        FileKind::PredicationAux,
        FileKind::GenericConcept,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Citation => "citation",
            FileKind::Sentence => "sentence",
            FileKind::Entity => "entity",
            FileKind::Predication => "predication",
            FileKind::PredicationAux => "predication_aux",
            FileKind::GenericConcept => "generic_concept",
        }
    }

    /// File name looked up inside the data directory.
    ///
    /// A `.gz` sibling of the same name is accepted as well.
    pub fn default_file_name(&self) -> &'static str {
        match self {
            FileKind::Citation => "citations.csv",
            FileKind::Sentence => "sentences.csv",
            FileKind::Entity => "entity.csv",
            FileKind::Predication => "predications.csv",
            FileKind::PredicationAux => "predication_aux.csv",
            FileKind::GenericConcept => "generic_concept.csv",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "citation" | "citations" => Ok(FileKind::Citation),
            "sentence" | "sentences" => Ok(FileKind::Sentence),
            "entity" | "entities" => Ok(FileKind::Entity),
            "predication" | "predications" => Ok(FileKind::Predication),
            "predication_aux" => Ok(FileKind::PredicationAux),
            "generic_concept" | "generic_concepts" => Ok(FileKind::GenericConcept),
            _ => Err(CommonError::UnknownFileKind(s.to_string())),
        }
    }
}

// ============================================================================
// Schema versions
// ============================================================================

/// Column-layout revision of the upstream dump.
///
/// Always supplied explicitly; never guessed from file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// Layout consumed by the first loader generation
    #[default]
    V1,
    /// Later dump layout (sentence text moved, predication modality columns)
    V2,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::V1 => write!(f, "v1"),
            SchemaVersion::V2 => write!(f, "v2"),
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "v1" | "1" => Ok(SchemaVersion::V1),
            "v2" | "2" => Ok(SchemaVersion::V2),
            _ => Err(CommonError::UnknownSchemaVersion(s.to_string())),
        }
    }
}
