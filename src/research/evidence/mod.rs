//! Evidence ledger: unified constants and facts for research context.
//!
//! Constants come from chunk metadata (implicitly definite); facts are
//! extracted by the LLM from file clusters. The ledger cross-references
//! facts by the entities they mention, flags heuristic conflicts, renders
//! prompt context at several compression tiers, and emits the `## Evidence`
//! section of the final report.

mod extract;
mod ledger;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use extract::{FactExtraction, extract_facts_with_clustering};
pub use ledger::EvidenceLedger;

/// Confidence labels for extracted facts.
///
/// Categorical rather than numeric because LLMs are unreliable at numeric
/// confidence estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    /// Explicitly stated, directly verifiable.
    Definite,
    /// Strongly implied by patterns or structure.
    Likely,
    /// Reasonable inference from context.
    Inferred,
    /// Possible interpretation, needs verification.
    Uncertain,
}

impl ConfidenceLevel {
    /// Three-letter tag used in compact fact rendering.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Definite => "DEF",
            Self::Likely => "LIK",
            Self::Inferred => "INF",
            Self::Uncertain => "UNC",
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Definite => "definite",
            Self::Likely => "likely",
            Self::Inferred => "inferred",
            Self::Uncertain => "uncertain",
        }
    }

    /// Parses a lowercase label.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "definite" => Some(Self::Definite),
            "likely" => Some(Self::Likely),
            "inferred" => Some(Self::Inferred),
            "uncertain" => Some(Self::Uncertain),
            _ => None,
        }
    }
}

/// A constant captured from chunk metadata.
///
/// Constants carry implicit definite confidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantEntry {
    /// Constant name.
    pub name: String,
    /// Declaring file.
    pub file_path: String,
    /// Literal value when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Declared or inferred type.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub type_name: Option<String>,
}

impl ConstantEntry {
    /// Dedup key: `"{file_path}:{name}"`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.file_path, self.name)
    }
}

/// An atomic fact with source provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactEntry {
    /// Deterministic id; see [`FactEntry::generate_id`].
    pub fact_id: String,
    /// One verifiable claim (≤ 100 chars).
    pub statement: String,
    /// Source file.
    pub file_path: String,
    /// Line range start.
    pub start_line: u32,
    /// Line range end.
    pub end_line: u32,
    /// LLM-determined category (architecture, behavior, ...).
    pub category: String,
    /// Confidence label.
    pub confidence: ConfidenceLevel,
    /// Code entities the statement references.
    pub entities: Vec<String>,
    /// Cluster that extracted this fact.
    pub cluster_id: usize,
}

impl FactEntry {
    /// Deterministic 12-hex-char fact id from content and location.
    #[must_use]
    pub fn generate_id(statement: &str, file_path: &str, start_line: u32, end_line: u32) -> String {
        let content = format!("{statement}:{file_path}:{start_line}-{end_line}");
        let digest = Sha256::digest(content.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..12].to_string()
    }
}

/// Maps a normalized entity name to the facts that reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLink {
    /// Entity name with original casing.
    pub entity_name: String,
    /// Ids of facts referencing this entity.
    pub fact_ids: Vec<String>,
}

/// A detected conflict between two facts about the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactConflict {
    /// First fact id.
    pub fact_id_a: String,
    /// Second fact id.
    pub fact_id_b: String,
    /// Why they conflict.
    pub reason: String,
}
