//! Core data models for the Docgraph extraction pipeline.
//!
//! These types represent the documents, chunks, concepts, and relationships
//! that flow through parsing, extraction, deduplication, and relationship
//! detection, plus the `PipelineResult` envelope returned to callers and
//! serialized into the content-addressed cache.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel page number for chunks produced without layout metadata
/// (plain-text fallback parsing). Real page numbers start at 1.
pub const PAGE_UNKNOWN: i64 = 0;

/// Classified document type, driving parser strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    /// Text layer present on (nearly) all pages.
    Digital,
    /// Little to no extractable text; image-based pages.
    Scanned,
    /// Mixed: some pages carry a text layer, some do not.
    Hybrid,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Digital => "digital",
            DocType::Scanned => "scanned",
            DocType::Hybrid => "hybrid",
        }
    }
}

/// An uploaded document. Immutable after creation except for `processed_at`,
/// which the orchestrator sets on pipeline completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// SHA-256 of the raw uploaded bytes; also the cache key.
    pub content_hash: String,
    pub page_count: i64,
    pub doc_type: DocType,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

impl Document {
    pub fn new(content_hash: impl Into<String>, page_count: i64, doc_type: DocType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content_hash: content_hash.into(),
            page_count,
            doc_type,
            created_at: Utc::now().timestamp(),
            processed_at: None,
        }
    }
}

/// A bounded, possibly overlapping window of document text, the unit of
/// extraction work. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Character offsets into the concatenated document text.
    pub start_offset: i64,
    pub end_offset: i64,
    /// Source page of the chunk's first character, or [`PAGE_UNKNOWN`].
    pub page_number: i64,
    /// SHA-256 of the chunk text.
    pub hash: String,
}

/// A domain concept proposed by the ensemble extractor.
///
/// Concepts are merged, never deleted: a superseded concept keeps its row
/// with `merged_into` pointing at the canonical survivor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub term: String,
    pub definition: String,
    /// Ensemble confidence in `[0, 1]`. Merging never decreases this.
    pub confidence: f64,
    /// Names of the extraction methods that independently proposed the term.
    pub methods_found: BTreeSet<String>,
    /// Originating chunk ids (one-to-many).
    pub chunk_ids: Vec<String>,
    /// Page of first occurrence.
    pub page_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Set when this concept was merged into a canonical duplicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<String>,
    pub created_at: i64,
}

impl Concept {
    pub fn new(term: impl Into<String>, definition: impl Into<String>, page_number: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            term: term.into(),
            definition: definition.into(),
            confidence: 0.0,
            methods_found: BTreeSet::new(),
            chunk_ids: Vec::new(),
            page_number,
            embedding: None,
            merged_into: None,
            created_at: Utc::now().timestamp(),
        }
    }

    /// A concept is canonical unless it has been merged into another.
    pub fn is_canonical(&self) -> bool {
        self.merged_into.is_none()
    }

    /// Case-insensitive, whitespace-collapsed form used for term matching.
    pub fn normalized_term(&self) -> String {
        normalize_term(&self.term)
    }
}

/// Normalize a term for matching: lowercase and collapse internal whitespace.
pub fn normalize_term(term: &str) -> String {
    term.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fixed relationship vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationKind {
    Prerequisite,
    PartOf,
    LeadsTo,
    AppliesTo,
    ContrastsWith,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Prerequisite => "prerequisite",
            RelationKind::PartOf => "part-of",
            RelationKind::LeadsTo => "leads-to",
            RelationKind::AppliesTo => "applies-to",
            RelationKind::ContrastsWith => "contrasts-with",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "prerequisite" => Some(RelationKind::Prerequisite),
            "part-of" => Some(RelationKind::PartOf),
            "leads-to" => Some(RelationKind::LeadsTo),
            "applies-to" => Some(RelationKind::AppliesTo),
            "contrasts-with" => Some(RelationKind::ContrastsWith),
            _ => None,
        }
    }

    /// Structural category implied by the kind.
    pub fn structural(&self) -> Structural {
        match self {
            RelationKind::PartOf => Structural::Hierarchical,
            RelationKind::Prerequisite | RelationKind::LeadsTo => Structural::Sequential,
            RelationKind::AppliesTo | RelationKind::ContrastsWith => Structural::Unclassified,
        }
    }
}

/// Structural category of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Structural {
    Hierarchical,
    Sequential,
    Unclassified,
}

impl Structural {
    pub fn as_str(&self) -> &'static str {
        match self {
            Structural::Hierarchical => "hierarchical",
            Structural::Sequential => "sequential",
            Structural::Unclassified => "unclassified",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "hierarchical" => Structural::Hierarchical,
            "sequential" => Structural::Sequential,
            _ => Structural::Unclassified,
        }
    }
}

/// A typed, directed edge between two canonical concepts.
/// At most one relationship exists per ordered pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_concept: String,
    pub to_concept: String,
    pub kind: RelationKind,
    /// Blend of embedding similarity and model confidence, in `[0, 1]`.
    pub strength: f64,
    pub structural: Structural,
}

impl Relationship {
    pub fn new(
        from_concept: impl Into<String>,
        to_concept: impl Into<String>,
        kind: RelationKind,
        strength: f64,
        structural: Structural,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_concept: from_concept.into(),
            to_concept: to_concept.into(),
            kind,
            strength: strength.clamp(0.0, 1.0),
            structural,
        }
    }
}

/// One append-only record per external-service call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    pub document_id: String,
    pub service: String,
    pub input_units: i64,
    pub output_units: i64,
    pub cost: f64,
    pub created_at: i64,
}

impl CostRecord {
    pub fn new(
        document_id: impl Into<String>,
        service: impl Into<String>,
        input_units: i64,
        output_units: i64,
        cost: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            service: service.into(),
            input_units,
            output_units,
            cost,
            created_at: Utc::now().timestamp(),
        }
    }
}

/// A node in the reconstructed chapter/section tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionNode {
    pub title: String,
    pub level: u8,
    pub page_start: i64,
    pub page_end: i64,
    pub children: Vec<SectionNode>,
}

impl SectionNode {
    /// Flat root covering the whole document, used when no structural
    /// markers exist.
    pub fn flat_root(page_count: i64) -> Self {
        Self {
            title: "Document".to_string(),
            level: 0,
            page_start: 1,
            page_end: page_count.max(1),
            children: Vec::new(),
        }
    }
}

/// Orchestrator stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    CacheCheck,
    Classify,
    Parse,
    BuildHierarchy,
    ExtractConcepts,
    Deduplicate,
    DetectRelationships,
    PersistCache,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CacheCheck => "CacheCheck",
            Stage::Classify => "Classify",
            Stage::Parse => "Parse",
            Stage::BuildHierarchy => "BuildHierarchy",
            Stage::ExtractConcepts => "ExtractConcepts",
            Stage::Deduplicate => "Deduplicate",
            Stage::DetectRelationships => "DetectRelationships",
            Stage::PersistCache => "PersistCache",
            Stage::Done => "Done",
        }
    }

    /// Fractional completion reported after this stage finishes.
    pub fn fraction(&self) -> f64 {
        match self {
            Stage::CacheCheck => 0.05,
            Stage::Classify => 0.10,
            Stage::Parse => 0.25,
            Stage::BuildHierarchy => 0.30,
            Stage::ExtractConcepts => 0.65,
            Stage::Deduplicate => 0.75,
            Stage::DetectRelationships => 0.95,
            Stage::PersistCache => 0.99,
            Stage::Done => 1.0,
        }
    }
}

/// Pipeline run metrics, surfaced to callers and stored with cache entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub parse_method: String,
    pub duration_ms: i64,
    pub cache_hit: bool,
    pub total_cost: f64,
    pub duplicates_merged: i64,
    pub chunk_count: i64,
    pub enriched_chunks: i64,
}

/// The result of one pipeline run, possibly partial.
///
/// A caller always receives one of these: on fatal failure past the parse
/// stage, `stage_reached` names the failing stage and the collections hold
/// whatever completed stages produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub document_id: String,
    pub concepts: Vec<Concept>,
    pub relationships: Vec<Relationship>,
    pub hierarchy: SectionNode,
    pub stage_reached: Stage,
    pub warnings: Vec<String>,
    pub metrics: PipelineMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_term("  Virtual   Machine "), "virtual machine");
        assert_eq!(normalize_term("TCP/IP"), "tcp/ip");
    }

    #[test]
    fn relation_kind_round_trip() {
        for kind in [
            RelationKind::Prerequisite,
            RelationKind::PartOf,
            RelationKind::LeadsTo,
            RelationKind::AppliesTo,
            RelationKind::ContrastsWith,
        ] {
            assert_eq!(RelationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RelationKind::parse("related_to"), None);
    }

    #[test]
    fn relationship_strength_clamped() {
        let r = Relationship::new("a", "b", RelationKind::PartOf, 1.7, Structural::Hierarchical);
        assert_eq!(r.strength, 1.0);
    }

    #[test]
    fn stage_fractions_monotonic() {
        let stages = [
            Stage::CacheCheck,
            Stage::Classify,
            Stage::Parse,
            Stage::BuildHierarchy,
            Stage::ExtractConcepts,
            Stage::Deduplicate,
            Stage::DetectRelationships,
            Stage::PersistCache,
            Stage::Done,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].fraction() < pair[1].fraction());
        }
    }
}
