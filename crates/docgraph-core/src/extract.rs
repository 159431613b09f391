//! Ensemble concept extraction: method trait, majority voting, and eager
//! exact-duplicate merging.
//!
//! Each extraction method is an independent strategy producing ranked
//! `(term, score)` candidates for a chunk. The voting rule promotes a
//! candidate to a [`Concept`] only when at least `min_agreement` methods
//! propose it (under case-insensitive, whitespace-collapsed matching); its
//! confidence is the average of the contributing methods' normalized scores.
//!
//! The voting logic depends only on the [`ExtractionMethod`] interface, so
//! methods can be added or removed without touching the pipeline.

use std::collections::HashMap;

use crate::chunk::split_sentences;
use crate::models::{normalize_term, Chunk, Concept};

/// A candidate term with a method-local score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub term: String,
    pub score: f64,
}

impl Candidate {
    pub fn new(term: impl Into<String>, score: f64) -> Self {
        Self {
            term: term.into(),
            score,
        }
    }
}

/// A local term-extraction strategy.
///
/// Implementations are pure functions over chunk text; ranking scales are
/// method-local and normalized by the voter.
pub trait ExtractionMethod: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str) -> Vec<Candidate>;
}

/// Run every method over a chunk and merge proposals by majority vote.
///
/// Scores are min-max normalized per method (a method's top candidate maps
/// to 1.0) before averaging, so methods with different ranking scales vote
/// on equal footing. `methods_found` records the agreeing methods.
pub fn vote(
    chunk: &Chunk,
    methods: &[Box<dyn ExtractionMethod>],
    min_agreement: usize,
) -> Vec<Concept> {
    // normalized term -> (display term, contributing (method, normalized score))
    let mut ballots: HashMap<String, (String, Vec<(&'static str, f64)>)> = HashMap::new();

    for method in methods {
        let candidates = method.extract(&chunk.text);
        let top = candidates
            .iter()
            .map(|c| c.score)
            .fold(f64::MIN, f64::max);
        if candidates.is_empty() || top <= 0.0 {
            continue;
        }

        // One ballot per normalized term per method: keep the best-scoring
        // duplicate so a method cannot vote twice.
        let mut seen: HashMap<String, f64> = HashMap::new();
        let mut display: HashMap<String, String> = HashMap::new();
        for c in &candidates {
            let key = normalize_term(&c.term);
            if key.is_empty() {
                continue;
            }
            let norm = (c.score / top).clamp(0.0, 1.0);
            let entry = seen.entry(key.clone()).or_insert(norm);
            if norm >= *entry {
                *entry = norm;
                display.insert(key, c.term.clone());
            }
        }

        for (key, norm) in seen {
            let display_term = display
                .get(&key)
                .cloned()
                .unwrap_or_else(|| key.clone());
            let entry = ballots
                .entry(key)
                .or_insert_with(|| (display_term, Vec::new()));
            entry.1.push((method.name(), norm));
        }
    }

    let mut concepts: Vec<Concept> = Vec::new();
    for (_, (term, votes)) in ballots {
        if votes.len() < min_agreement {
            continue;
        }
        let confidence = votes.iter().map(|(_, s)| s).sum::<f64>() / votes.len() as f64;
        let definition = sentence_containing(&chunk.text, &term).unwrap_or_default();

        let mut concept = Concept::new(term, definition, chunk.page_number);
        concept.confidence = confidence.clamp(0.0, 1.0);
        concept.chunk_ids.push(chunk.id.clone());
        for (method, _) in votes {
            concept.methods_found.insert(method.to_string());
        }
        concepts.push(concept);
    }

    // Deterministic order: strongest first, term as tiebreak.
    concepts.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.term.cmp(&b.term))
    });
    concepts
}

/// First sentence of `text` that mentions `term` (case-insensitive).
/// Used as a provisional definition until enrichment supplies a real one.
pub fn sentence_containing(text: &str, term: &str) -> Option<String> {
    let needle = term.to_lowercase();
    for (start, end) in split_sentences(text) {
        let sentence = &text[start..end];
        if sentence.to_lowercase().contains(&needle) {
            return Some(sentence.trim().to_string());
        }
    }
    None
}

/// Merge exact duplicates (identical normalized term) across chunks.
///
/// Source references and methods are unioned; confidence becomes the
/// maximum of the duplicates; the earliest page of occurrence wins.
pub fn merge_exact_duplicates(concepts: Vec<Concept>) -> Vec<Concept> {
    let mut by_term: HashMap<String, Concept> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for concept in concepts {
        let key = concept.normalized_term();
        match by_term.get_mut(&key) {
            None => {
                order.push(key.clone());
                by_term.insert(key, concept);
            }
            Some(existing) => {
                existing.confidence = existing.confidence.max(concept.confidence);
                for id in concept.chunk_ids {
                    if !existing.chunk_ids.contains(&id) {
                        existing.chunk_ids.push(id);
                    }
                }
                existing.methods_found.extend(concept.methods_found);
                if existing.definition.is_empty() && !concept.definition.is_empty() {
                    existing.definition = concept.definition;
                }
                // Earliest real page wins; sentinel pages never override.
                if concept.page_number > 0
                    && (existing.page_number <= 0 || concept.page_number < existing.page_number)
                {
                    existing.page_number = concept.page_number;
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_term.remove(&key))
        .collect()
}
