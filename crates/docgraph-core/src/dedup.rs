//! Concept deduplication: lexical variant folding plus embedding-based
//! near-duplicate detection, merged transitively with union-find.
//!
//! Two passes feed one disjoint-set structure so that chains of
//! near-duplicates (A≈B, B≈C) collapse to a single canonical concept. The
//! canonical concept keeps the highest confidence and the union of chunk
//! references and methods; superseded concepts are retained with
//! `merged_into` set for provenance, never deleted.

use std::collections::HashMap;

use crate::models::Concept;
use crate::similarity::{cosine_similarity, top_k_neighbors};

/// Disjoint-set over concept indices with path compression and union by
/// rank.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    /// Union two sets; returns true when they were previously disjoint.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

/// Outcome of a deduplication pass.
#[derive(Debug)]
pub struct DedupOutcome {
    /// All concepts: canonical survivors plus superseded ones with
    /// `merged_into` set.
    pub concepts: Vec<Concept>,
    /// Number of merges performed (reporting only).
    pub merges: usize,
}

/// Tunables for the deduplicator.
#[derive(Debug, Clone)]
pub struct DedupParams {
    /// Cosine similarity above which two concepts merge.
    pub similarity_threshold: f32,
    /// Neighbors examined per concept in the embedding pass.
    pub neighbor_k: usize,
}

impl Default for DedupParams {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            neighbor_k: 8,
        }
    }
}

/// Deduplicate a document's concept set.
///
/// Pass (a) is lexical: punctuation/case folding and abbreviation/expansion
/// pairs (an all-caps term matching the initials of a multiword term).
/// Pass (b) is embedding-based: for each concept with a vector, its top-K cosine
/// neighbors above the threshold merge. Both passes union into the same
/// disjoint set before canonical selection.
pub fn dedupe(mut concepts: Vec<Concept>, params: &DedupParams) -> DedupOutcome {
    let n = concepts.len();
    if n < 2 {
        return DedupOutcome {
            concepts,
            merges: 0,
        };
    }

    let mut uf = UnionFind::new(n);
    let mut merges = 0usize;

    // Lexical pass: identical folded keys.
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (i, concept) in concepts.iter().enumerate() {
        let key = lexical_key(&concept.term);
        if key.is_empty() {
            continue;
        }
        match by_key.get(&key) {
            Some(&first) => {
                if uf.union(first, i) {
                    merges += 1;
                }
            }
            None => {
                by_key.insert(key, i);
            }
        }
    }

    // Lexical pass: abbreviation vs expansion initials.
    let initials: Vec<Option<String>> = concepts
        .iter()
        .map(|c| initials_of(&c.term))
        .collect();
    for (i, concept) in concepts.iter().enumerate() {
        let abbr = abbreviation_key(&concept.term);
        let Some(abbr) = abbr else { continue };
        for (j, other_initials) in initials.iter().enumerate() {
            if i == j {
                continue;
            }
            if other_initials.as_deref() == Some(abbr.as_str()) && uf.union(i, j) {
                merges += 1;
            }
        }
    }

    // Embedding pass: strict-threshold nearest neighbors.
    let vectors: Vec<&[f32]> = concepts
        .iter()
        .map(|c| c.embedding.as_deref().unwrap_or(&[]))
        .collect();
    for i in 0..n {
        if vectors[i].is_empty() {
            continue;
        }
        for (j, _) in top_k_neighbors(&vectors, i, params.neighbor_k) {
            let sim = cosine_similarity(vectors[i], vectors[j]);
            if sim >= params.similarity_threshold && uf.union(i, j) {
                merges += 1;
            }
        }
    }

    // Canonical per set: highest confidence, then earliest page, then first.
    let mut canonical: HashMap<usize, usize> = HashMap::new();
    for i in 0..n {
        let root = uf.find(i);
        let best = canonical.entry(root).or_insert(i);
        let current = &concepts[*best];
        let candidate = &concepts[i];
        let better = candidate.confidence > current.confidence
            || (candidate.confidence == current.confidence
                && candidate.page_number > 0
                && (current.page_number <= 0 || candidate.page_number < current.page_number));
        if better {
            *best = i;
        }
    }

    // Fold superseded concepts into their canonicals.
    for i in 0..n {
        let root = uf.find(i);
        let best = canonical[&root];
        if best == i {
            continue;
        }

        let (chunk_ids, methods, confidence, page, canonical_id) = {
            let superseded = &concepts[i];
            (
                superseded.chunk_ids.clone(),
                superseded.methods_found.clone(),
                superseded.confidence,
                superseded.page_number,
                concepts[best].id.clone(),
            )
        };

        let keeper = &mut concepts[best];
        keeper.confidence = keeper.confidence.max(confidence);
        for id in chunk_ids {
            if !keeper.chunk_ids.contains(&id) {
                keeper.chunk_ids.push(id);
            }
        }
        keeper.methods_found.extend(methods);
        if page > 0 && (keeper.page_number <= 0 || page < keeper.page_number) {
            keeper.page_number = page;
        }
        concepts[i].merged_into = Some(canonical_id);
    }

    DedupOutcome { concepts, merges }
}

/// Case/punctuation-insensitive folding key: lowercase alphanumerics with
/// collapsed separators. `"TCP/IP"` and `"tcp ip"` share a key.
fn lexical_key(term: &str) -> String {
    term.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The term itself when it looks like an abbreviation (2–6 uppercase
/// letters, single word), lowercased for matching.
fn abbreviation_key(term: &str) -> Option<String> {
    let word = term.trim();
    if (2..=6).contains(&word.len())
        && word.chars().all(|c| c.is_ascii_uppercase())
    {
        Some(word.to_lowercase())
    } else {
        None
    }
}

/// Initials of a multiword term (`"Virtual Private Network"` → `"vpn"`).
fn initials_of(term: &str) -> Option<String> {
    let words: Vec<&str> = term.split_whitespace().collect();
    if words.len() < 2 {
        return None;
    }
    Some(
        words
            .iter()
            .filter_map(|w| w.chars().next())
            .map(|c| c.to_ascii_lowercase())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(term: &str, confidence: f64, page: i64) -> Concept {
        let mut c = Concept::new(term, format!("{} definition", term), page);
        c.confidence = confidence;
        c.chunk_ids.push(format!("chunk-{}", term.to_lowercase()));
        c.methods_found.insert("keyphrase".to_string());
        c
    }

    fn with_embedding(mut c: Concept, v: Vec<f32>) -> Concept {
        c.embedding = Some(v);
        c
    }

    #[test]
    fn union_find_transitive() {
        let mut uf = UnionFind::new(4);
        assert!(uf.union(0, 1));
        assert!(uf.union(1, 2));
        assert!(!uf.union(0, 2));
        assert_eq!(uf.find(0), uf.find(2));
        assert_ne!(uf.find(0), uf.find(3));
    }

    #[test]
    fn lexical_variants_merge() {
        let concepts = vec![
            concept("TCP/IP", 0.7, 1),
            concept("tcp ip", 0.5, 2),
            concept("Routing", 0.6, 3),
        ];
        let out = dedupe(concepts, &DedupParams::default());
        assert_eq!(out.merges, 1);
        let canonical: Vec<&Concept> =
            out.concepts.iter().filter(|c| c.is_canonical()).collect();
        assert_eq!(canonical.len(), 2);
        let tcp = canonical.iter().find(|c| c.term == "TCP/IP").unwrap();
        assert_eq!(tcp.confidence, 0.7);
        assert_eq!(tcp.chunk_ids.len(), 2);
    }

    #[test]
    fn abbreviation_merges_with_expansion() {
        let concepts = vec![
            concept("VPN", 0.5, 4),
            concept("Virtual Private Network", 0.8, 1),
        ];
        let out = dedupe(concepts, &DedupParams::default());
        assert_eq!(out.merges, 1);
        let canonical: Vec<&Concept> =
            out.concepts.iter().filter(|c| c.is_canonical()).collect();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].term, "Virtual Private Network");
        let superseded = out.concepts.iter().find(|c| c.term == "VPN").unwrap();
        assert_eq!(superseded.merged_into.as_deref(), Some(canonical[0].id.as_str()));
    }

    #[test]
    fn three_near_duplicates_collapse_to_one_canonical() {
        // A≈B≈C pairwise above threshold: one canonical with max confidence
        // and the union of all three concepts' sources.
        let a = with_embedding(concept("Neural Net", 0.6, 2), vec![1.0, 0.0, 0.001]);
        let b = with_embedding(concept("Neural Network", 0.9, 1), vec![0.999, 0.01, 0.0]);
        let c = with_embedding(concept("Neural Networks", 0.7, 3), vec![0.998, 0.02, 0.001]);

        let out = dedupe(vec![a, b, c], &DedupParams::default());
        let canonical: Vec<&Concept> =
            out.concepts.iter().filter(|c| c.is_canonical()).collect();
        assert_eq!(canonical.len(), 1);
        let keeper = canonical[0];
        assert_eq!(keeper.term, "Neural Network");
        assert_eq!(keeper.confidence, 0.9);
        assert_eq!(keeper.chunk_ids.len(), 3);
        assert_eq!(keeper.page_number, 1);
        assert_eq!(out.concepts.len(), 3);
    }

    #[test]
    fn dissimilar_embeddings_do_not_merge() {
        let a = with_embedding(concept("Entropy", 0.6, 1), vec![1.0, 0.0]);
        let b = with_embedding(concept("Osmosis", 0.6, 2), vec![0.0, 1.0]);
        let out = dedupe(vec![a, b], &DedupParams::default());
        assert_eq!(out.merges, 0);
        assert!(out.concepts.iter().all(|c| c.is_canonical()));
    }

    #[test]
    fn merge_never_decreases_confidence() {
        let a = with_embedding(concept("Gradient Descent", 0.95, 1), vec![1.0, 0.0]);
        let b = with_embedding(concept("gradient descent", 0.2, 2), vec![1.0, 0.0]);
        let out = dedupe(vec![a, b], &DedupParams::default());
        let keeper = out.concepts.iter().find(|c| c.is_canonical()).unwrap();
        assert_eq!(keeper.confidence, 0.95);
    }

    #[test]
    fn empty_and_singleton_inputs() {
        assert_eq!(dedupe(Vec::new(), &DedupParams::default()).merges, 0);
        let out = dedupe(vec![concept("Only", 0.5, 1)], &DedupParams::default());
        assert_eq!(out.concepts.len(), 1);
        assert_eq!(out.merges, 0);
    }
}
