//! The three local extraction methods behind the ensemble.
//!
//! - [`KeyphraseMethod`] — RAKE-style keyphrase extraction: candidate
//!   phrases are maximal stopword-free runs, scored by word degree/frequency.
//! - [`FrequencyMethod`] — statistical frequency of unigrams and bigrams.
//! - [`TextRankMethod`] — graph centrality over a co-occurrence window
//!   graph, with adjacent high-ranking words combined into bigrams.
//!
//! All methods are purely local (no I/O) and return method-scaled scores;
//! the voter normalizes before comparing across methods.

use std::collections::HashMap;

use crate::extract::{Candidate, ExtractionMethod};

/// English stopwords shared by all methods. Phrase boundaries fall on these.
const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "an", "and", "any", "are", "as",
    "at", "be", "because", "been", "before", "being", "below", "between", "both", "but", "by",
    "can", "cannot", "could", "did", "do", "does", "doing", "down", "during", "each", "few",
    "for", "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers",
    "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "may",
    "me", "might", "more", "most", "must", "my", "no", "nor", "not", "now", "of", "off", "on",
    "once", "only", "or", "other", "our", "out", "over", "own", "same", "she", "should", "so",
    "some", "such", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "those", "through", "to", "too", "under", "until", "up", "used", "uses", "using",
    "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "would", "you", "your",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// A word token: lowercase form for matching, original form for display.
#[derive(Debug, Clone)]
struct Token {
    lower: String,
    original: String,
}

/// Split text into word tokens, stripping punctuation. Purely alphanumeric
/// words only; single letters are dropped as noise.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '-') {
        let word = raw.trim_matches('-');
        if word.len() < 2 || !word.chars().any(|c| c.is_alphabetic()) {
            continue;
        }
        tokens.push(Token {
            lower: word.to_lowercase(),
            original: word.to_string(),
        });
    }
    tokens
}

/// Join tokens into a display phrase preserving source casing.
fn display_phrase(tokens: &[&Token]) -> String {
    tokens
        .iter()
        .map(|t| t.original.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

const MAX_CANDIDATES: usize = 15;
const MAX_PHRASE_WORDS: usize = 4;

fn take_top(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.term.cmp(&b.term))
    });
    candidates.truncate(MAX_CANDIDATES);
    candidates
}

/// The default ensemble: keyphrase, frequency, and graph centrality.
pub fn default_methods() -> Vec<Box<dyn ExtractionMethod>> {
    vec![
        Box::new(KeyphraseMethod),
        Box::new(FrequencyMethod),
        Box::new(TextRankMethod),
    ]
}

// ============ Keyphrase (RAKE-style) ============

/// Keyphrase extraction via stopword-delimited candidate phrases.
///
/// Word score = degree/frequency over candidate phrases; phrase score is
/// the sum of its word scores, so multiword domain terms outrank isolated
/// frequent words.
pub struct KeyphraseMethod;

impl ExtractionMethod for KeyphraseMethod {
    fn name(&self) -> &'static str {
        "keyphrase"
    }

    fn extract(&self, text: &str) -> Vec<Candidate> {
        let tokens = tokenize(text);

        // Maximal stopword-free runs, capped at MAX_PHRASE_WORDS.
        let mut phrases: Vec<Vec<&Token>> = Vec::new();
        let mut current: Vec<&Token> = Vec::new();
        for token in &tokens {
            if is_stopword(&token.lower) {
                if !current.is_empty() {
                    phrases.push(std::mem::take(&mut current));
                }
            } else {
                current.push(token);
                if current.len() == MAX_PHRASE_WORDS {
                    phrases.push(std::mem::take(&mut current));
                }
            }
        }
        if !current.is_empty() {
            phrases.push(current);
        }

        let mut freq: HashMap<&str, f64> = HashMap::new();
        let mut degree: HashMap<&str, f64> = HashMap::new();
        for phrase in &phrases {
            for token in phrase {
                *freq.entry(&token.lower).or_default() += 1.0;
                *degree.entry(&token.lower).or_default() += (phrase.len() - 1) as f64;
            }
        }

        let mut scores: HashMap<String, (String, f64)> = HashMap::new();
        for phrase in &phrases {
            let score: f64 = phrase
                .iter()
                .map(|t| {
                    let f = freq[t.lower.as_str()];
                    let d = degree[t.lower.as_str()];
                    (f + d) / f
                })
                .sum();
            let key = phrase
                .iter()
                .map(|t| t.lower.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let entry = scores
                .entry(key)
                .or_insert_with(|| (display_phrase(phrase), 0.0));
            entry.1 = entry.1.max(score);
        }

        take_top(
            scores
                .into_values()
                .map(|(term, score)| Candidate::new(term, score))
                .collect(),
        )
    }
}

// ============ Frequency ============

/// Statistical frequency of stopword-free unigrams and bigrams.
///
/// Bigrams count from a single occurrence (multiword terms are rare enough
/// to be signal); unigrams must repeat to be proposed.
pub struct FrequencyMethod;

impl ExtractionMethod for FrequencyMethod {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn extract(&self, text: &str) -> Vec<Candidate> {
        let tokens = tokenize(text);
        let mut counts: HashMap<String, (String, f64)> = HashMap::new();

        for (i, token) in tokens.iter().enumerate() {
            if is_stopword(&token.lower) {
                continue;
            }
            let entry = counts
                .entry(token.lower.clone())
                .or_insert_with(|| (token.original.clone(), 0.0));
            entry.1 += 1.0;

            if let Some(next) = tokens.get(i + 1) {
                if !is_stopword(&next.lower) {
                    let key = format!("{} {}", token.lower, next.lower);
                    let entry = counts
                        .entry(key)
                        .or_insert_with(|| (display_phrase(&[token, next]), 0.0));
                    // Weight bigrams up so a single occurrence survives.
                    entry.1 += 1.5;
                }
            }
        }

        take_top(
            counts
                .into_iter()
                .filter(|(key, (_, score))| key.contains(' ') || *score >= 2.0)
                .map(|(_, (term, score))| Candidate::new(term, score))
                .collect(),
        )
    }
}

// ============ TextRank ============

/// Graph-centrality extraction: words are nodes, co-occurrence within a
/// sliding window adds edges, and a damped power iteration ranks nodes.
/// Adjacent top-ranked words are additionally combined into bigrams.
pub struct TextRankMethod;

/// Co-occurrence window over the stopword-filtered token sequence.
const COOCCURRENCE_WINDOW: usize = 4;
const DAMPING: f64 = 0.85;
const ITERATIONS: usize = 30;

impl ExtractionMethod for TextRankMethod {
    fn name(&self) -> &'static str {
        "textrank"
    }

    fn extract(&self, text: &str) -> Vec<Candidate> {
        let tokens = tokenize(text);
        let filtered: Vec<&Token> = tokens.iter().filter(|t| !is_stopword(&t.lower)).collect();
        if filtered.is_empty() {
            return Vec::new();
        }

        // Node index per unique word; first original casing wins for display.
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut display: Vec<&str> = Vec::new();
        let mut lower: Vec<&str> = Vec::new();
        for token in &filtered {
            if !index.contains_key(token.lower.as_str()) {
                index.insert(&token.lower, display.len());
                display.push(&token.original);
                lower.push(&token.lower);
            }
        }
        let n = display.len();

        // Symmetric co-occurrence weights.
        let mut edges: HashMap<(usize, usize), f64> = HashMap::new();
        for (i, a) in filtered.iter().enumerate() {
            for b in filtered.iter().skip(i + 1).take(COOCCURRENCE_WINDOW - 1) {
                let ia = index[a.lower.as_str()];
                let ib = index[b.lower.as_str()];
                if ia == ib {
                    continue;
                }
                let key = (ia.min(ib), ia.max(ib));
                *edges.entry(key).or_default() += 1.0;
            }
        }

        let mut weight_sum = vec![0.0f64; n];
        for (&(a, b), &w) in &edges {
            weight_sum[a] += w;
            weight_sum[b] += w;
        }

        let mut scores = vec![1.0f64; n];
        for _ in 0..ITERATIONS {
            let mut next = vec![1.0 - DAMPING; n];
            for (&(a, b), &w) in &edges {
                if weight_sum[b] > 0.0 {
                    next[a] += DAMPING * scores[b] * w / weight_sum[b];
                }
                if weight_sum[a] > 0.0 {
                    next[b] += DAMPING * scores[a] * w / weight_sum[a];
                }
            }
            scores = next;
        }

        let mut candidates: Vec<Candidate> = (0..n)
            .map(|i| Candidate::new(display[i], scores[i]))
            .collect();

        // Combine adjacent words in source order into bigram candidates.
        let mut seen_bigrams: HashMap<String, f64> = HashMap::new();
        for pair in filtered.windows(2) {
            let ia = index[pair[0].lower.as_str()];
            let ib = index[pair[1].lower.as_str()];
            if ia == ib {
                continue;
            }
            let key = format!("{} {}", lower[ia], lower[ib]);
            let score = scores[ia] + scores[ib];
            let entry = seen_bigrams.entry(key).or_insert(0.0);
            if score > *entry {
                *entry = score;
                candidates.push(Candidate::new(
                    display_phrase(&[pair[0], pair[1]]),
                    score,
                ));
            }
        }

        take_top(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::normalize_term;

    const VM_TEXT: &str = "A Virtual Machine is a software emulation of a physical computer. \
         The virtual machine runs an operating system. Hypervisors manage each virtual machine.";

    fn proposes(method: &dyn ExtractionMethod, text: &str, term: &str) -> bool {
        method
            .extract(text)
            .iter()
            .any(|c| normalize_term(&c.term) == term)
    }

    #[test]
    fn stopwords_sorted_for_binary_search() {
        let mut sorted = STOPWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOPWORDS);
    }

    #[test]
    fn keyphrase_finds_multiword_terms() {
        assert!(proposes(&KeyphraseMethod, VM_TEXT, "virtual machine"));
        assert!(!proposes(&KeyphraseMethod, VM_TEXT, "is"));
    }

    #[test]
    fn frequency_finds_repeated_terms() {
        assert!(proposes(&FrequencyMethod, VM_TEXT, "virtual machine"));
    }

    #[test]
    fn frequency_requires_repetition_for_unigrams() {
        let text = "Osmosis appears once here. Diffusion diffusion appears twice.";
        assert!(!proposes(&FrequencyMethod, text, "osmosis"));
        assert!(proposes(&FrequencyMethod, text, "diffusion"));
    }

    #[test]
    fn textrank_finds_central_terms() {
        assert!(proposes(&TextRankMethod, VM_TEXT, "virtual machine"));
    }

    #[test]
    fn all_methods_agree_on_scenario_term() {
        for method in default_methods() {
            assert!(
                proposes(method.as_ref(), VM_TEXT, "virtual machine"),
                "method {} missed the term",
                method.name()
            );
        }
    }

    #[test]
    fn empty_text_yields_nothing() {
        for method in default_methods() {
            assert!(method.extract("").is_empty());
        }
    }

    #[test]
    fn scores_are_positive() {
        for method in default_methods() {
            for c in method.extract(VM_TEXT) {
                assert!(c.score > 0.0, "{} produced non-positive score", method.name());
            }
        }
    }
}
