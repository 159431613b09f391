//! The structured-markup envelope exchanged with the completion service.
//!
//! Prompts ask for answers wrapped in a small XML-ish envelope:
//!
//! ```text
//! <concepts>
//!   <concept>
//!     <term>Virtual Machine</term>
//!     <definition>A software emulation of a physical computer.</definition>
//!     <source>A Virtual Machine is a software emulation...</source>
//!   </concept>
//! </concepts>
//! ```
//!
//! Responses are parsed with a three-tier strategy: a strict XML parse,
//! then a permissive regex extraction over the same tags (degraded quality,
//! not an error), and finally an empty result with the raw response logged.
//! A single bad response never aborts a document.

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::sync::OnceLock;

use docgraph_core::models::{RelationKind, Structural};

/// How a completion response was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    /// Strict structured parse succeeded.
    Strict,
    /// Regex fallback succeeded; logged as degraded quality.
    Permissive,
    /// Neither tier matched; the unit contributes an empty result.
    Failed,
}

/// A term/definition/source-sentence triple from enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptTriple {
    pub term: String,
    pub definition: String,
    pub source: String,
}

/// A relationship classification answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationAnswer {
    pub kind: RelationKind,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    pub structural: Structural,
}

/// Prompt asking for concept triples for one chunk.
pub fn concept_prompt(chunk_text: &str) -> String {
    format!(
        "Identify the key domain concepts in the following text. Answer with \
         only a <concepts> envelope; one <concept> element per concept with \
         <term>, <definition>, and <source> (the sentence the concept comes \
         from) children.\n\nText:\n{}",
        chunk_text
    )
}

/// Prompt asking for a relationship classification between two concepts.
pub fn relation_prompt(from: (&str, &str), to: (&str, &str)) -> String {
    format!(
        "Classify the relationship from \"{}\" to \"{}\".\n\
         \"{}\": {}\n\"{}\": {}\n\
         Answer with only a <relation> envelope containing <kind> (one of \
         prerequisite, part-of, leads-to, applies-to, contrasts-with), \
         <confidence> (0.0-1.0), and <category> (hierarchical, sequential, \
         or unclassified). If no relationship exists, answer <relation/>.",
        from.0, to.0, from.0, from.1, to.0, to.1
    )
}

/// Parse a concepts envelope, reporting which tier recovered it.
pub fn parse_concepts(response: &str) -> (Vec<ConceptTriple>, ParseTier) {
    match parse_concepts_strict(response) {
        Some(triples) if !triples.is_empty() => return (triples, ParseTier::Strict),
        _ => {}
    }
    let permissive = parse_concepts_permissive(response);
    if !permissive.is_empty() {
        return (permissive, ParseTier::Permissive);
    }
    (Vec::new(), ParseTier::Failed)
}

fn parse_concepts_strict(response: &str) -> Option<Vec<ConceptTriple>> {
    let envelope = extract_envelope(response, "concepts")?;
    let mut reader = Reader::from_str(&envelope);
    reader.config_mut().trim_text(true);

    let mut triples = Vec::new();
    let mut current: Option<ConceptTriple> = None;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"concept" => {
                    current = Some(ConceptTriple {
                        term: String::new(),
                        definition: String::new(),
                        source: String::new(),
                    });
                }
                b"term" => field = Some("term"),
                b"definition" => field = Some("definition"),
                b"source" => field = Some("source"),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let (Some(current), Some(field)) = (current.as_mut(), field) {
                    let text = t.unescape().ok()?.trim().to_string();
                    match field {
                        "term" => current.term = text,
                        "definition" => current.definition = text,
                        _ => current.source = text,
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"concept" => {
                    if let Some(triple) = current.take() {
                        if !triple.term.is_empty() {
                            triples.push(triple);
                        }
                    }
                }
                b"term" | b"definition" | b"source" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    Some(triples)
}

fn parse_concepts_permissive(response: &str) -> Vec<ConceptTriple> {
    static CONCEPT_RE: OnceLock<Regex> = OnceLock::new();
    let concept_re = CONCEPT_RE
        .get_or_init(|| Regex::new(r"(?s)<concept>(.*?)</concept>").expect("static regex"));

    concept_re
        .captures_iter(response)
        .filter_map(|cap| {
            let body = cap.get(1)?.as_str();
            let term = tag_value(body, "term")?;
            if term.is_empty() {
                return None;
            }
            Some(ConceptTriple {
                term,
                definition: tag_value(body, "definition").unwrap_or_default(),
                source: tag_value(body, "source").unwrap_or_default(),
            })
        })
        .collect()
}

/// Parse a relation envelope. `None` means "no relationship" (including an
/// explicit `<relation/>`) or an unrecoverable response.
pub fn parse_relation(response: &str) -> (Option<RelationAnswer>, ParseTier) {
    // Strict tier: an envelope is authoritative; an empty or unparseable
    // one means "no relationship", not a reason to scan the prose.
    if let Some(envelope) = extract_envelope(response, "relation") {
        if let Some(answer) = relation_from_text(&envelope) {
            return (Some(answer), ParseTier::Strict);
        }
        return (None, ParseTier::Strict);
    }
    // Permissive tier: the tags anywhere in the response.
    if let Some(answer) = relation_from_text(response) {
        return (Some(answer), ParseTier::Permissive);
    }
    (None, ParseTier::Failed)
}

fn relation_from_text(text: &str) -> Option<RelationAnswer> {
    let kind = RelationKind::parse(&tag_value(text, "kind")?)?;
    let confidence = tag_value(text, "confidence")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    let structural = tag_value(text, "category")
        .map(|v| Structural::parse(&v))
        .unwrap_or_else(|| kind.structural());
    Some(RelationAnswer {
        kind,
        confidence,
        structural,
    })
}

/// The `<name>...</name>` envelope within a response, or the self-closing
/// form. Completion output often wraps the envelope in prose; everything
/// outside it is ignored.
fn extract_envelope(response: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    if let (Some(start), Some(end)) = (response.find(&open), response.rfind(&close)) {
        if end > start {
            return Some(response[start..end + close.len()].to_string());
        }
    }
    let self_closing = format!("<{}/>", name);
    response.contains(&self_closing).then(|| self_closing)
}

fn tag_value(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    let value = text[start..end].trim();
    (!value.contains('<')).then(|| value.to_string())
}
