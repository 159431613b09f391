//! Relationship detection over the deduplicated concept set.
//!
//! Candidate ordered pairs come from each concept's top-K embedding
//! neighbors, never the full cross-product, which keeps completion-service
//! cost bounded for large concept sets. Each candidate is classified by
//! the completion service; final strength blends embedding similarity with
//! the model's own confidence. A pair classified in one direction is not
//! resubmitted in reverse; self-pairs are excluded.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use docgraph_core::models::{Concept, CostRecord, Relationship};
use docgraph_core::similarity::top_k_neighbors;

use crate::budget::SharedBudget;
use crate::config::RelationsConfig;
use crate::error::ServiceError;
use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::services::markup::{parse_relation, relation_prompt, ParseTier};
use crate::services::CompletionService;

/// Relationship stage output.
#[derive(Debug, Default)]
pub struct RelateOutcome {
    pub relationships: Vec<Relationship>,
    pub warnings: Vec<String>,
    pub cost_records: Vec<CostRecord>,
    /// Set when cancellation was observed between pairs.
    pub cancelled: bool,
    /// Set when a service-fatal error aborted the stage; accumulated
    /// relationships are still returned.
    pub fatal: Option<String>,
}

/// Output ceiling requested per classification call.
const RELATION_MAX_OUTPUT_UNITS: i64 = 256;

pub struct RelationshipDetector {
    completion: Arc<dyn CompletionService>,
    budget: Arc<SharedBudget>,
    backoff: BackoffPolicy,
    config: RelationsConfig,
}

impl RelationshipDetector {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        budget: Arc<SharedBudget>,
        backoff: BackoffPolicy,
        config: RelationsConfig,
    ) -> Self {
        Self {
            completion,
            budget,
            backoff,
            config,
        }
    }

    /// Detect relationships among canonical concepts.
    pub async fn detect(
        &self,
        document_id: &str,
        concepts: &[Concept],
        cancel: &CancellationToken,
    ) -> RelateOutcome {
        let mut out = RelateOutcome::default();

        // Only canonical concepts participate; superseded ones are
        // provenance records.
        let canonical: Vec<&Concept> = concepts.iter().filter(|c| c.is_canonical()).collect();
        if canonical.len() < 2 {
            return out;
        }

        let vectors: Vec<&[f32]> = canonical
            .iter()
            .map(|c| c.embedding.as_deref().unwrap_or(&[]))
            .collect();

        // Unordered pair keys: one classification per pair, never the
        // reverse direction too.
        let mut examined: HashSet<(usize, usize)> = HashSet::new();
        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
        for i in 0..canonical.len() {
            if vectors[i].is_empty() {
                continue;
            }
            for (j, similarity) in top_k_neighbors(&vectors, i, self.config.top_k) {
                let key = (i.min(j), i.max(j));
                if examined.insert(key) {
                    candidates.push((i, j, similarity));
                }
            }
        }

        for (i, j, similarity) in candidates {
            if cancel.is_cancelled() {
                out.cancelled = true;
                break;
            }

            match self
                .classify_pair(document_id, canonical[i], canonical[j], similarity, &mut out)
                .await
            {
                Ok(Some(relationship)) => out.relationships.push(relationship),
                Ok(None) => {}
                Err(e) if stage_fatal(&e) => {
                    tracing::warn!(error = %e, "relationship stage aborted");
                    out.fatal = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    out.warnings.push(format!(
                        "relationship classification failed for \"{}\" → \"{}\": {}",
                        canonical[i].term, canonical[j].term, e
                    ));
                }
            }
        }

        out
    }

    async fn classify_pair(
        &self,
        document_id: &str,
        from: &Concept,
        to: &Concept,
        similarity: f32,
        out: &mut RelateOutcome,
    ) -> Result<Option<Relationship>, ServiceError> {
        self.budget.acquire("completion").await?;

        let prompt = relation_prompt(
            (&from.term, &from.definition),
            (&to.term, &to.definition),
        );
        let response = retry_with_backoff(&self.backoff, "relate", || {
            self.completion.complete(&prompt, RELATION_MAX_OUTPUT_UNITS)
        })
        .await?;

        out.cost_records.push(self.budget.record(
            document_id,
            "completion",
            response.input_units,
            response.output_units,
        ));

        let (answer, tier) = parse_relation(&response.text);
        if tier == ParseTier::Permissive {
            out.warnings.push(format!(
                "relation markup for \"{}\" → \"{}\" recovered via permissive parse",
                from.term, to.term
            ));
        }
        if tier == ParseTier::Failed {
            tracing::warn!(
                from = %from.term,
                to = %to.term,
                response = %response.text,
                "relation response had no parseable envelope"
            );
        }

        Ok(answer.map(|answer| {
            let w = self.config.similarity_weight;
            let strength = w * similarity.max(0.0) as f64 + (1.0 - w) * answer.confidence;
            Relationship::new(
                from.id.clone(),
                to.id.clone(),
                answer.kind,
                strength,
                answer.structural,
            )
        }))
    }
}

/// Errors that poison every subsequent call abort the stage; unit-local
/// failures are swallowed by the caller.
fn stage_fatal(err: &ServiceError) -> bool {
    matches!(
        err,
        ServiceError::QuotaExceeded | ServiceError::BadRequest(_) | ServiceError::Auth(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedCompletion {
        response: String,
        calls: AtomicU32,
        fail: Option<fn() -> ServiceError>,
    }

    impl FixedCompletion {
        fn ok(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: response.to_string(),
                calls: AtomicU32::new(0),
                fail: None,
            })
        }

        fn failing(f: fn() -> ServiceError) -> Arc<Self> {
            Arc::new(Self {
                response: String::new(),
                calls: AtomicU32::new(0),
                fail: Some(f),
            })
        }
    }

    #[async_trait]
    impl CompletionService for FixedCompletion {
        async fn complete(
            &self,
            _prompt: &str,
            _max_output_units: i64,
        ) -> Result<crate::services::CompletionOutput, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fail) = self.fail {
                return Err(fail());
            }
            Ok(crate::services::CompletionOutput {
                text: self.response.clone(),
                input_units: 50,
                output_units: 20,
            })
        }
    }

    fn concept(term: &str, embedding: Vec<f32>) -> Concept {
        let mut c = Concept::new(term, format!("{} definition", term), 1);
        c.confidence = 0.8;
        c.embedding = Some(embedding);
        c
    }

    fn detector(completion: Arc<dyn CompletionService>) -> RelationshipDetector {
        RelationshipDetector::new(
            completion,
            SharedBudget::new(&crate::config::BudgetConfig::default()),
            BackoffPolicy::default(),
            RelationsConfig::default(),
        )
    }

    #[tokio::test]
    async fn one_classification_per_unordered_pair() {
        let completion = FixedCompletion::ok(
            "<relation><kind>prerequisite</kind><confidence>0.8</confidence>\
             <category>sequential</category></relation>",
        );
        let d = detector(completion.clone());
        let concepts = vec![
            concept("Limits", vec![1.0, 0.1]),
            concept("Derivatives", vec![0.9, 0.2]),
        ];

        let out = d
            .detect("doc1", &concepts, &CancellationToken::new())
            .await;
        assert!(out.fatal.is_none());
        assert_eq!(out.relationships.len(), 1);
        // Two concepts are mutual neighbors, but only one direction is
        // classified.
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.relationships[0].kind.as_str(), "prerequisite");
        assert!(out.relationships[0].strength > 0.0);
    }

    #[tokio::test]
    async fn empty_envelope_means_no_relationship() {
        let completion = FixedCompletion::ok("<relation/>");
        let d = detector(completion);
        let concepts = vec![
            concept("Apples", vec![1.0, 0.0]),
            concept("Oranges", vec![0.9, 0.1]),
        ];

        let out = d
            .detect("doc1", &concepts, &CancellationToken::new())
            .await;
        assert!(out.relationships.is_empty());
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn bad_request_aborts_stage() {
        let completion =
            FixedCompletion::failing(|| ServiceError::BadRequest("malformed".into()));
        let d = detector(completion.clone());
        let concepts = vec![
            concept("One", vec![1.0, 0.0]),
            concept("Two", vec![0.9, 0.1]),
            concept("Three", vec![0.8, 0.2]),
        ];

        let out = d
            .detect("doc1", &concepts, &CancellationToken::new())
            .await;
        assert!(out.fatal.is_some());
        assert!(out.relationships.is_empty());
        // Aborted on the first candidate, not retried across the rest.
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unit_failures_are_swallowed() {
        let completion =
            FixedCompletion::failing(|| ServiceError::Transport("connection reset".into()));
        let d = detector(completion);
        let concepts = vec![
            concept("One", vec![1.0, 0.0]),
            concept("Two", vec![0.9, 0.1]),
        ];

        let out = d
            .detect("doc1", &concepts, &CancellationToken::new())
            .await;
        assert!(out.fatal.is_none());
        assert!(out.relationships.is_empty());
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn concepts_without_embeddings_are_skipped() {
        let completion = FixedCompletion::ok("<relation/>");
        let d = detector(completion.clone());
        let mut bare = Concept::new("Bare", "no vector", 1);
        bare.confidence = 0.5;
        let concepts = vec![bare, concept("Vectored", vec![1.0, 0.0])];

        let out = d
            .detect("doc1", &concepts, &CancellationToken::new())
            .await;
        assert!(out.relationships.is_empty());
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }
}
