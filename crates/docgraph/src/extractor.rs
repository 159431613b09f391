//! Per-chunk ensemble extraction driver with completion-service enrichment.
//!
//! Chunks are processed in sequence; throughput is secondary to staying
//! under external quota. Each chunk runs the local ensemble; sparse chunks
//! (below the configured minimum concept yield) are additionally submitted
//! to the completion service for term/definition/source triples. Per-chunk
//! failures are swallowed into warnings, contributing an empty result for
//! that chunk rather than aborting the document.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use docgraph_core::extract::{merge_exact_duplicates, vote, ExtractionMethod};
use docgraph_core::methods::default_methods;
use docgraph_core::models::{Chunk, Concept, CostRecord};

use crate::budget::SharedBudget;
use crate::config::ExtractionConfig;
use crate::error::ServiceError;
use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::services::markup::{concept_prompt, parse_concepts, ParseTier};
use crate::services::CompletionService;

/// Confidence assigned to concepts recovered via enrichment; the model
/// supplies definitions, not comparable ensemble scores.
const ENRICHED_CONFIDENCE: f64 = 0.7;
/// Output ceiling requested per enrichment call.
const ENRICH_MAX_OUTPUT_UNITS: i64 = 1024;

/// Extraction stage output.
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub concepts: Vec<Concept>,
    pub warnings: Vec<String>,
    pub cost_records: Vec<CostRecord>,
    pub enriched_chunks: i64,
    /// Set when cancellation was observed between chunks.
    pub cancelled: bool,
}

/// Ensemble extractor with injected completion service and shared budget.
pub struct ConceptExtractor {
    methods: Vec<Box<dyn ExtractionMethod>>,
    completion: Arc<dyn CompletionService>,
    budget: Arc<SharedBudget>,
    backoff: BackoffPolicy,
    config: ExtractionConfig,
}

impl ConceptExtractor {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        budget: Arc<SharedBudget>,
        backoff: BackoffPolicy,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            methods: default_methods(),
            completion,
            budget,
            backoff,
            config,
        }
    }

    /// Replace the method set (tests inject fixed methods here).
    pub fn with_methods(mut self, methods: Vec<Box<dyn ExtractionMethod>>) -> Self {
        self.methods = methods;
        self
    }

    /// Extract concepts for every chunk, then merge exact duplicates.
    pub async fn extract(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> ExtractOutcome {
        let mut out = ExtractOutcome::default();
        // Once the day quota is gone every further enrichment call would
        // fail the same way; local extraction continues without it.
        let mut enrichment_exhausted = false;

        for chunk in chunks {
            if cancel.is_cancelled() {
                out.cancelled = true;
                break;
            }

            let mut local = vote(chunk, &self.methods, self.config.min_agreement);
            let sparse = local.len() < self.config.min_concepts_per_chunk;

            if self.config.enrich && sparse && !enrichment_exhausted {
                match self.enrich_chunk(document_id, chunk, &mut out).await {
                    Ok(mut enriched) => {
                        out.enriched_chunks += 1;
                        local.append(&mut enriched);
                    }
                    Err(ServiceError::QuotaExceeded) => {
                        enrichment_exhausted = true;
                        out.warnings.push(
                            "daily quota exhausted; enrichment disabled for remaining chunks"
                                .to_string(),
                        );
                    }
                    Err(e) => {
                        out.warnings.push(format!(
                            "enrichment failed for chunk {}: {}",
                            chunk.chunk_index, e
                        ));
                    }
                }

                // Fixed pause between submissions to reduce throttling
                // pressure proactively, regardless of outcome.
                tokio::time::sleep(Duration::from_millis(self.config.inter_chunk_delay_ms)).await;
            }

            out.concepts.append(&mut local);
        }

        out.concepts = merge_exact_duplicates(std::mem::take(&mut out.concepts));
        out
    }

    /// One enrichment call: rate-limited, retried for throttling, parsed
    /// with the three-tier strategy.
    async fn enrich_chunk(
        &self,
        document_id: &str,
        chunk: &Chunk,
        out: &mut ExtractOutcome,
    ) -> Result<Vec<Concept>, ServiceError> {
        self.budget.acquire("completion").await?;

        let prompt = concept_prompt(&chunk.text);
        let response = retry_with_backoff(&self.backoff, "enrich", || {
            self.completion.complete(&prompt, ENRICH_MAX_OUTPUT_UNITS)
        })
        .await?;

        out.cost_records.push(self.budget.record(
            document_id,
            "completion",
            response.input_units,
            response.output_units,
        ));

        let (triples, tier) = parse_concepts(&response.text);
        match tier {
            ParseTier::Strict => {}
            ParseTier::Permissive => {
                tracing::warn!(chunk = chunk.chunk_index, "markup recovered via regex fallback");
                out.warnings.push(format!(
                    "chunk {}: enrichment markup recovered via permissive parse",
                    chunk.chunk_index
                ));
            }
            ParseTier::Failed => {
                tracing::warn!(
                    chunk = chunk.chunk_index,
                    response = %response.text,
                    "enrichment response had no parseable envelope"
                );
                return Ok(Vec::new());
            }
        }

        Ok(triples
            .into_iter()
            .map(|triple| {
                let mut concept = Concept::new(triple.term, triple.definition, chunk.page_number);
                concept.confidence = ENRICHED_CONFIDENCE;
                concept.chunk_ids.push(chunk.id.clone());
                concept.methods_found.insert("completion".to_string());
                if concept.definition.is_empty() {
                    concept.definition = triple.source;
                }
                concept
            })
            .collect())
    }
}
