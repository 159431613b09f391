//! Pipeline orchestration.
//!
//! A linear state machine: `CacheCheck → Classify → Parse → BuildHierarchy
//! → ExtractConcepts → Deduplicate → DetectRelationships → PersistCache →
//! Done`, with a terminal `FailedAt(stage)` reachable from any stage.
//!
//! Partial-success contract: a fatal failure after Parse returns whatever
//! earlier stages produced, tagged with the failing stage. Completed work
//! is never discarded silently. Only a fully successful run reaches
//! `PersistCache`, which writes the SQLite rows and the cache entry. The
//! caller always receives a [`PipelineResult`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use docgraph_core::chunk::chunk_pages;
use docgraph_core::dedup::{dedupe, DedupParams};
use docgraph_core::hierarchy;
use docgraph_core::models::{
    Concept, CostRecord, Document, PipelineMetrics, PipelineResult, Relationship, SectionNode,
    Stage,
};

use crate::budget::SharedBudget;
use crate::cache::{content_hash, ResultCache};
use crate::classify::classify;
use crate::config::Config;
use crate::error::ServiceError;
use crate::extractor::ConceptExtractor;
use crate::parser::FallbackParser;
use crate::progress::StageReporter;
use crate::relate::RelationshipDetector;
use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::services::{CompletionService, EmbeddingService, OcrService};
use crate::store;

/// The document knowledge-extraction pipeline.
///
/// Holds the injected external services and the process-wide budget; one
/// instance serves many documents, but a given content hash runs through
/// at most one pipeline at a time.
pub struct Pipeline {
    pool: SqlitePool,
    budget: Arc<SharedBudget>,
    completion: Arc<dyn CompletionService>,
    embedding: Arc<dyn EmbeddingService>,
    ocr: Arc<dyn OcrService>,
    config: Config,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Per-run bookkeeping threaded through the stages: warnings, the cost
/// ledger slice, and the metrics accumulated so far.
struct RunState {
    document_id: String,
    started: Instant,
    warnings: Vec<String>,
    cost_records: Vec<CostRecord>,
    parse_method: String,
    chunk_count: i64,
    enriched_chunks: i64,
    duplicates_merged: i64,
}

impl RunState {
    fn new(document_id: String, started: Instant) -> Self {
        Self {
            document_id,
            started,
            warnings: Vec::new(),
            cost_records: Vec::new(),
            parse_method: String::new(),
            chunk_count: 0,
            enriched_chunks: 0,
            duplicates_merged: 0,
        }
    }

    fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            parse_method: self.parse_method.clone(),
            duration_ms: self.started.elapsed().as_millis() as i64,
            cache_hit: false,
            total_cost: self.cost_records.iter().map(|r| r.cost).sum(),
            duplicates_merged: self.duplicates_merged,
            chunk_count: self.chunk_count,
            enriched_chunks: self.enriched_chunks,
        }
    }
}

struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    hash: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set poisoned")
            .remove(&self.hash);
    }
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        budget: Arc<SharedBudget>,
        completion: Arc<dyn CompletionService>,
        embedding: Arc<dyn EmbeddingService>,
        ocr: Arc<dyn OcrService>,
        config: Config,
    ) -> Self {
        Self {
            pool,
            budget,
            completion,
            embedding,
            ocr,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Process one document from raw bytes to a concept graph.
    ///
    /// Errors are returned only when the run cannot start (the same
    /// document is already mid-pipeline); everything downstream is
    /// reported through the `PipelineResult` itself.
    pub async fn process(
        &self,
        bytes: &[u8],
        cancel: CancellationToken,
        reporter: &dyn StageReporter,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let hash = content_hash(bytes);

        // One full pipeline run per document at a time.
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight set poisoned");
            if !in_flight.insert(hash.clone()) {
                anyhow::bail!("document {} is already being processed", hash);
            }
        }
        let _guard = InFlightGuard {
            set: self.in_flight.clone(),
            hash: hash.clone(),
        };

        // Wall-clock ceiling: a watchdog cancels the child token, observed
        // between work units like any other cancellation.
        let cancel = cancel.child_token();
        let deadline = Duration::from_secs(self.config.pipeline.max_duration_secs);
        let watchdog = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        };

        let result = self
            .run_stages(bytes, &hash, started, &cancel, reporter)
            .await;

        watchdog.abort();
        result
    }

    async fn run_stages(
        &self,
        bytes: &[u8],
        hash: &str,
        started: Instant,
        cancel: &CancellationToken,
        reporter: &dyn StageReporter,
    ) -> Result<PipelineResult> {
        let backoff = BackoffPolicy::from_config(&self.config.retry);
        let cache = ResultCache::new(self.pool.clone());
        let mut stage_started = Instant::now();

        let stage_done = |stage: Stage, stage_started: &mut Instant| {
            tracing::info!(
                stage = stage.as_str(),
                elapsed_ms = stage_started.elapsed().as_millis() as u64,
                "stage complete"
            );
            reporter.report(stage, stage.fraction());
            *stage_started = Instant::now();
        };

        // ---- CacheCheck ----
        let mut cache_warning: Option<String> = None;
        match cache.lookup(hash).await {
            Ok(Some(mut hit)) => {
                hit.metrics.cache_hit = true;
                hit.metrics.duration_ms = started.elapsed().as_millis() as i64;
                stage_done(Stage::CacheCheck, &mut stage_started);
                reporter.report(Stage::Done, Stage::Done.fraction());
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => cache_warning = Some(format!("cache lookup failed: {}", e)),
        }
        stage_done(Stage::CacheCheck, &mut stage_started);

        // ---- Classify ----
        let classification = classify(bytes, &self.config.classify);
        tracing::info!(
            doc_type = classification.doc_type.as_str(),
            pages = classification.page_count,
            cost_hint_usd = classification.cost_hint_usd,
            "document classified"
        );

        // Reuse the stored document id for this hash so replays upsert.
        let document_id = match store::document_id_for_hash(&self.pool, hash).await {
            Ok(Some(id)) => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let mut state = RunState::new(document_id, started);
        state.warnings.extend(cache_warning);
        if let Some(w) = &classification.warning {
            state.warnings.push(w.clone());
        }

        let mut document = Document {
            id: state.document_id.clone(),
            content_hash: hash.to_string(),
            page_count: classification.page_count,
            doc_type: classification.doc_type,
            created_at: Utc::now().timestamp(),
            processed_at: None,
        };
        if let Err(e) = store::upsert_document(&self.pool, &document).await {
            state.warnings.push(format!("document upsert failed: {}", e));
        }
        stage_done(Stage::Classify, &mut stage_started);

        // ---- Parse ----
        let parser = FallbackParser::new(self.ocr.clone(), self.budget.clone(), backoff.clone());
        let parse_outcome = match parser
            .parse(
                &state.document_id,
                bytes,
                classification.doc_type,
                classification.page_count,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                state.warnings.push(e.to_string());
                let hierarchy = SectionNode::flat_root(classification.page_count);
                return self
                    .finish_failed(Stage::Parse, state, Vec::new(), Vec::new(), hierarchy)
                    .await;
            }
        };
        for failure in &parse_outcome.failures {
            state.warnings.push(format!("parse fallback: {}", failure));
        }
        state.cost_records.extend(parse_outcome.cost_records);
        state.parse_method = parse_outcome.method.as_str().to_string();

        let chunks = chunk_pages(
            &state.document_id,
            &parse_outcome.pages,
            self.config.chunking.max_tokens,
            self.config.chunking.overlap_tokens,
        );
        state.chunk_count = chunks.len() as i64;
        stage_done(Stage::Parse, &mut stage_started);

        // ---- BuildHierarchy ----
        let hierarchy = hierarchy::build(&parse_outcome.pages);
        stage_done(Stage::BuildHierarchy, &mut stage_started);

        // ---- ExtractConcepts ----
        let extractor = ConceptExtractor::new(
            self.completion.clone(),
            self.budget.clone(),
            backoff.clone(),
            self.config.extraction.clone(),
        );
        let extract_outcome = extractor.extract(&state.document_id, &chunks, cancel).await;
        state.warnings.extend(extract_outcome.warnings);
        state.cost_records.extend(extract_outcome.cost_records);
        state.enriched_chunks = extract_outcome.enriched_chunks;
        let mut concepts = extract_outcome.concepts;

        if extract_outcome.cancelled {
            let reason = self.cancel_reason(started);
            state.warnings.push(reason);
            return self
                .finish_failed(Stage::ExtractConcepts, state, concepts, Vec::new(), hierarchy)
                .await;
        }
        stage_done(Stage::ExtractConcepts, &mut stage_started);

        // ---- Deduplicate ----
        if let Err(e) = self.embed_concepts(&mut state, &mut concepts).await {
            // Without vectors the deduplicator degrades to its lexical
            // pass and relationship detection has no candidates.
            state
                .warnings
                .push(format!("concept embedding failed: {}", e));
        }
        let dedup_outcome = dedupe(
            concepts,
            &DedupParams {
                similarity_threshold: self.config.dedup.similarity_threshold,
                neighbor_k: self.config.dedup.neighbor_k,
            },
        );
        let concepts = dedup_outcome.concepts;
        state.duplicates_merged = dedup_outcome.merges as i64;
        tracing::info!(merges = state.duplicates_merged, "deduplication complete");
        stage_done(Stage::Deduplicate, &mut stage_started);

        // ---- DetectRelationships ----
        let detector = RelationshipDetector::new(
            self.completion.clone(),
            self.budget.clone(),
            backoff,
            self.config.relations.clone(),
        );
        let relate_outcome = detector.detect(&state.document_id, &concepts, cancel).await;
        state.warnings.extend(relate_outcome.warnings);
        state.cost_records.extend(relate_outcome.cost_records);
        let relationships = relate_outcome.relationships;

        if relate_outcome.cancelled || relate_outcome.fatal.is_some() {
            if relate_outcome.cancelled {
                let reason = self.cancel_reason(started);
                state.warnings.push(reason);
            }
            if let Some(fatal) = relate_outcome.fatal {
                state
                    .warnings
                    .push(format!("relationship detection aborted: {}", fatal));
            }
            return self
                .finish_failed(
                    Stage::DetectRelationships,
                    state,
                    concepts,
                    relationships,
                    hierarchy,
                )
                .await;
        }
        stage_done(Stage::DetectRelationships, &mut stage_started);

        // ---- PersistCache ----
        document.processed_at = Some(Utc::now().timestamp());
        let mut result = PipelineResult {
            document_id: state.document_id.clone(),
            metrics: state.metrics(),
            concepts,
            relationships,
            hierarchy,
            stage_reached: Stage::Done,
            warnings: std::mem::take(&mut state.warnings),
        };

        let persisted = async {
            store::upsert_document(&self.pool, &document).await?;
            store::persist_result(&self.pool, &result).await?;
            store::append_cost_records(&self.pool, &state.cost_records).await?;
            cache
                .store(
                    &document.content_hash,
                    &result,
                    self.config.pipeline.cache_ttl_days,
                )
                .await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = persisted {
            result.warnings.push(format!("persistence failed: {}", e));
            result.stage_reached = Stage::PersistCache;
            result.metrics.duration_ms = started.elapsed().as_millis() as i64;
            return Ok(result);
        }
        stage_done(Stage::PersistCache, &mut stage_started);

        // ---- Done ----
        result.metrics.duration_ms = started.elapsed().as_millis() as i64;
        reporter.report(Stage::Done, Stage::Done.fraction());
        tracing::info!(
            concepts = result.concepts.len(),
            relationships = result.relationships.len(),
            total_cost = result.metrics.total_cost,
            duration_ms = result.metrics.duration_ms,
            "pipeline complete"
        );
        Ok(result)
    }

    /// Batch-embed `"term: definition"` for every concept.
    async fn embed_concepts(
        &self,
        state: &mut RunState,
        concepts: &mut [Concept],
    ) -> Result<(), ServiceError> {
        if concepts.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = concepts
            .iter()
            .map(|c| format!("{}: {}", c.term, c.definition))
            .collect();

        self.budget.acquire("embedding").await?;
        let backoff = BackoffPolicy::from_config(&self.config.retry);
        let vectors =
            retry_with_backoff(&backoff, "embed", || self.embedding.embed(&texts)).await?;

        let input_units: i64 = texts.iter().map(|t| t.len() as i64 / 4).sum();
        state.cost_records.push(self.budget.record(
            &state.document_id,
            "embedding",
            input_units,
            0,
        ));

        for (concept, vector) in concepts.iter_mut().zip(vectors) {
            concept.embedding = Some(vector);
        }
        Ok(())
    }

    fn cancel_reason(&self, started: Instant) -> String {
        let ceiling = Duration::from_secs(self.config.pipeline.max_duration_secs);
        if started.elapsed() >= ceiling {
            format!(
                "wall-clock ceiling of {}s exceeded",
                self.config.pipeline.max_duration_secs
            )
        } else {
            "processing cancelled".to_string()
        }
    }

    /// Terminal `FailedAt(stage)`: return partial results tagged with the
    /// failing stage. Cost records are still appended; the spend happened.
    async fn finish_failed(
        &self,
        stage: Stage,
        mut state: RunState,
        concepts: Vec<Concept>,
        relationships: Vec<Relationship>,
        hierarchy: SectionNode,
    ) -> Result<PipelineResult> {
        tracing::warn!(
            stage = stage.as_str(),
            "pipeline failed; returning partial results"
        );
        if let Err(e) = store::append_cost_records(&self.pool, &state.cost_records).await {
            tracing::warn!(error = %e, "failed to append cost records");
        }

        Ok(PipelineResult {
            document_id: state.document_id.clone(),
            metrics: state.metrics(),
            concepts,
            relationships,
            hierarchy,
            stage_reached: stage,
            warnings: std::mem::take(&mut state.warnings),
        })
    }
}
