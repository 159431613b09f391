//! End-to-end pipeline tests with mock external services.
//!
//! Drives [`docgraph::pipeline::Pipeline`] against synthesized PDFs and
//! scripted service mocks: cache idempotence, the partial-failure
//! contract, fallback-chain ordering, and the virtual-machine extraction
//! scenario.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use docgraph::budget::SharedBudget;
use docgraph::config::{
    BudgetConfig, ChunkingConfig, ClassifyConfig, Config, DbConfig, DedupConfig, EndpointConfig,
    ExtractionConfig, PipelineConfig, RelationsConfig, RetryConfig, ServicesConfig,
};
use docgraph::error::ServiceError;
use docgraph::pipeline::Pipeline;
use docgraph::progress::NoProgress;
use docgraph::services::{
    CompletionOutput, CompletionService, EmbeddingService, OcrService,
};
use docgraph_core::chunk::PageText;
use docgraph_core::models::{normalize_term, Stage};

// ============ PDF synthesis ============

/// Build a small multi-page PDF, one content stream per page.
fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let stream_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => stream_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save pdf");
    bytes
}

const VM_PAGE_1: &str = "A Virtual Machine is a software emulation of a physical computer. \
     The virtual machine runs an operating system on shared hardware. \
     Hypervisors manage each virtual machine and isolate the operating system.";
const VM_PAGE_2: &str = "Containers share the host kernel instead of emulating hardware. \
     Containers start faster than a virtual machine in most workloads.";
const VM_PAGE_3: &str = "Orchestration platforms schedule containers across many hosts. \
     Scheduling decisions balance resource usage across the cluster.";

fn vm_pdf() -> Vec<u8> {
    pdf_with_pages(&[VM_PAGE_1, VM_PAGE_2, VM_PAGE_3])
}

// ============ Mock services ============

const CONCEPTS_ENVELOPE: &str = "<concepts><concept>\
    <term>Hypervisor</term>\
    <definition>Software that manages virtual machines.</definition>\
    <source>Hypervisors manage each virtual machine.</source>\
    </concept></concepts>";

const RELATION_ENVELOPE: &str = "<relation><kind>prerequisite</kind>\
    <confidence>0.8</confidence><category>sequential</category></relation>";

/// Completion mock with separately scripted behavior for enrichment and
/// relationship prompts.
struct MockCompletion {
    concept_calls: AtomicU32,
    relation_calls: AtomicU32,
    concept_response: Result<String, fn() -> ServiceError>,
    relation_response: Result<String, fn() -> ServiceError>,
}

impl MockCompletion {
    fn new(
        concept_response: Result<String, fn() -> ServiceError>,
        relation_response: Result<String, fn() -> ServiceError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            concept_calls: AtomicU32::new(0),
            relation_calls: AtomicU32::new(0),
            concept_response,
            relation_response,
        })
    }

    fn well_behaved() -> Arc<Self> {
        Self::new(
            Ok(CONCEPTS_ENVELOPE.to_string()),
            Ok(RELATION_ENVELOPE.to_string()),
        )
    }
}

#[async_trait]
impl CompletionService for MockCompletion {
    async fn complete(
        &self,
        prompt: &str,
        _max_output_units: i64,
    ) -> Result<CompletionOutput, ServiceError> {
        let scripted = if prompt.starts_with("Classify the relationship") {
            self.relation_calls.fetch_add(1, Ordering::SeqCst);
            &self.relation_response
        } else {
            self.concept_calls.fetch_add(1, Ordering::SeqCst);
            &self.concept_response
        };
        match scripted {
            Ok(text) => Ok(CompletionOutput {
                text: text.clone(),
                input_units: 200,
                output_units: 80,
            }),
            Err(make) => Err(make()),
        }
    }
}

/// Deterministic embedding mock: signed 16-dim vector from a SHA-256 of
/// the text, so distinct terms land far apart and reruns are identical.
struct MockEmbedding;

#[async_trait]
impl EmbeddingService for MockEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts
            .iter()
            .map(|text| {
                let digest = Sha256::digest(text.as_bytes());
                digest
                    .iter()
                    .take(16)
                    .map(|&b| (b as f32 - 127.5) / 127.5)
                    .collect()
            })
            .collect())
    }
}

/// OCR mock that records calls and returns scripted pages or an error.
struct MockOcr {
    calls: AtomicU32,
    response: Result<Vec<(i64, String)>, fn() -> ServiceError>,
}

impl MockOcr {
    fn unused() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            response: Ok(Vec::new()),
        })
    }

    fn with_pages(pages: Vec<(i64, String)>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            response: Ok(pages),
        })
    }

    fn failing(make: fn() -> ServiceError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            response: Err(make),
        })
    }
}

#[async_trait]
impl OcrService for MockOcr {
    async fn recognize(
        &self,
        _document: &[u8],
        _page_count: i64,
    ) -> Result<Vec<PageText>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(pages) => Ok(pages
                .iter()
                .map(|(n, t)| PageText::new(*n, t.clone()))
                .collect()),
            Err(make) => Err(make()),
        }
    }
}

// ============ Harness ============

fn test_config(dir: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("dgx.sqlite"),
        },
        chunking: ChunkingConfig::default(),
        classify: ClassifyConfig {
            sample_pages: 5,
            // Synthesized pages carry one short paragraph each.
            min_chars_per_page: 40,
            scanned_ratio: 0.8,
        },
        extraction: ExtractionConfig {
            inter_chunk_delay_ms: 0,
            ..ExtractionConfig::default()
        },
        dedup: DedupConfig::default(),
        relations: RelationsConfig::default(),
        budget: BudgetConfig {
            calls_per_minute: 10_000,
            calls_per_day: 100_000,
            daily_budget_usd: 100.0,
        },
        retry: RetryConfig {
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 10,
            max_attempts: 5,
        },
        pipeline: PipelineConfig::default(),
        services: ServicesConfig {
            completion: EndpointConfig::default(),
            embedding: EndpointConfig::default(),
            ocr: EndpointConfig::default(),
        },
    }
}

async fn pipeline_with(
    dir: &TempDir,
    completion: Arc<dyn CompletionService>,
    ocr: Arc<dyn OcrService>,
) -> Pipeline {
    let config = test_config(dir);
    let pool = docgraph::db::connect(&config.db.path).await.unwrap();
    docgraph::migrate::run_migrations(&pool).await.unwrap();
    Pipeline::new(
        pool,
        SharedBudget::new(&config.budget),
        completion,
        Arc::new(MockEmbedding),
        ocr,
        config,
    )
}

// ============ Tests ============

#[tokio::test]
async fn scenario_virtual_machine_concept() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_with(&dir, MockCompletion::well_behaved(), MockOcr::unused()).await;

    let result = pipeline
        .process(&vm_pdf(), CancellationToken::new(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(result.stage_reached, Stage::Done);
    assert_eq!(result.metrics.parse_method, "structured");
    assert!(!result.metrics.cache_hit);

    let vm = result
        .concepts
        .iter()
        .filter(|c| c.is_canonical())
        .find(|c| normalize_term(&c.term) == "virtual machine")
        .expect("virtual machine concept");
    assert!(vm.confidence > 0.0);
    assert_eq!(vm.page_number, 1);
    assert!(vm.methods_found.len() >= 2);
}

#[tokio::test]
async fn cache_hit_on_second_upload() {
    let dir = TempDir::new().unwrap();
    let ocr = MockOcr::unused();
    let pipeline = pipeline_with(&dir, MockCompletion::well_behaved(), ocr.clone()).await;
    let bytes = vm_pdf();

    let first = pipeline
        .process(&bytes, CancellationToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(first.stage_reached, Stage::Done);
    assert!(!first.metrics.cache_hit);

    let second = pipeline
        .process(&bytes, CancellationToken::new(), &NoProgress)
        .await
        .unwrap();
    assert!(second.metrics.cache_hit);
    assert_eq!(second.stage_reached, Stage::Done);
    assert_eq!(second.document_id, first.document_id);

    // Identical content modulo timestamps.
    let terms = |r: &docgraph_core::models::PipelineResult| {
        let mut t: Vec<String> = r.concepts.iter().map(|c| c.normalized_term()).collect();
        t.sort();
        t
    };
    assert_eq!(terms(&first), terms(&second));
    assert_eq!(first.relationships.len(), second.relationships.len());
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn relationship_failure_returns_partial_results() {
    let dir = TempDir::new().unwrap();
    let completion = MockCompletion::new(
        Ok(CONCEPTS_ENVELOPE.to_string()),
        Err(|| ServiceError::BadRequest("scripted relation failure".into())),
    );
    let pipeline = pipeline_with(&dir, completion.clone(), MockOcr::unused()).await;

    let result = pipeline
        .process(&vm_pdf(), CancellationToken::new(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(result.stage_reached, Stage::DetectRelationships);
    assert!(!result.concepts.is_empty());
    assert!(result.relationships.is_empty());
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("relationship detection aborted")));
    // One attempt, not one per candidate pair.
    assert_eq!(completion.relation_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn relationships_detected_on_success() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_with(&dir, MockCompletion::well_behaved(), MockOcr::unused()).await;

    let result = pipeline
        .process(&vm_pdf(), CancellationToken::new(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(result.stage_reached, Stage::Done);
    assert!(!result.relationships.is_empty());
    for rel in &result.relationships {
        assert_ne!(rel.from_concept, rel.to_concept);
        assert!(rel.strength > 0.0 && rel.strength <= 1.0);
        assert_eq!(rel.kind.as_str(), "prerequisite");
    }
}

#[tokio::test]
async fn scanned_document_uses_ocr_before_plaintext() {
    let dir = TempDir::new().unwrap();
    // Pages below the digital character threshold classify as scanned.
    let bytes = pdf_with_pages(&["p1", "p2", "p3"]);
    let ocr = MockOcr::with_pages(vec![
        (1, "Recognized text from page one. It mentions entropy twice: entropy.".to_string()),
        (2, "Recognized text from page two about osmosis and entropy.".to_string()),
    ]);
    let pipeline = pipeline_with(&dir, MockCompletion::well_behaved(), ocr.clone()).await;

    let result = pipeline
        .process(&bytes, CancellationToken::new(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.metrics.parse_method, "ocr");
    // Structured parsing is never attempted for a scanned document.
    assert!(!result
        .warnings
        .iter()
        .any(|w| w.contains("structured parse failed")));
}

#[tokio::test]
async fn ocr_failure_falls_through_to_plaintext() {
    let dir = TempDir::new().unwrap();
    let bytes = pdf_with_pages(&["p1", "p2", "p3"]);
    let ocr = MockOcr::failing(|| ServiceError::Transport("ocr offline".into()));
    let pipeline = pipeline_with(&dir, MockCompletion::well_behaved(), ocr.clone()).await;

    let result = pipeline
        .process(&bytes, CancellationToken::new(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("OCR parse failed")));
    // The run still produced a (possibly empty) result via plain text.
    assert_eq!(result.metrics.parse_method, "plaintext");
}

#[tokio::test]
async fn cancelled_run_returns_partial_tagged_result() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_with(&dir, MockCompletion::well_behaved(), MockOcr::unused()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = pipeline
        .process(&vm_pdf(), cancel, &NoProgress)
        .await
        .unwrap();

    assert_eq!(result.stage_reached, Stage::ExtractConcepts);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("cancelled")));
}

#[tokio::test]
async fn costs_are_recorded_for_failed_runs() {
    let dir = TempDir::new().unwrap();
    let completion = MockCompletion::new(
        Ok(CONCEPTS_ENVELOPE.to_string()),
        Err(|| ServiceError::BadRequest("scripted relation failure".into())),
    );
    let config = test_config(&dir);
    let pool = docgraph::db::connect(&config.db.path).await.unwrap();
    docgraph::migrate::run_migrations(&pool).await.unwrap();
    let pipeline = Pipeline::new(
        pool.clone(),
        SharedBudget::new(&config.budget),
        completion,
        Arc::new(MockEmbedding),
        MockOcr::unused(),
        config,
    );

    let result = pipeline
        .process(&vm_pdf(), CancellationToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(result.stage_reached, Stage::DetectRelationships);

    // The embedding call (at least) was spent and must be on the ledger.
    let summary = docgraph::store::cost_summary(&pool).await.unwrap();
    assert!(summary.iter().any(|(service, _, _)| service == "embedding"));
}
