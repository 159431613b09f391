//! Fallback parser chain: Structured → OCR → PlainText.
//!
//! A state machine over ordered parse strategies. The classifier picks the
//! starting point (`Scanned` documents begin at OCR); each strategy either
//! produces per-page text or raises a typed failure, in which case the next
//! strategy is tried with the whole document. When every strategy fails the
//! stage is parse-fatal ([`ParseError::Exhausted`]), the only failure that
//! aborts a document before any concept work.

use std::sync::Arc;

use docgraph_core::chunk::PageText;
use docgraph_core::models::{CostRecord, DocType};

use crate::budget::SharedBudget;
use crate::error::{ParseError, ServiceError};
use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::services::OcrService;

/// Minimum non-whitespace characters per page for a structured parse to
/// count as successful; sparser yields fall through to OCR.
const MIN_STRUCTURED_CHARS_PER_PAGE: usize = 25;
/// Maximum tolerated ratio of replacement characters when decoding
/// non-PDF bytes as plain text.
const MAX_REPLACEMENT_RATIO: f64 = 0.2;

/// The parse strategies, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Structured,
    Ocr,
    PlainText,
}

impl ParseStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStrategy::Structured => "structured",
            ParseStrategy::Ocr => "ocr",
            ParseStrategy::PlainText => "plaintext",
        }
    }
}

/// Successful parse: per-page text, the strategy that produced it, and
/// any typed failures from earlier strategies in the chain.
#[derive(Debug)]
pub struct ParseOutcome {
    pub pages: Vec<PageText>,
    pub method: ParseStrategy,
    pub failures: Vec<String>,
    pub cost_records: Vec<CostRecord>,
}

/// Ordered-strategy parser with injected OCR service and shared budget.
pub struct FallbackParser {
    ocr: Arc<dyn OcrService>,
    budget: Arc<SharedBudget>,
    backoff: BackoffPolicy,
}

impl FallbackParser {
    pub fn new(ocr: Arc<dyn OcrService>, budget: Arc<SharedBudget>, backoff: BackoffPolicy) -> Self {
        Self {
            ocr,
            budget,
            backoff,
        }
    }

    /// Strategy order for a classified document type. `Scanned` starts at
    /// OCR; everything falls through to PlainText as last resort.
    pub fn chain_for(doc_type: DocType) -> &'static [ParseStrategy] {
        match doc_type {
            DocType::Digital | DocType::Hybrid => &[
                ParseStrategy::Structured,
                ParseStrategy::Ocr,
                ParseStrategy::PlainText,
            ],
            DocType::Scanned => &[ParseStrategy::Ocr, ParseStrategy::PlainText],
        }
    }

    /// Run the chain until a strategy succeeds.
    pub async fn parse(
        &self,
        document_id: &str,
        bytes: &[u8],
        doc_type: DocType,
        page_count: i64,
    ) -> Result<ParseOutcome, ParseError> {
        let mut failures: Vec<String> = Vec::new();
        let mut cost_records: Vec<CostRecord> = Vec::new();

        for &strategy in Self::chain_for(doc_type) {
            let attempt = match strategy {
                ParseStrategy::Structured => self.parse_structured(bytes),
                ParseStrategy::Ocr => {
                    self.parse_ocr(document_id, bytes, page_count, &mut cost_records)
                        .await
                }
                ParseStrategy::PlainText => self.parse_plain(bytes),
            };

            match attempt {
                Ok(pages) => {
                    tracing::info!(
                        method = strategy.as_str(),
                        pages = pages.len(),
                        "parse strategy succeeded"
                    );
                    return Ok(ParseOutcome {
                        pages,
                        method: strategy,
                        failures,
                        cost_records,
                    });
                }
                Err(e) => {
                    tracing::warn!(method = strategy.as_str(), error = %e, "parse strategy failed");
                    failures.push(e.to_string());
                }
            }
        }

        Err(ParseError::Exhausted)
    }

    /// Structure-preserving parse: per-page text with page numbers.
    fn parse_structured(&self, bytes: &[u8]) -> Result<Vec<PageText>, ParseError> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| ParseError::Structured(e.to_string()))?;

        if pages.is_empty() {
            return Err(ParseError::Structured("no pages extracted".to_string()));
        }

        let total_chars: usize = pages
            .iter()
            .map(|p| p.chars().filter(|c| !c.is_whitespace()).count())
            .sum();
        if total_chars < MIN_STRUCTURED_CHARS_PER_PAGE * pages.len() {
            return Err(ParseError::Structured(format!(
                "text yield too sparse: {} chars across {} pages",
                total_chars,
                pages.len()
            )));
        }

        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| PageText::new(i as i64 + 1, text))
            .collect())
    }

    /// OCR parse through the injected service, with budget and backoff.
    async fn parse_ocr(
        &self,
        document_id: &str,
        bytes: &[u8],
        page_count: i64,
        cost_records: &mut Vec<CostRecord>,
    ) -> Result<Vec<PageText>, ParseError> {
        self.budget
            .acquire("ocr")
            .await
            .map_err(|e| ParseError::Ocr(e.to_string()))?;

        let result: Result<Vec<PageText>, ServiceError> =
            retry_with_backoff(&self.backoff, "ocr", || {
                self.ocr.recognize(bytes, page_count)
            })
            .await;

        match result {
            Ok(pages) => {
                cost_records.push(self.budget.record(
                    document_id,
                    "ocr",
                    page_count.max(pages.len() as i64),
                    0,
                ));
                if pages.iter().all(|p| p.text.trim().is_empty()) {
                    return Err(ParseError::Ocr("OCR produced no text".to_string()));
                }
                Ok(pages)
            }
            Err(e) => Err(ParseError::Ocr(e.to_string())),
        }
    }

    /// Last-resort plain-text extraction; page metadata is lost, so chunks
    /// downstream carry the sentinel page.
    fn parse_plain(&self, bytes: &[u8]) -> Result<Vec<PageText>, ParseError> {
        if let Ok(text) = pdf_extract::extract_text_from_mem(bytes) {
            if !text.trim().is_empty() {
                return Ok(vec![PageText::unpaged(text)]);
            }
        }

        let text = String::from_utf8_lossy(bytes);
        let replacements = text.chars().filter(|&c| c == '\u{FFFD}').count();
        let total = text.chars().count().max(1);
        if text.trim().is_empty() || replacements as f64 / total as f64 > MAX_REPLACEMENT_RATIO {
            return Err(ParseError::PlainText(
                "bytes are not decodable text".to_string(),
            ));
        }
        Ok(vec![PageText::unpaged(text.into_owned())])
    }
}
