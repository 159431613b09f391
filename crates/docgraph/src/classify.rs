//! Document type classification.
//!
//! Samples a bounded number of pages and measures extracted-character
//! density to decide whether a PDF is digitally native, scanned, or hybrid.
//! The result selects the fallback parser's starting strategy and feeds a
//! pre-processing cost estimate; it is advisory only and never fails the
//! pipeline: classification errors degrade to `Digital` with a warning.

use docgraph_core::models::DocType;

use crate::budget::estimate_cost;
use crate::config::ClassifyConfig;

/// Classification outcome plus the estimated external-service cost of
/// processing the document.
#[derive(Debug, Clone)]
pub struct Classification {
    pub doc_type: DocType,
    pub page_count: i64,
    /// Rough pre-processing estimate: OCR for the non-digital share plus
    /// one enrichment-scale completion call per expected chunk.
    pub cost_hint_usd: f64,
    /// Set when extraction failed and the type defaulted.
    pub warning: Option<String>,
}

/// Classify a document from its raw bytes.
pub fn classify(bytes: &[u8], config: &ClassifyConfig) -> Classification {
    let pages = match pdf_extract::extract_text_from_mem_by_pages(bytes) {
        Ok(pages) => pages,
        Err(e) => {
            return Classification {
                doc_type: DocType::Digital,
                page_count: 0,
                cost_hint_usd: 0.0,
                warning: Some(format!("classification fell back to digital: {}", e)),
            };
        }
    };

    let page_count = pages.len() as i64;
    if pages.is_empty() {
        return Classification {
            doc_type: DocType::Digital,
            page_count: 0,
            cost_hint_usd: 0.0,
            warning: Some("document has no pages".to_string()),
        };
    }

    // Sample pages spread evenly across the document.
    let sample_count = config.sample_pages.max(1).min(pages.len());
    let step = pages.len() as f64 / sample_count as f64;
    let mut non_digital = 0usize;
    for i in 0..sample_count {
        let index = ((i as f64 * step) as usize).min(pages.len() - 1);
        let chars = pages[index].chars().filter(|c| !c.is_whitespace()).count();
        if chars < config.min_chars_per_page {
            non_digital += 1;
        }
    }

    let ratio = non_digital as f64 / sample_count as f64;
    let doc_type = if ratio >= config.scanned_ratio {
        DocType::Scanned
    } else if non_digital > 0 {
        DocType::Hybrid
    } else {
        DocType::Digital
    };

    let scanned_pages = (page_count as f64 * ratio).ceil() as i64;
    let expected_chunks = (page_count / 2).max(1);
    let cost_hint_usd = estimate_cost("ocr", scanned_pages, 0)
        + estimate_cost("completion", expected_chunks * 1200, expected_chunks * 400);

    Classification {
        doc_type,
        page_count,
        cost_hint_usd,
        warning: None,
    }
}
