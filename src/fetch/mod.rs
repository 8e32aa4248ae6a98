//! # Fetch Layer
//!
//! ## Purpose
//! Acquires raw title documents from two independent upstream sources.
//! Each logical (title, period) request fans out into two physical
//! requests (the eCFR API and the govinfo bulk archive), each wrapped in
//! the backoff retrier, raced through the first-success combinator.
//!
//! ## Architecture
//! - `retry`: bounded exponential-backoff retry around one physical request
//! - `race`: generic first-success-of-N combinator
//! - `sources`: the `TitleSource` trait and the two concrete sources, plus
//!   the metadata endpoints (titles listing, agencies)
//!
//! A response is accepted only once fully retrieved and past minimal
//! structural sniffing; a body that is not even XML-shaped counts as a
//! source failure and is retried/raced like any network error.

pub mod race;
pub mod retry;
pub mod sources;

pub use race::{first_success, RaceWin};
pub use retry::{retry, RetryPolicy};
pub use sources::{EcfrApiSource, GovinfoBulkSource, TitleSource};

use crate::errors::{PipelineError, Result};
use crate::Period;

/// A logical request for one title in one period.
#[derive(Debug, Clone)]
pub struct DocumentRequest {
    pub title: u16,
    pub period: Period,
    /// Issue date (YYYY-MM-DD) for current-period eCFR API requests;
    /// annual periods derive their own date.
    pub issue_date: Option<String>,
}

/// A fully retrieved raw document, before extraction. The two upstream
/// shapes are normalized downstream by the extractor, never leaked past it.
#[derive(Debug, Clone)]
pub enum RawTitleDocument {
    /// Single full-title XML document (eCFR `DIV`/`TYPE` shape)
    Ecfr(Vec<u8>),
    /// Annual-edition volume documents (govinfo multi-volume shape)
    GovinfoVolumes(Vec<Vec<u8>>),
}

impl RawTitleDocument {
    pub fn byte_len(&self) -> usize {
        match self {
            RawTitleDocument::Ecfr(xml) => xml.len(),
            RawTitleDocument::GovinfoVolumes(volumes) => volumes.iter().map(Vec::len).sum(),
        }
    }
}

/// Minimal structural sniffing: a body must be non-empty and XML-shaped.
/// Real parsing is the extractor's job; this only guards against truncated
/// or HTML error-page responses slipping through as successes.
pub fn sniff_xml(source_name: &'static str, body: &[u8]) -> Result<()> {
    let trimmed = body
        .strip_prefix(&[0xEF, 0xBB, 0xBF][..])
        .unwrap_or(body)
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .copied()
        .next();

    match trimmed {
        Some(b'<') => Ok(()),
        Some(_) => Err(PipelineError::MalformedDocument {
            source_name,
            details: "response body is not XML-shaped".into(),
        }),
        None => Err(PipelineError::MalformedDocument {
            source_name,
            details: "empty response body".into(),
        }),
    }
}
