//! # CFR Acquisition & Indexing Pipeline
//!
//! ## Overview
//! This library acquires, normalizes and indexes the Code of Federal
//! Regulations from two independent upstream sources (the eCFR API and the
//! govinfo bulk-data archive), persists it with incremental-refresh
//! semantics, and serves similarity queries over leaf sections.
//!
//! ## Architecture
//! The system is composed of several key modules:
//! - `fetch`: backoff retrier, source racer, and the two upstream sources
//! - `extract`: hierarchical XML extractor with bottom-up word counts
//! - `store`: sled-backed persistence with transactional period upserts
//! - `similarity`: per-group TF-IDF cosine similarity and a global ANN index
//! - `pipeline`: orchestrator driving the (title x period) work matrix
//! - `config`: configuration management and settings
//! - `errors`: centralized error handling and types
//!
//! ## Input/Output Specification
//! - **Input**: eCFR API XML/JSON, govinfo bulk CFR XML
//! - **Output**: persisted section records, aggregate word counts, top-k
//!   similar-section results
//!
//! ## Usage
//! ```rust,no_run
//! use cfr_pipeline::{Config, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let pipeline = Pipeline::new(config).await?;
//!     let summary = pipeline.run_current().await?;
//!     println!("Fetched {}/{} titles", summary.succeeded, summary.attempted);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod extract;
pub mod fetch;
pub mod pipeline;
pub mod similarity;
pub mod store;

// Re-exports for convenience
pub use config::Config;
pub use errors::{PipelineError, Result};
pub use pipeline::{Pipeline, RunSummary};
pub use store::CorpusStore;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A discrete snapshot of the corpus: the live eCFR data or a published
/// annual edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    /// The current, continuously amended eCFR data.
    Current,
    /// A historical annual edition from the govinfo archive.
    Annual(u16),
}

impl Period {
    /// Storage key for this period. `0` is the current data, any other
    /// value is an annual edition year.
    pub fn key(&self) -> u16 {
        match self {
            Period::Current => 0,
            Period::Annual(year) => *year,
        }
    }

    pub fn from_key(key: u16) -> Self {
        if key == 0 {
            Period::Current
        } else {
            Period::Annual(key)
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Current => write!(f, "current"),
            Period::Annual(year) => write!(f, "{}", year),
        }
    }
}

/// Metadata for a CFR title as reported by the eCFR titles endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleMetadata {
    /// Title number (1..=50)
    pub number: u16,
    /// Display name
    pub name: String,
    /// Date of the most recent amendment
    pub latest_amended_on: Option<String>,
    /// Most recent issue date; parameterizes full-title fetches
    pub latest_issue_date: Option<String>,
    /// Date through which the data is current
    pub up_to_date_as_of: Option<String>,
    /// Whole title is reserved (e.g. title 35)
    pub reserved: bool,
}

/// An agency that administers one or more (title, chapter) pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agency {
    /// Stable natural key
    pub slug: String,
    pub name: String,
    pub short_name: Option<String>,
    pub display_name: Option<String>,
    /// Parent agency slug; agencies form a tree, never a cycle
    pub parent_slug: Option<String>,
}

/// Maps an agency to a (title, chapter) pair it administers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfrReference {
    pub agency_slug: String,
    pub title: u16,
    pub chapter: String,
}

/// The ordered hierarchy path identifying a leaf section. Levels that do
/// not apply for a given title are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectionPath {
    pub title: u16,
    pub chapter: Option<String>,
    pub subchapter: Option<String>,
    pub part: Option<String>,
    pub subpart: Option<String>,
    /// Section identifier, e.g. "73.1208"
    pub section: String,
}

impl SectionPath {
    /// The sequence of internal hierarchy prefixes this leaf rolls up
    /// into, outermost first: title, title/chapter, ... title/../subpart.
    /// Missing levels stay as empty components so aggregate rows remain
    /// addressable by position.
    pub fn ancestor_prefixes(&self) -> Vec<String> {
        let levels = [
            self.chapter.as_deref().unwrap_or(""),
            self.subchapter.as_deref().unwrap_or(""),
            self.part.as_deref().unwrap_or(""),
            self.subpart.as_deref().unwrap_or(""),
        ];
        let mut prefixes = Vec::with_capacity(5);
        let mut current = self.title.to_string();
        prefixes.push(current.clone());
        for level in levels {
            current.push('/');
            current.push_str(level);
            prefixes.push(current.clone());
        }
        prefixes
    }
}

impl fmt::Display for SectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "title {} \u{a7} {}", self.title, self.section)
    }
}

/// The leaf unit of the corpus: a single regulation section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub path: SectionPath,
    pub heading: String,
    pub text: String,
    /// Whitespace-token count of `text`; always 0 for reserved sections
    pub word_count: u64,
    /// Text withheld or placeholder-only
    pub reserved: bool,
}

/// Natural ordering for section identifiers, sorting numeric components
/// numerically ("1.2" before "1.10"). Components with letter suffixes
/// ("3a") compare by numeric prefix first, so "73.3a" sits between
/// "73.3" and "73.4".
pub fn compare_section_ids(a: &str, b: &str) -> Ordering {
    fn runs(part: &str) -> Vec<(u8, u64, &str)> {
        let bytes = part.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let digits = bytes[i].is_ascii_digit();
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() == digits {
                i += 1;
            }
            let run = &part[start..i];
            match run.parse::<u64>() {
                Ok(n) if digits => out.push((0, n, "")),
                _ => out.push((1, 0, run)),
            }
        }
        out
    }
    fn key(section: &str) -> Vec<Vec<(u8, u64, &str)>> {
        section.split('.').map(runs).collect()
    }
    key(a).cmp(&key(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_key_round_trip() {
        assert_eq!(Period::from_key(Period::Current.key()), Period::Current);
        assert_eq!(Period::from_key(Period::Annual(2020).key()), Period::Annual(2020));
        assert_eq!(Period::Current.key(), 0);
    }

    #[test]
    fn ancestor_prefixes_cover_all_internal_levels() {
        let path = SectionPath {
            title: 47,
            chapter: Some("I".into()),
            subchapter: Some("C".into()),
            part: Some("73".into()),
            subpart: None,
            section: "73.1208".into(),
        };
        assert_eq!(
            path.ancestor_prefixes(),
            vec![
                "47".to_string(),
                "47/I".to_string(),
                "47/I/C".to_string(),
                "47/I/C/73".to_string(),
                "47/I/C/73/".to_string(),
            ]
        );
    }

    #[test]
    fn section_ids_order_numerically() {
        let mut ids = vec!["1.10", "1.2", "2.1", "1.2a"];
        ids.sort_by(|a, b| compare_section_ids(a, b));
        assert_eq!(ids, vec!["1.2", "1.2a", "1.10", "2.1"]);
    }

    #[test]
    fn lettered_suffixes_sort_beside_their_base_section() {
        let mut ids = vec!["73.10", "73.3a", "73.3", "73.4", "73.3b"];
        ids.sort_by(|a, b| compare_section_ids(a, b));
        assert_eq!(ids, vec!["73.3", "73.3a", "73.3b", "73.4", "73.10"]);
    }
}
