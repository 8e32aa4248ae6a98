//! # Pipeline Orchestrator
//!
//! ## Purpose
//! Drives the acquisition matrix: for each requested period, fetch every
//! in-scope title (racing the two upstream sources with per-source
//! retry), extract its sections, and persist the unit atomically.
//!
//! ## Input/Output Specification
//! - **Input**: validated configuration, the two upstream sources
//! - **Output**: a populated corpus store and a per-run summary
//!
//! ## Key Features
//! - Bounded fan-out: at most `worker_budget` titles in flight at once
//! - Periods run strictly one after another; titles inside a period run
//!   concurrently
//! - Fresh units are skipped without touching the network
//! - A failed title never aborts the run; it is counted and logged

use crate::config::Config;
use crate::errors::{PipelineError, Result};
use crate::extract::{aggregate_word_counts, Extraction, Extractor};
use crate::fetch::{
    first_success, retry, DocumentRequest, EcfrApiSource, GovinfoBulkSource, RawTitleDocument,
    RetryPolicy, TitleSource,
};
use crate::similarity::SimilarityEngine;
use crate::store::CorpusStore;
use crate::Period;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome counters for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Units that needed work
    pub attempted: usize,
    pub succeeded: usize,
    /// Units skipped because the stored data was fresh
    pub skipped: usize,
    pub failed: usize,
    pub sections: usize,
    pub words: u64,
}

impl RunSummary {
    fn merge(&mut self, other: &RunSummary) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.sections += other.sections;
        self.words += other.words;
    }
}

enum TitleOutcome {
    SkippedFresh,
    Stored { sections: usize, words: u64 },
}

/// The acquisition pipeline.
pub struct Pipeline {
    config: Config,
    store: Arc<CorpusStore>,
    similarity: SimilarityEngine,
    extractor: Extractor,
    /// Concrete handle for the metadata endpoints; absent when the
    /// pipeline was built over injected sources
    metadata: Option<Arc<EcfrApiSource>>,
    primary: Arc<dyn TitleSource>,
    secondary: Arc<dyn TitleSource>,
}

impl Pipeline {
    /// Build a pipeline over the real upstream sources.
    pub async fn new(config: Config) -> Result<Self> {
        let ecfr = Arc::new(EcfrApiSource::new(&config.sources)?);
        let govinfo = Arc::new(GovinfoBulkSource::new(&config.sources)?);
        let mut pipeline = Self::with_sources(
            config,
            Arc::clone(&ecfr) as Arc<dyn TitleSource>,
            govinfo as Arc<dyn TitleSource>,
        )?;
        pipeline.metadata = Some(ecfr);
        Ok(pipeline)
    }

    /// Build a pipeline over arbitrary title sources. Metadata refresh is
    /// disabled on this path.
    pub fn with_sources(
        config: Config,
        primary: Arc<dyn TitleSource>,
        secondary: Arc<dyn TitleSource>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(CorpusStore::open(&config.storage)?);
        let similarity = SimilarityEngine::new(Arc::clone(&store), config.similarity.clone());
        Ok(Self {
            config,
            store,
            similarity,
            extractor: Extractor::new(),
            metadata: None,
            primary,
            secondary,
        })
    }

    pub fn store(&self) -> &CorpusStore {
        &self.store
    }

    pub fn similarity(&self) -> &SimilarityEngine {
        &self.similarity
    }

    /// Acquire the current period: refresh upstream metadata, then fetch
    /// every stale in-scope title. A run over an entirely fresh store
    /// touches the network not at all, metadata endpoints included.
    pub async fn run_current(&self) -> Result<RunSummary> {
        let mut titles = self.in_scope_titles()?;
        let any_stale = titles
            .iter()
            .any(|&t| !matches!(self.store.is_fresh(&Period::Current, t), Ok(true)));
        if any_stale {
            self.refresh_metadata().await;
            titles = self.in_scope_titles()?;
        }
        self.process_period(Period::Current, titles).await
    }

    /// Acquire the configured annual editions, one period at a time.
    pub async fn run_historical(&self) -> Result<RunSummary> {
        let mut total = RunSummary::default();
        for &year in &self.config.fetch.historical_years {
            let titles = self.in_scope_titles()?;
            let summary = self.process_period(Period::Annual(year), titles).await?;
            info!(
                year,
                succeeded = summary.succeeded,
                skipped = summary.skipped,
                failed = summary.failed,
                "annual edition processed"
            );
            total.merge(&summary);
        }
        Ok(total)
    }

    /// Current period first, then the annual editions. Builds the global
    /// similarity index afterwards when enabled.
    pub async fn run_all(&self) -> Result<RunSummary> {
        let mut summary = self.run_current().await?;
        summary.merge(&self.run_historical().await?);

        if self.config.similarity.enable_global_index {
            self.build_global_index(&Period::Current)?;
        }
        Ok(summary)
    }

    /// Batch-build the corpus-wide similarity index for one period.
    pub fn build_global_index(&self, period: &Period) -> Result<usize> {
        let indexed = self
            .similarity
            .build_global_index(period, &self.config.fetch.titles())?;
        info!(%period, indexed, "global similarity index built");
        Ok(indexed)
    }

    /// Refresh title and agency metadata from the eCFR API. Failures are
    /// logged and the run continues on whatever metadata is stored.
    async fn refresh_metadata(&self) {
        let ecfr = match &self.metadata {
            Some(ecfr) => ecfr,
            None => return,
        };
        let policy = RetryPolicy::from(&self.config.fetch);

        match retry(policy, "titles-metadata", |_| ecfr.fetch_titles_metadata()).await {
            Ok(titles) => {
                if let Err(e) = self.store.save_titles(&titles) {
                    warn!(error = %e, "failed to persist title metadata");
                }
            }
            Err(e) => warn!(error = %e, "title metadata refresh failed, using stored metadata"),
        }

        match retry(policy, "agencies", |_| ecfr.fetch_agencies()).await {
            Ok((agencies, refs)) => {
                if let Err(e) = self.store.save_agencies(&agencies, &refs) {
                    warn!(error = %e, "failed to persist agency metadata");
                }
            }
            Err(e) => warn!(error = %e, "agency metadata refresh failed, using stored metadata"),
        }
    }

    /// Configured title range minus exclusions and titles the upstream
    /// metadata marks as wholly reserved.
    fn in_scope_titles(&self) -> Result<Vec<u16>> {
        let mut titles = self.config.fetch.titles();
        let mut reserved = Vec::new();
        titles.retain(|&t| match self.store.get_title(t) {
            Ok(Some(meta)) if meta.reserved => {
                reserved.push(t);
                false
            }
            _ => true,
        });
        if !reserved.is_empty() {
            debug!(?reserved, "skipping reserved titles");
        }
        Ok(titles)
    }

    /// Process every title of one period with bounded concurrency.
    async fn process_period(&self, period: Period, titles: Vec<u16>) -> Result<RunSummary> {
        let outcomes: Vec<(u16, Result<TitleOutcome>)> = stream::iter(titles)
            .map(|title| async move { (title, self.process_title(period, title).await) })
            .buffer_unordered(self.config.fetch.worker_budget)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for (title, outcome) in outcomes {
            match outcome {
                Ok(TitleOutcome::SkippedFresh) => summary.skipped += 1,
                Ok(TitleOutcome::Stored { sections, words }) => {
                    summary.attempted += 1;
                    summary.succeeded += 1;
                    summary.sections += sections;
                    summary.words += words;
                }
                Err(e) => {
                    summary.attempted += 1;
                    summary.failed += 1;
                    error!(title, %period, error = %e, "title acquisition failed");
                }
            }
        }
        Ok(summary)
    }

    /// Fetch, extract and persist a single (period, title) unit.
    async fn process_title(&self, period: Period, title: u16) -> Result<TitleOutcome> {
        if self.store.is_fresh(&period, title)? {
            debug!(title, %period, "unit is fresh, skipping");
            return Ok(TitleOutcome::SkippedFresh);
        }

        let issue_date = match period {
            Period::Current => Some(
                self.store
                    .get_title(title)?
                    .and_then(|m| m.latest_issue_date)
                    .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ),
            Period::Annual(_) => None,
        };
        let request = DocumentRequest {
            title,
            period,
            issue_date,
        };

        let policy = RetryPolicy::from(&self.config.fetch);
        let primary_label = format!("{}:{}:title-{}", self.primary.name(), period, title);
        let secondary_label = format!("{}:{}:title-{}", self.secondary.name(), period, title);
        let win = first_success(
            title,
            &period,
            vec![
                (
                    self.primary.name(),
                    retry(policy, &primary_label, |_| self.primary.fetch_title(&request)).boxed(),
                ),
                (
                    self.secondary.name(),
                    retry(policy, &secondary_label, |_| self.secondary.fetch_title(&request))
                        .boxed(),
                ),
            ],
        )
        .await?;

        let extraction = self.extract_checked(&win.value, title)?;
        let aggregates = aggregate_word_counts(&extraction.sections);
        let words = aggregates.get(&title.to_string()).copied().unwrap_or(0);
        self.store
            .upsert_period(&period, title, &extraction.sections, &aggregates)?;

        info!(
            title,
            %period,
            source = win.source_name,
            sections = extraction.sections.len(),
            words,
            "unit stored"
        );
        Ok(TitleOutcome::Stored {
            sections: extraction.sections.len(),
            words,
        })
    }

    /// A document that yields zero leaves is treated as a failure so a
    /// broken fetch can never mark a unit fresh.
    fn extract_checked(&self, document: &RawTitleDocument, title: u16) -> Result<Extraction> {
        let extraction = self.extractor.extract(document, title)?;
        if extraction.sections.is_empty() {
            return Err(PipelineError::Extraction {
                details: format!("title {} document contained no sections", title),
            });
        }
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE_XML: &str = r#"<?xml version="1.0"?>
<ECFR>
  <DIV1 N="1" TYPE="TITLE">
    <DIV3 N="I" TYPE="CHAPTER">
      <DIV5 N="5" TYPE="PART">
        <DIV8 N="&#167; 5.1" TYPE="SECTION">
          <HEAD>&#167; 5.1 Scope.</HEAD>
          <P>one two three four five</P>
        </DIV8>
        <DIV8 N="&#167; 5.2" TYPE="SECTION">
          <HEAD>&#167; 5.2 Purpose.</HEAD>
          <P>six seven eight</P>
        </DIV8>
      </DIV5>
    </DIV3>
  </DIV1>
</ECFR>"#;

    #[derive(Clone)]
    enum Mode {
        Serve,
        Fail,
        FailTitle(u16),
    }

    struct ScriptedSource {
        name: &'static str,
        mode: Mode,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(name: &'static str, mode: Mode) -> (Arc<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let source = Arc::new(Self {
                name,
                mode,
                calls: Arc::clone(&calls),
            });
            (source, calls)
        }
    }

    #[async_trait]
    impl TitleSource for ScriptedSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_title(&self, request: &DocumentRequest) -> Result<RawTitleDocument> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = match self.mode {
                Mode::Serve => false,
                Mode::Fail => true,
                Mode::FailTitle(t) => request.title == t,
            };
            if fail {
                Err(PipelineError::HttpStatus {
                    source_name: self.name,
                    status: 503,
                })
            } else {
                Ok(RawTitleDocument::Ecfr(SAMPLE_XML.as_bytes().to_vec()))
            }
        }
    }

    fn test_config(dir: &std::path::Path, title_max: u16) -> Config {
        let mut config = Config::default();
        config.storage.db_path = dir.join("cfr.db");
        config.fetch.max_attempts = 2;
        config.fetch.base_delay_secs = 1;
        config.fetch.title_min = 1;
        config.fetch.title_max = title_max;
        config.fetch.excluded_titles = Vec::new();
        config.fetch.historical_years = vec![2020];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn secondary_covers_primary_outage() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, primary_calls) = ScriptedSource::new("flaky", Mode::Fail);
        let (secondary, _) = ScriptedSource::new("steady", Mode::Serve);
        let pipeline =
            Pipeline::with_sources(test_config(dir.path(), 1), primary, secondary).unwrap();

        let summary = pipeline.run_current().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.sections, 2);
        assert_eq!(summary.words, 8);

        // the primary is polled at least once, but the secondary's first
        // success resolves the race and drops it mid-backoff
        let calls = primary_calls.load(Ordering::SeqCst);
        assert!((1..=2).contains(&calls), "primary made {calls} calls");

        let counts = pipeline.store().word_counts(&Period::Current, 1).unwrap();
        assert_eq!(counts.get("1"), Some(&8));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_units_skip_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, primary_calls) = ScriptedSource::new("primary", Mode::Serve);
        let (secondary, secondary_calls) = ScriptedSource::new("secondary", Mode::Serve);
        let pipeline =
            Pipeline::with_sources(test_config(dir.path(), 1), primary, secondary).unwrap();

        pipeline.run_current().await.unwrap();
        let after_first =
            primary_calls.load(Ordering::SeqCst) + secondary_calls.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        let second = pipeline.run_current().await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.attempted, 0);
        let after_second =
            primary_calls.load(Ordering::SeqCst) + secondary_calls.load(Ordering::SeqCst);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_title_does_not_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, _) = ScriptedSource::new("primary", Mode::FailTitle(2));
        let (secondary, _) = ScriptedSource::new("secondary", Mode::FailTitle(2));
        let pipeline =
            Pipeline::with_sources(test_config(dir.path(), 2), primary, secondary).unwrap();

        let summary = pipeline.run_current().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        // the healthy title landed intact
        assert_eq!(
            pipeline
                .store()
                .sections_for_title(&Period::Current, 1)
                .unwrap()
                .len(),
            2
        );
        assert!(pipeline
            .store()
            .sections_for_title(&Period::Current, 2)
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_titles_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, _) = ScriptedSource::new("primary", Mode::Serve);
        let (secondary, _) = ScriptedSource::new("secondary", Mode::Serve);
        let pipeline =
            Pipeline::with_sources(test_config(dir.path(), 8), primary, secondary).unwrap();

        let summary = pipeline.run_current().await.unwrap();
        assert_eq!(summary.succeeded, 8);
        for title in 1..=8 {
            let counts = pipeline.store().word_counts(&Period::Current, title).unwrap();
            assert_eq!(counts.get(&title.to_string()), Some(&8));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn historical_editions_persist_and_stay_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, _) = ScriptedSource::new("primary", Mode::Serve);
        let (secondary, _) = ScriptedSource::new("secondary", Mode::Serve);
        let pipeline =
            Pipeline::with_sources(test_config(dir.path(), 1), primary, secondary).unwrap();

        let summary = pipeline.run_historical().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(pipeline.store().has_period_data(&Period::Annual(2020)).unwrap());

        // annual editions are immutable; the rerun is a no-op
        let rerun = pipeline.run_historical().await.unwrap();
        assert_eq!(rerun.skipped, 1);
        assert_eq!(rerun.attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_covers_both_period_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, _) = ScriptedSource::new("primary", Mode::Serve);
        let (secondary, _) = ScriptedSource::new("secondary", Mode::Serve);
        let mut config = test_config(dir.path(), 1);
        config.similarity.enable_global_index = true;
        // the two tiny sample sections share almost no vocabulary
        config.similarity.min_similarity = 0.0;
        let pipeline = Pipeline::with_sources(config, primary, secondary).unwrap();

        let summary = pipeline.run_all().await.unwrap();
        assert_eq!(summary.succeeded, 2);

        let periods = pipeline.store().list_periods().unwrap();
        assert_eq!(periods, vec![Period::Current, Period::Annual(2020)]);

        // run_all built the global index for the current period
        let query = pipeline
            .store()
            .sections_for_title(&Period::Current, 1)
            .unwrap()
            .remove(0);
        let similar = pipeline
            .similarity()
            .global_similar(&Period::Current, &query.path, None);
        assert_eq!(similar.len(), 1);
    }
}
