//! # Similarity Module
//!
//! ## Purpose
//! Serves "sections most similar to this one" queries. The default path
//! builds a TF-IDF model over one peer group (the sections sharing a
//! title or chapter with the query section) and ranks peers by cosine
//! similarity. An opt-in global index covers the whole corpus with an
//! approximate nearest neighbor graph.
//!
//! ## Input/Output Specification
//! - **Input**: a query section path, a period, a result limit
//! - **Output**: peers ranked by descending similarity score in [0, 1]
//!
//! ## Key Features
//! - Per-group models built lazily and cached; a store generation bump
//!   invalidates the cached model
//! - Scores floored at a configured minimum similarity
//! - Degraded-but-available: a model build failure yields an empty
//!   result set with a warning, never a query error

pub mod ann;

use crate::config::{GroupGranularity, SimilarityConfig};
use crate::errors::Result;
use crate::store::CorpusStore;
use crate::{compare_section_ids, Period, Section, SectionPath};
use dashmap::DashMap;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

/// One ranked similarity result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarSection {
    pub path: SectionPath,
    pub heading: String,
    pub score: f32,
}

/// A scored pair of sections from a corpus-wide pair scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarPair {
    pub first: SectionPath,
    pub first_heading: String,
    pub second: SectionPath,
    pub second_heading: String,
    pub score: f32,
}

/// A near-duplicate pair with the full text of both sections attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub pair: SimilarPair,
    pub first_text: String,
    pub second_text: String,
}

/// Corpus-level similarity statistics for one period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityStats {
    /// Pairs at or above the configured minimum similarity
    pub total_pairs: usize,
    /// Titles contributing at least one such pair
    pub titles_with_pairs: usize,
    pub avg_similarity: f32,
    /// Pair counts per score decile, [0.0, 0.1) through [0.9, 1.0]
    pub distribution: [usize; 10],
}

/// The peer group a section is compared within.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub period: Period,
    pub title: u16,
    /// Populated only under chapter granularity
    pub chapter: Option<String>,
}

impl GroupKey {
    fn for_section(period: &Period, path: &SectionPath, granularity: GroupGranularity) -> Self {
        Self {
            period: *period,
            title: path.title,
            chapter: match granularity {
                GroupGranularity::Title => None,
                GroupGranularity::Chapter => path.chapter.clone(),
            },
        }
    }
}

/// TF-IDF weighted sparse vector, L2-normalized, term ids ascending.
pub(crate) type SparseVector = Vec<(u32, f32)>;

/// A built group model: vocabulary-weighted vectors for every member
/// section, ready for cosine ranking.
struct GroupModel {
    /// Store generation the model was built against
    generation: u64,
    members: Vec<GroupMember>,
}

struct GroupMember {
    path: SectionPath,
    heading: String,
    vector: SparseVector,
}

/// Similarity engine over a corpus store.
pub struct SimilarityEngine {
    store: Arc<CorpusStore>,
    config: SimilarityConfig,
    cache: DashMap<GroupKey, Arc<GroupModel>>,
    /// Corpus-wide ANN index, present only after an explicit build
    global: RwLock<HashMap<Period, Arc<ann::GlobalIndex>>>,
}

impl SimilarityEngine {
    pub fn new(store: Arc<CorpusStore>, config: SimilarityConfig) -> Self {
        Self {
            store,
            config,
            cache: DashMap::new(),
            global: RwLock::new(HashMap::new()),
        }
    }

    /// Batch-build the corpus-wide ANN index for a period from every
    /// stored title. Returns the number of indexed sections.
    pub fn build_global_index(&self, period: &Period, titles: &[u16]) -> Result<usize> {
        let mut sections = Vec::new();
        for &title in titles {
            sections.extend(self.store.sections_for_title(period, title)?);
        }
        if sections.is_empty() {
            return Err(crate::errors::PipelineError::IndexBuild {
                details: format!("no sections stored for period {}", period),
            });
        }
        let index = ann::GlobalIndex::build(&sections, &self.config);
        let indexed = index.len();
        self.global.write().insert(*period, Arc::new(index));
        Ok(indexed)
    }

    /// Corpus-wide similarity via the global index. Empty when the index
    /// has not been built for the period.
    pub fn global_similar(
        &self,
        period: &Period,
        path: &SectionPath,
        limit: Option<usize>,
    ) -> Vec<SimilarSection> {
        let limit = limit.unwrap_or(self.config.default_limit);
        match self.global.read().get(period) {
            Some(index) => index.similar(path, limit),
            None => {
                warn!(%period, "global index not built, returning no results");
                Vec::new()
            }
        }
    }

    /// Rank the query section's peers by similarity, best first. The
    /// query section itself is never returned; a group with fewer than
    /// two sections yields an empty result.
    pub fn similar(
        &self,
        period: &Period,
        path: &SectionPath,
        limit: Option<usize>,
    ) -> Result<Vec<SimilarSection>> {
        let limit = limit.unwrap_or(self.config.default_limit);
        let key = GroupKey::for_section(period, path, self.config.granularity);
        let model = match self.group_model(&key) {
            Ok(model) => model,
            Err(e) => {
                warn!(%period, title = path.title, error = %e, "group model build failed, returning no results");
                return Ok(Vec::new());
            }
        };

        let query = match model.members.iter().find(|m| &m.path == path) {
            Some(member) => member,
            None => return Ok(Vec::new()),
        };

        let mut scored: Vec<SimilarSection> = model
            .members
            .iter()
            .filter(|m| &m.path != path)
            .map(|m| SimilarSection {
                path: m.path.clone(),
                heading: m.heading.clone(),
                score: cosine(&query.vector, &m.vector),
            })
            .filter(|s| s.score >= self.config.min_similarity)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| compare_section_ids(&a.path.section, &b.path.section))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// The most similar section pairs in a period, best first. Scans
    /// every populated title, or just `title` when given. Pair scans
    /// always run at title scope so cross-chapter overlap surfaces.
    pub fn most_similar_pairs(
        &self,
        period: &Period,
        title: Option<u16>,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<SimilarPair>> {
        let titles = match title {
            Some(t) => vec![t],
            None => self.store.titles_with_sections(period)?,
        };

        let mut pairs = Vec::new();
        for t in titles {
            let key = GroupKey {
                period: *period,
                title: t,
                chapter: None,
            };
            let model = self.group_model(&key)?;
            pairs.extend(scan_pairs(&model, min_similarity));
        }
        pairs.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| compare_section_ids(&a.first.section, &b.first.section))
        });
        pairs.truncate(limit);
        Ok(pairs)
    }

    /// Near-duplicate sections: pairs scoring at or above `min_similarity`
    /// (0.95 is a sensible floor), with both texts attached for review.
    pub fn find_duplicates(
        &self,
        period: &Period,
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<DuplicatePair>> {
        let pairs = self.most_similar_pairs(period, None, limit, min_similarity)?;
        let mut duplicates = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let first_text = self
                .store
                .get_section_text(period, &pair.first)?
                .unwrap_or_default();
            let second_text = self
                .store
                .get_section_text(period, &pair.second)?
                .unwrap_or_default();
            duplicates.push(DuplicatePair {
                pair,
                first_text,
                second_text,
            });
        }
        Ok(duplicates)
    }

    /// Corpus-level pair statistics for a period, floored at the
    /// configured minimum similarity.
    pub fn stats(&self, period: &Period) -> Result<SimilarityStats> {
        let mut stats = SimilarityStats {
            total_pairs: 0,
            titles_with_pairs: 0,
            avg_similarity: 0.0,
            distribution: [0; 10],
        };
        let mut score_sum = 0.0f64;

        for title in self.store.titles_with_sections(period)? {
            let key = GroupKey {
                period: *period,
                title,
                chapter: None,
            };
            let model = self.group_model(&key)?;
            let pairs = scan_pairs(&model, self.config.min_similarity);
            if pairs.is_empty() {
                continue;
            }
            stats.titles_with_pairs += 1;
            stats.total_pairs += pairs.len();
            for pair in &pairs {
                score_sum += f64::from(pair.score);
                let bucket = ((pair.score * 10.0) as usize).min(9);
                stats.distribution[bucket] += 1;
            }
        }

        if stats.total_pairs > 0 {
            stats.avg_similarity = (score_sum / stats.total_pairs as f64) as f32;
        }
        Ok(stats)
    }

    /// Fetch the cached group model, rebuilding when the store generation
    /// has moved past the one the model was built against.
    fn group_model(&self, key: &GroupKey) -> Result<Arc<GroupModel>> {
        let generation = self.store.generation(&key.period, key.title)?;
        if let Some(model) = self.cache.get(key) {
            if model.generation == generation {
                return Ok(Arc::clone(model.value()));
            }
        }

        let model = Arc::new(self.build_group_model(key, generation)?);
        self.cache.insert(key.clone(), Arc::clone(&model));
        Ok(model)
    }

    fn build_group_model(&self, key: &GroupKey, generation: u64) -> Result<GroupModel> {
        let sections = self.store.sections_for_title(&key.period, key.title)?;
        let members: Vec<&Section> = sections
            .iter()
            .filter(|s| !s.reserved)
            .filter(|s| match &key.chapter {
                Some(chapter) => s.path.chapter.as_ref() == Some(chapter),
                None => true,
            })
            .collect();

        let documents: Vec<Vec<String>> = members
            .par_iter()
            .map(|s| tokenize(&format!("{} {}", s.heading, s.text)))
            .collect();
        let vectors = build_tfidf(&documents, self.config.max_features);

        debug!(
            title = key.title,
            chapter = key.chapter.as_deref().unwrap_or("-"),
            members = members.len(),
            "built group similarity model"
        );

        Ok(GroupModel {
            generation,
            members: members
                .into_iter()
                .zip(vectors)
                .map(|(s, vector)| GroupMember {
                    path: s.path.clone(),
                    heading: s.heading.clone(),
                    vector,
                })
                .collect(),
        })
    }
}

/// NFKC-normalized lowercase alphanumeric tokens.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.nfkc()
        .collect::<String>()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Build L2-normalized TF-IDF vectors over a document set. Vocabulary is
/// capped to the `max_features` highest-document-frequency terms;
/// document frequency smoothing keeps idf finite for ubiquitous terms.
pub(crate) fn build_tfidf(documents: &[Vec<String>], max_features: usize) -> Vec<SparseVector> {
    let n_docs = documents.len();
    if n_docs == 0 {
        return Vec::new();
    }

    // Document frequency per term
    let mut df: HashMap<&str, u32> = HashMap::new();
    for tokens in documents {
        let mut seen: Vec<&str> = tokens.iter().map(String::as_str).collect();
        seen.sort_unstable();
        seen.dedup();
        for term in seen {
            *df.entry(term).or_insert(0) += 1;
        }
    }

    // Cap the vocabulary at the highest-df terms, ties broken
    // lexicographically so the cut is deterministic.
    let mut vocab: Vec<(&str, u32)> = df.into_iter().collect();
    vocab.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    vocab.truncate(max_features);

    let term_ids: HashMap<&str, u32> = vocab
        .iter()
        .enumerate()
        .map(|(i, (term, _))| (*term, i as u32))
        .collect();
    let idf: Vec<f32> = vocab
        .iter()
        .map(|(_, df)| ((1.0 + n_docs as f32) / (1.0 + *df as f32)).ln() + 1.0)
        .collect();

    documents
        .par_iter()
        .map(|tokens| {
            let mut tf: HashMap<u32, f32> = HashMap::new();
            for token in tokens {
                if let Some(&id) = term_ids.get(token.as_str()) {
                    *tf.entry(id).or_insert(0.0) += 1.0;
                }
            }
            let mut vector: SparseVector = tf
                .into_iter()
                .map(|(id, count)| (id, count * idf[id as usize]))
                .collect();
            vector.sort_unstable_by_key(|(id, _)| *id);

            let norm = vector.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
            if norm > 0.0 {
                for (_, w) in &mut vector {
                    *w /= norm;
                }
            }
            vector
        })
        .collect()
}

/// Exhaustive upper-triangle cosine scan over one group model's members.
fn scan_pairs(model: &GroupModel, min_similarity: f32) -> Vec<SimilarPair> {
    let members = &model.members;
    (0..members.len())
        .into_par_iter()
        .flat_map_iter(|i| {
            let a = &members[i];
            members[i + 1..].iter().filter_map(move |b| {
                let score = cosine(&a.vector, &b.vector);
                (score >= min_similarity).then(|| SimilarPair {
                    first: a.path.clone(),
                    first_heading: a.heading.clone(),
                    second: b.path.clone(),
                    second_heading: b.heading.clone(),
                    score,
                })
            })
        })
        .collect()
}

/// Sparse dot product of two L2-normalized vectors. Weights are
/// non-negative so the score lands in [0, 1].
pub(crate) fn cosine(a: &SparseVector, b: &SparseVector) -> f32 {
    let (mut i, mut j, mut dot) = (0, 0, 0.0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                dot += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    dot.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::extract::aggregate_word_counts;

    fn engine_with(sections: Vec<Section>) -> (tempfile::TempDir, SimilarityEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = CorpusStore::open(&StorageConfig {
            db_path: dir.path().join("cfr.db"),
            enable_compression: false,
        })
        .unwrap();
        let aggregates = aggregate_word_counts(&sections);
        store
            .upsert_period(&Period::Current, 1, &sections, &aggregates)
            .unwrap();
        let engine = SimilarityEngine::new(Arc::new(store), SimilarityConfig::default());
        (dir, engine)
    }

    fn section(id: &str, text: &str) -> Section {
        Section {
            path: SectionPath {
                title: 1,
                chapter: Some("I".into()),
                subchapter: None,
                part: Some("5".into()),
                subpart: None,
                section: id.into(),
            },
            heading: format!("\u{a7} {}", id),
            text: text.into(),
            word_count: text.split_whitespace().count() as u64,
            reserved: false,
        }
    }

    #[test]
    fn similar_ranks_peers_and_excludes_self() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "license renewal application filing deadline for broadcast stations"),
            section("5.2", "license renewal application procedure and filing requirements"),
            section("5.3", "antenna structure painting and lighting specifications"),
        ]);

        let query = SectionPath {
            title: 1,
            chapter: Some("I".into()),
            subchapter: None,
            part: Some("5".into()),
            subpart: None,
            section: "5.1".into(),
        };
        let results = engine.similar(&Period::Current, &query, Some(10)).unwrap();

        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.path.section != "5.1"));
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
        // the license-renewal peer outranks the antenna one
        assert_eq!(results[0].path.section, "5.2");
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn two_section_group_yields_at_most_one_result() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "emission limits for unlicensed intentional radiators"),
            section("5.2", "emission limits for licensed intentional radiators"),
        ]);
        let query = SectionPath {
            title: 1,
            chapter: Some("I".into()),
            subchapter: None,
            part: Some("5".into()),
            subpart: None,
            section: "5.1".into(),
        };
        let results = engine.similar(&Period::Current, &query, Some(3)).unwrap();
        assert!(results.len() <= 1);
    }

    #[test]
    fn unknown_section_yields_empty() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "alpha beta"),
            section("5.2", "alpha gamma"),
        ]);
        let query = SectionPath {
            title: 1,
            chapter: Some("I".into()),
            subchapter: None,
            part: Some("5".into()),
            subpart: None,
            section: "99.99".into(),
        };
        assert!(engine.similar(&Period::Current, &query, None).unwrap().is_empty());
    }

    #[test]
    fn cache_invalidates_on_generation_bump() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "station identification announcements hourly"),
            section("5.2", "station identification announcements daily"),
        ]);
        let query = SectionPath {
            title: 1,
            chapter: Some("I".into()),
            subchapter: None,
            part: Some("5".into()),
            subpart: None,
            section: "5.1".into(),
        };
        let before = engine.similar(&Period::Current, &query, None).unwrap();
        assert_eq!(before.len(), 1);

        // Refresh replaces 5.2 with 5.3; the cached model must not serve
        // the stale peer.
        let replacement = vec![
            section("5.1", "station identification announcements hourly"),
            section("5.3", "station identification announcements hourly too"),
        ];
        let aggregates = aggregate_word_counts(&replacement);
        engine
            .store
            .upsert_period(&Period::Current, 1, &replacement, &aggregates)
            .unwrap();

        let after = engine.similar(&Period::Current, &query, None).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].path.section, "5.3");
    }

    #[test]
    fn reserved_sections_never_appear() {
        let mut reserved = section("5.9", "");
        reserved.reserved = true;
        reserved.word_count = 0;
        let (_dir, engine) = engine_with(vec![
            section("5.1", "tower registration marking requirements"),
            section("5.2", "tower registration marking rules"),
            reserved,
        ]);
        let query = SectionPath {
            title: 1,
            chapter: Some("I".into()),
            subchapter: None,
            part: Some("5".into()),
            subpart: None,
            section: "5.1".into(),
        };
        let results = engine.similar(&Period::Current, &query, None).unwrap();
        assert!(results.iter().all(|r| r.path.section != "5.9"));
    }

    #[test]
    fn global_index_serves_only_after_build() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "record retention requirements for station logs"),
            section("5.2", "record retention rules for station logs"),
        ]);
        let query = SectionPath {
            title: 1,
            chapter: Some("I".into()),
            subchapter: None,
            part: Some("5".into()),
            subpart: None,
            section: "5.1".into(),
        };

        assert!(engine.global_similar(&Period::Current, &query, None).is_empty());

        let indexed = engine.build_global_index(&Period::Current, &[1]).unwrap();
        assert_eq!(indexed, 2);
        let results = engine.global_similar(&Period::Current, &query, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path.section, "5.2");
    }

    #[test]
    fn most_similar_pairs_rank_best_first() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "license renewal application filing deadline"),
            section("5.2", "license renewal application filing deadline"),
            section("5.3", "antenna structure painting and lighting"),
        ]);

        let pairs = engine
            .most_similar_pairs(&Period::Current, None, 10, 0.0)
            .unwrap();
        assert_eq!(pairs.len(), 3);
        // the matching-text pair outranks the cross-topic ones
        assert_eq!(pairs[0].first.section, "5.1");
        assert_eq!(pairs[0].second.section, "5.2");
        for pair in pairs.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(pairs.iter().all(|p| p.first != p.second));

        let none = engine
            .most_similar_pairs(&Period::Current, Some(99), 10, 0.0)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn duplicate_scan_attaches_texts_and_honors_floor() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "station identification announcements hourly"),
            section("5.2", "station identification announcements hourly"),
            section("5.3", "completely unrelated antenna marking rules"),
        ]);

        let dupes = engine.find_duplicates(&Period::Current, 0.7, 10).unwrap();
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].pair.first.section, "5.1");
        assert_eq!(dupes[0].pair.second.section, "5.2");
        assert_eq!(dupes[0].first_text, "station identification announcements hourly");
        assert_eq!(dupes[0].second_text, dupes[0].first_text);

        // identical bodies still differ in heading, so a near-1.0 floor
        // filters them out
        let strict = engine.find_duplicates(&Period::Current, 0.99, 10).unwrap();
        assert!(strict.is_empty());
    }

    #[test]
    fn stats_summarize_pair_distribution() {
        let (_dir, engine) = engine_with(vec![
            section("5.1", "station identification announcements hourly"),
            section("5.2", "station identification announcements hourly"),
            section("5.3", "completely unrelated antenna marking rules"),
        ]);

        let stats = engine.stats(&Period::Current).unwrap();
        assert_eq!(stats.titles_with_pairs, 1);
        assert!(stats.total_pairs >= 1);
        assert!(stats.avg_similarity > 0.0 && stats.avg_similarity <= 1.0);
        assert_eq!(stats.distribution.iter().sum::<usize>(), stats.total_pairs);
    }

    #[test]
    fn tokenizer_normalizes_and_splits() {
        let tokens = tokenize("The Commission\u{2019}s Part-73 rules (47 CFR)");
        assert!(tokens.contains(&"commission".to_string()));
        assert!(tokens.contains(&"73".to_string()));
        assert!(!tokens.iter().any(|t| t.is_empty()));
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let docs = vec![
            tokenize("one two three"),
            tokenize("one two three"),
            tokenize("four five six"),
        ];
        let vectors = build_tfidf(&docs, 100);
        assert!((cosine(&vectors[0], &vectors[1]) - 1.0).abs() < 1e-5);
        assert!(cosine(&vectors[0], &vectors[2]) < 1e-5);
    }
}
