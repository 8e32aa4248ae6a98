//! # Corpus Storage Module
//!
//! ## Purpose
//! Persists the acquired corpus in an embedded sled database: title and
//! agency metadata, leaf section records, and per-node aggregate word
//! counts, all keyed by (period, title) so refreshes of one unit never
//! disturb another.
//!
//! ## Input/Output Specification
//! - **Input**: extracted section sets, aggregate maps, upstream metadata
//! - **Output**: navigable corpus reads, text search, freshness decisions
//! - **Storage**: sled trees, one per record kind, with optional gzip
//!   compression of values
//!
//! ## Key Features
//! - Transactional period upserts: delete-then-insert of a whole
//!   (period, title) unit with its aggregates and freshness stamp in one
//!   atomic step
//! - Day-granularity freshness for the current period; annual editions
//!   are immutable and fresh once present
//! - Monotonic per-unit generation counter for downstream cache
//!   invalidation

use crate::config::StorageConfig;
use crate::errors::{PipelineError, Result};
use crate::{compare_section_ids, Agency, CfrReference, Period, Section, SectionPath, TitleMetadata};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

/// Separator between path components inside section keys. Never appears
/// in CFR identifiers.
const KEY_SEP: u8 = 0x1f;

/// Main corpus store
pub struct CorpusStore {
    db: sled::Db,
    titles: sled::Tree,
    agencies: sled::Tree,
    cfr_refs: sled::Tree,
    sections: sled::Tree,
    aggregates: sled::Tree,
    meta: sled::Tree,
    enable_compression: bool,
}

/// One node of the corpus structure tree. An empty label means that
/// hierarchy level is absent for the subtree beneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureNode {
    pub label: String,
    pub word_count: u64,
    pub children: Vec<StructureNode>,
    pub sections: Vec<SectionSummary>,
}

/// Leaf listing inside a structure node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSummary {
    pub section: String,
    pub heading: String,
    pub word_count: u64,
    pub reserved: bool,
}

/// A text-search match with a context snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: SectionPath,
    pub heading: String,
    pub snippet: String,
}

/// Aggregate word count attributed to one agency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgencyWordCount {
    pub slug: String,
    pub name: String,
    pub word_count: u64,
}

impl CorpusStore {
    /// Open (or create) the corpus database at the configured path.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::open(&config.db_path)?;
        let titles = db.open_tree("titles")?;
        let agencies = db.open_tree("agencies")?;
        let cfr_refs = db.open_tree("cfr_refs")?;
        let sections = db.open_tree("sections")?;
        let aggregates = db.open_tree("aggregates")?;
        let meta = db.open_tree("meta")?;

        let store = Self {
            db,
            titles,
            agencies,
            cfr_refs,
            sections,
            aggregates,
            meta,
            enable_compression: config.enable_compression,
        };

        tracing::info!(
            sections = store.sections.len(),
            "corpus store opened at {:?}",
            config.db_path
        );
        Ok(store)
    }

    // -- period upserts ---------------------------------------------------

    /// Atomically replace the entire (period, title) unit: all section
    /// records and aggregate rows are swapped for the new set, the
    /// freshness stamp is written, and the unit's generation counter is
    /// bumped. Readers never observe a half-replaced unit.
    pub fn upsert_period(
        &self,
        period: &Period,
        title: u16,
        sections: &[Section],
        aggregates: &BTreeMap<String, u64>,
    ) -> Result<()> {
        let prefix = unit_prefix(period, title);

        // Serialize up front: the transaction closure may rerun on
        // conflict and must not repeat this work.
        let mut section_rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(sections.len());
        for section in sections {
            section_rows.push((section_key(period, &section.path), self.encode(section)?));
        }
        let aggregate_rows: Vec<(Vec<u8>, Vec<u8>)> = aggregates
            .iter()
            .map(|(node, count)| (aggregate_key(period, title, node), count.to_be_bytes().to_vec()))
            .collect();

        let old_section_keys: Vec<sled::IVec> = self
            .sections
            .scan_prefix(prefix)
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        let old_aggregate_keys: Vec<sled::IVec> = self
            .aggregates
            .scan_prefix(prefix)
            .keys()
            .collect::<std::result::Result<_, _>>()?;

        let stamp_key = fetched_on_key(period, title);
        let stamp = today();
        let gen_key = generation_key(period, title);

        (&self.sections, &self.aggregates, &self.meta)
            .transaction(|(sections_tx, aggregates_tx, meta_tx)| {
                for key in &old_section_keys {
                    sections_tx.remove(key)?;
                }
                for key in &old_aggregate_keys {
                    aggregates_tx.remove(key)?;
                }
                for (key, value) in &section_rows {
                    sections_tx.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &aggregate_rows {
                    aggregates_tx.insert(key.as_slice(), value.as_slice())?;
                }
                meta_tx.insert(stamp_key.as_bytes(), stamp.as_bytes())?;

                let generation = match meta_tx.get(gen_key.as_bytes())? {
                    Some(bytes) => decode_u64(&bytes) + 1,
                    None => 1,
                };
                meta_tx.insert(gen_key.as_bytes(), generation.to_be_bytes().to_vec())?;
                Ok(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Storage(e) => PipelineError::Database(e),
                TransactionError::Abort(()) => PipelineError::Internal {
                    message: "period upsert aborted".to_string(),
                },
            })?;

        self.db.flush()?;
        tracing::info!(
            %period,
            title,
            sections = sections.len(),
            "persisted period unit"
        );
        Ok(())
    }

    /// Whether the stored (period, title) unit can be served without
    /// refetching. The current period is fresh for the calendar day it
    /// was stamped; annual editions never change once published, so any
    /// stored data is fresh.
    pub fn is_fresh(&self, period: &Period, title: u16) -> Result<bool> {
        match period {
            Period::Current => {
                let stamp = self.meta.get(fetched_on_key(period, title).as_bytes())?;
                Ok(stamp.map(|s| s.as_ref() == today().as_bytes()).unwrap_or(false))
            }
            Period::Annual(_) => Ok(self
                .meta
                .contains_key(generation_key(period, title).as_bytes())?),
        }
    }

    /// Monotonic per-unit write counter; bumps on every successful
    /// upsert. Zero means the unit has never been written.
    pub fn generation(&self, period: &Period, title: u16) -> Result<u64> {
        Ok(self
            .meta
            .get(generation_key(period, title).as_bytes())?
            .map(|b| decode_u64(&b))
            .unwrap_or(0))
    }

    // -- metadata ---------------------------------------------------------

    /// Idempotent upsert of title metadata keyed by title number.
    pub fn save_titles(&self, titles: &[TitleMetadata]) -> Result<()> {
        for title in titles {
            self.titles
                .insert(title.number.to_be_bytes(), self.encode(title)?)?;
        }
        Ok(())
    }

    pub fn list_titles(&self) -> Result<Vec<TitleMetadata>> {
        let mut titles = Vec::new();
        for row in self.titles.iter() {
            let (_, value) = row?;
            titles.push(self.decode(&value)?);
        }
        Ok(titles)
    }

    pub fn get_title(&self, number: u16) -> Result<Option<TitleMetadata>> {
        match self.titles.get(number.to_be_bytes())? {
            Some(value) => Ok(Some(self.decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Idempotent upsert of the agency roster and its CFR references.
    pub fn save_agencies(&self, agencies: &[Agency], refs: &[CfrReference]) -> Result<()> {
        for agency in agencies {
            self.agencies
                .insert(agency.slug.as_bytes(), self.encode(agency)?)?;
        }
        for reference in refs {
            let key = format!(
                "{}\u{1f}{}\u{1f}{}",
                reference.agency_slug, reference.title, reference.chapter
            );
            self.cfr_refs.insert(key.as_bytes(), self.encode(reference)?)?;
        }
        Ok(())
    }

    pub fn list_agencies(&self) -> Result<Vec<Agency>> {
        let mut agencies = Vec::new();
        for row in self.agencies.iter() {
            let (_, value) = row?;
            agencies.push(self.decode(&value)?);
        }
        Ok(agencies)
    }

    /// Total word count administered by each agency in a period: the sum
    /// of the chapter-level aggregates of its CFR references, with child
    /// agency counts rolled up into every ancestor. Sorted largest first.
    pub fn agency_word_counts(&self, period: &Period) -> Result<Vec<AgencyWordCount>> {
        let mut direct: HashMap<String, u64> = HashMap::new();
        for row in self.cfr_refs.iter() {
            let (_, value) = row?;
            let reference: CfrReference = self.decode(&value)?;
            let node = format!("{}/{}", reference.title, reference.chapter);
            let key = aggregate_key(period, reference.title, &node);
            if let Some(bytes) = self.aggregates.get(&key)? {
                *direct.entry(reference.agency_slug).or_insert(0) += decode_u64(&bytes);
            }
        }

        let mut names: HashMap<String, String> = HashMap::new();
        let mut parents: HashMap<String, Option<String>> = HashMap::new();
        for agency in self.list_agencies()? {
            names.insert(agency.slug.clone(), agency.name);
            parents.insert(agency.slug, agency.parent_slug);
        }

        // agencies form a tree, so the parent walk terminates
        let mut totals: HashMap<String, u64> = HashMap::new();
        for (slug, count) in &direct {
            let mut cursor = Some(slug.clone());
            while let Some(current) = cursor {
                *totals.entry(current.clone()).or_insert(0) += count;
                cursor = parents.get(&current).cloned().flatten();
            }
        }

        let mut counts: Vec<AgencyWordCount> = totals
            .into_iter()
            .map(|(slug, word_count)| AgencyWordCount {
                name: names.get(&slug).cloned().unwrap_or_else(|| slug.clone()),
                slug,
                word_count,
            })
            .collect();
        counts.sort_by(|a, b| b.word_count.cmp(&a.word_count).then(a.slug.cmp(&b.slug)));
        Ok(counts)
    }

    // -- corpus reads -----------------------------------------------------

    pub fn get_section(&self, period: &Period, path: &SectionPath) -> Result<Option<Section>> {
        match self.sections.get(section_key(period, path))? {
            Some(value) => Ok(Some(self.decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Full text of one section, if stored.
    pub fn get_section_text(&self, period: &Period, path: &SectionPath) -> Result<Option<String>> {
        Ok(self.get_section(period, path)?.map(|s| s.text))
    }

    /// All leaf sections of one (period, title) unit in key order.
    pub fn sections_for_title(&self, period: &Period, title: u16) -> Result<Vec<Section>> {
        let mut sections = Vec::new();
        for row in self.sections.scan_prefix(unit_prefix(period, title)) {
            let (_, value) = row?;
            sections.push(self.decode(&value)?);
        }
        Ok(sections)
    }

    /// Distinct titles with at least one stored section in a period,
    /// ascending.
    pub fn titles_with_sections(&self, period: &Period) -> Result<Vec<u16>> {
        let prefix = period.key().to_be_bytes();
        let mut titles = Vec::new();
        for row in self.sections.scan_prefix(prefix).keys() {
            let key = row?;
            let title = u16::from_be_bytes([key[2], key[3]]);
            if titles.last() != Some(&title) {
                titles.push(title);
            }
        }
        Ok(titles)
    }

    /// Aggregate word counts for one unit, keyed by hierarchy node path.
    pub fn word_counts(&self, period: &Period, title: u16) -> Result<BTreeMap<String, u64>> {
        let prefix = unit_prefix(period, title);
        let mut counts = BTreeMap::new();
        for row in self.aggregates.scan_prefix(prefix) {
            let (key, value) = row?;
            let node = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            counts.insert(node, decode_u64(&value));
        }
        Ok(counts)
    }

    /// The full structure tree for one (period, title) unit: nested
    /// hierarchy nodes carrying their aggregate word counts, with section
    /// summaries attached at the deepest node, sorted in natural order.
    pub fn get_structure(&self, period: &Period, title: u16) -> Result<StructureNode> {
        let mut root = StructureNode {
            label: title.to_string(),
            word_count: 0,
            children: Vec::new(),
            sections: Vec::new(),
        };

        for (node_path, count) in self.word_counts(period, title)? {
            let segments: Vec<&str> = node_path.split('/').collect();
            if segments.len() == 1 {
                root.word_count = count;
                continue;
            }
            let node = descend_or_create(&mut root, &segments[1..]);
            node.word_count = count;
        }

        for section in self.sections_for_title(period, title)? {
            let prefixes = section.path.ancestor_prefixes();
            let deepest = &prefixes[prefixes.len() - 1];
            let segments: Vec<&str> = deepest.split('/').collect();
            let node = descend_or_create(&mut root, &segments[1..]);
            node.sections.push(SectionSummary {
                section: section.path.section,
                heading: section.heading,
                word_count: section.word_count,
                reserved: section.reserved,
            });
        }

        sort_structure(&mut root);
        Ok(root)
    }

    /// Descend the structure tree along the given labels. `None` when the
    /// path does not exist.
    pub fn navigate(
        &self,
        period: &Period,
        title: u16,
        path: &[&str],
    ) -> Result<Option<StructureNode>> {
        let mut node = self.get_structure(period, title)?;
        for label in path {
            match node.children.into_iter().find(|c| c.label == *label) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    /// Case-insensitive substring search over headings and text, scoped
    /// to one title when given, returning up to `limit` hits with a
    /// context snippet around the first match.
    pub fn search(
        &self,
        period: &Period,
        query: &str,
        title: Option<u16>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let pattern = regex::Regex::new(&format!("(?i){}", regex::escape(query)))
            .map_err(|e| PipelineError::Internal {
                message: format!("search pattern: {}", e),
            })?;

        let rows: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = match title {
            Some(t) => Box::new(self.sections.scan_prefix(unit_prefix(period, t))),
            None => Box::new(self.sections.scan_prefix(period.key().to_be_bytes())),
        };

        let mut hits = Vec::new();
        for row in rows {
            let (_, value) = row?;
            let section: Section = self.decode(&value)?;
            let matched = pattern
                .find(&section.heading)
                .map(|_| snippet(&section.heading, &pattern))
                .or_else(|| pattern.find(&section.text).map(|_| snippet(&section.text, &pattern)));
            if let Some(snippet) = matched {
                hits.push(SearchHit {
                    path: section.path,
                    heading: section.heading,
                    snippet,
                });
                if hits.len() >= limit {
                    break;
                }
            }
        }
        Ok(hits)
    }

    /// Periods for which any data has been stored, current first.
    pub fn list_periods(&self) -> Result<Vec<Period>> {
        let mut keys: Vec<u16> = Vec::new();
        for row in self.meta.scan_prefix(b"generation:") {
            let (key, _) = row?;
            let text = String::from_utf8_lossy(&key);
            if let Some(period_key) = text
                .split(':')
                .nth(1)
                .and_then(|p| p.parse::<u16>().ok())
            {
                if !keys.contains(&period_key) {
                    keys.push(period_key);
                }
            }
        }
        keys.sort_unstable();
        Ok(keys.into_iter().map(Period::from_key).collect())
    }

    /// Whether any title has been stored for the period.
    pub fn has_period_data(&self, period: &Period) -> Result<bool> {
        let prefix = format!("generation:{}", period.key());
        Ok(self.meta.scan_prefix(prefix.as_bytes()).next().is_some())
    }

    // -- value codec ------------------------------------------------------

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = bincode::serialize(value)?;
        if self.enable_compression {
            // marker byte 1 = gzip payload, 0 = plain bincode
            let mut encoder =
                flate2::write::GzEncoder::new(vec![1u8], flate2::Compression::default());
            encoder.write_all(&raw)?;
            Ok(encoder.finish()?)
        } else {
            let mut out = Vec::with_capacity(raw.len() + 1);
            out.push(0u8);
            out.extend_from_slice(&raw);
            Ok(out)
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match bytes.split_first() {
            Some((&0, raw)) => Ok(bincode::deserialize(raw)?),
            Some((&1, compressed)) => {
                let mut decoder = flate2::read::GzDecoder::new(compressed);
                let mut raw = Vec::new();
                decoder.read_to_end(&mut raw)?;
                Ok(bincode::deserialize(&raw)?)
            }
            _ => Err(PipelineError::Internal {
                message: "unknown value encoding marker".to_string(),
            }),
        }
    }
}

// -- key encoding ---------------------------------------------------------

fn unit_prefix(period: &Period, title: u16) -> [u8; 4] {
    let p = period.key().to_be_bytes();
    let t = title.to_be_bytes();
    [p[0], p[1], t[0], t[1]]
}

fn section_key(period: &Period, path: &SectionPath) -> Vec<u8> {
    let mut key = unit_prefix(period, path.title).to_vec();
    for component in [
        path.chapter.as_deref().unwrap_or(""),
        path.subchapter.as_deref().unwrap_or(""),
        path.part.as_deref().unwrap_or(""),
        path.subpart.as_deref().unwrap_or(""),
        path.section.as_str(),
    ] {
        key.push(KEY_SEP);
        key.extend_from_slice(component.as_bytes());
    }
    key
}

fn aggregate_key(period: &Period, title: u16, node: &str) -> Vec<u8> {
    let mut key = unit_prefix(period, title).to_vec();
    key.extend_from_slice(node.as_bytes());
    key
}

fn fetched_on_key(period: &Period, title: u16) -> String {
    format!("fetched_on:{}:{}", period.key(), title)
}

fn generation_key(period: &Period, title: u16) -> String {
    format!("generation:{}:{}", period.key(), title)
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[8 - len..].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buf)
}

fn descend_or_create<'a>(root: &'a mut StructureNode, segments: &[&str]) -> &'a mut StructureNode {
    let mut node = root;
    for segment in segments {
        let position = node.children.iter().position(|c| c.label == *segment);
        let index = match position {
            Some(i) => i,
            None => {
                node.children.push(StructureNode {
                    label: segment.to_string(),
                    word_count: 0,
                    children: Vec::new(),
                    sections: Vec::new(),
                });
                node.children.len() - 1
            }
        };
        node = &mut node.children[index];
    }
    node
}

fn sort_structure(node: &mut StructureNode) {
    node.children.sort_by(|a, b| a.label.cmp(&b.label));
    node.sections
        .sort_by(|a, b| compare_section_ids(&a.section, &b.section));
    for child in &mut node.children {
        sort_structure(child);
    }
}

/// Context window around the first pattern match, clamped to char
/// boundaries.
fn snippet(text: &str, pattern: &regex::Regex) -> String {
    const CONTEXT: usize = 60;
    match pattern.find(text) {
        Some(m) => {
            let mut start = m.start().saturating_sub(CONTEXT);
            let mut end = (m.end() + CONTEXT).min(text.len());
            while !text.is_char_boundary(start) {
                start -= 1;
            }
            while !text.is_char_boundary(end) {
                end += 1;
            }
            let mut out = String::new();
            if start > 0 {
                out.push_str("...");
            }
            out.push_str(&text[start..end]);
            if end < text.len() {
                out.push_str("...");
            }
            out
        }
        None => String::new(),
    }
}
