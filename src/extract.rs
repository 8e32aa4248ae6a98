//! # Hierarchical Extractor
//!
//! ## Purpose
//! Parses raw title documents into leaf `Section` records and computes
//! exact bottom-up word counts for every internal hierarchy node. The two
//! upstream shapes (eCFR `DIV`/`TYPE` markup, govinfo annual-edition
//! markup) are normalized here; nothing downstream sees source-specific
//! structure.
//!
//! ## Input/Output Specification
//! - **Input**: raw XML bytes from either source, the title number
//! - **Output**: `Section` records (word counts, reserved flags) plus
//!   per-path aggregate sums
//!
//! ## Edge Cases
//! - Reserved or empty sections carry word count 0
//! - A section node missing its identifier is skipped with a warning;
//!   extraction of the rest of the document continues

use crate::errors::{PipelineError, Result};
use crate::fetch::RawTitleDocument;
use crate::{Section, SectionPath};
use regex::Regex;
use std::collections::BTreeMap;
use tracing::warn;

/// Result of extracting one raw document.
#[derive(Debug, Default)]
pub struct Extraction {
    pub sections: Vec<Section>,
    /// Leaves skipped due to structural anomalies
    pub skipped: usize,
}

/// Hierarchy levels carried down the eCFR document tree.
#[derive(Debug, Clone, Default)]
struct LevelContext {
    chapter: Option<String>,
    subchapter: Option<String>,
    part: Option<String>,
    subpart: Option<String>,
}

/// Extracts section records from either upstream document shape.
pub struct Extractor {
    reserved_re: Regex,
    chapter_re: Regex,
    subchapter_re: Regex,
    part_re: Regex,
    subpart_re: Regex,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            reserved_re: Regex::new(r"(?i)^\s*\[?\s*reserved\.?\s*\]?\s*$")
                .expect("static regex"),
            chapter_re: Regex::new(r"CHAPTER\s+([IVXLCDM]+)").expect("static regex"),
            subchapter_re: Regex::new(r"SUBCHAPTER\s+([A-Z]+)").expect("static regex"),
            part_re: Regex::new(r"PART\s+(\d+)").expect("static regex"),
            subpart_re: Regex::new(r"(?i)SUBPART\s+([A-Z0-9]+)").expect("static regex"),
        }
    }

    /// Extract all leaf sections from a raw document.
    pub fn extract(&self, document: &RawTitleDocument, title: u16) -> Result<Extraction> {
        match document {
            RawTitleDocument::Ecfr(xml) => self.extract_ecfr(xml, title),
            RawTitleDocument::GovinfoVolumes(volumes) => {
                let mut combined = Extraction::default();
                for xml in volumes {
                    let mut one = self.extract_govinfo(xml, title)?;
                    combined.sections.append(&mut one.sections);
                    combined.skipped += one.skipped;
                }
                Ok(combined)
            }
        }
    }

    // -- eCFR shape -------------------------------------------------------

    fn extract_ecfr(&self, xml: &[u8], title: u16) -> Result<Extraction> {
        let text = std::str::from_utf8(xml).map_err(|e| PipelineError::MalformedDocument {
            source_name: "ecfr",
            details: format!("document is not valid UTF-8: {}", e),
        })?;
        let doc =
            roxmltree::Document::parse(text).map_err(|e| PipelineError::MalformedDocument {
                source_name: "ecfr",
                details: e.to_string(),
            })?;

        let mut extraction = Extraction::default();
        self.walk_ecfr(doc.root_element(), &LevelContext::default(), title, &mut extraction);
        Ok(extraction)
    }

    fn walk_ecfr(
        &self,
        node: roxmltree::Node<'_, '_>,
        context: &LevelContext,
        title: u16,
        out: &mut Extraction,
    ) {
        for child in node.children().filter(|n| n.is_element()) {
            let mut context = context.clone();
            let identifier = child
                .attribute("N")
                .map(|n| n.trim_start_matches(['\u{a7}', ' ']).trim().to_string());

            match child.attribute("TYPE") {
                Some("CHAPTER") => context.chapter = identifier.clone(),
                Some("SUBCHAP") => context.subchapter = identifier.clone(),
                Some("PART") => context.part = identifier.clone(),
                Some("SUBPART") => context.subpart = identifier.clone(),
                Some("SECTION") => {
                    match identifier.filter(|id| !id.is_empty()) {
                        Some(section_id) => {
                            out.sections
                                .push(self.build_ecfr_section(child, &context, title, section_id));
                        }
                        None => {
                            warn!(title, "section node without identifier, skipping leaf");
                            out.skipped += 1;
                        }
                    }
                    continue;
                }
                _ => {}
            }

            self.walk_ecfr(child, &context, title, out);
        }
    }

    fn build_ecfr_section(
        &self,
        node: roxmltree::Node<'_, '_>,
        context: &LevelContext,
        title: u16,
        section_id: String,
    ) -> Section {
        let mut heading = String::new();
        let mut parts: Vec<String> = Vec::new();
        collect_ecfr_body(node, true, &mut heading, &mut parts);

        let text = parts.join("\n");
        self.finish_section(context, title, section_id, heading, text)
    }

    // -- govinfo annual-edition shape -------------------------------------

    fn extract_govinfo(&self, xml: &[u8], title: u16) -> Result<Extraction> {
        let text = std::str::from_utf8(xml).map_err(|e| PipelineError::MalformedDocument {
            source_name: "govinfo",
            details: format!("document is not valid UTF-8: {}", e),
        })?;
        let doc =
            roxmltree::Document::parse(text).map_err(|e| PipelineError::MalformedDocument {
                source_name: "govinfo",
                details: e.to_string(),
            })?;

        let mut extraction = Extraction::default();
        let mut context = LevelContext::default();

        for node in doc.root_element().descendants().filter(|n| n.is_element()) {
            match node.tag_name().name() {
                "CHAPTER" => {
                    context.chapter = self.heading_capture(node, &self.chapter_re);
                    context.subchapter = None;
                    context.part = None;
                    context.subpart = None;
                }
                "SUBCHAP" => {
                    context.subchapter = self.heading_capture(node, &self.subchapter_re);
                    context.part = None;
                    context.subpart = None;
                }
                "PART" => {
                    context.part = self.heading_capture(node, &self.part_re);
                    context.subpart = None;
                }
                "SUBPART" => {
                    context.subpart = self.heading_capture(node, &self.subpart_re);
                }
                "SECTION" => match self.parse_govinfo_section(node, &context, title) {
                    Some(section) => extraction.sections.push(section),
                    None => {
                        warn!(title, "annual-edition section without SECTNO, skipping leaf");
                        extraction.skipped += 1;
                    }
                },
                _ => {}
            }
        }

        Ok(extraction)
    }

    /// First regex capture out of the node's HD heading, if any.
    fn heading_capture(&self, node: roxmltree::Node<'_, '_>, re: &Regex) -> Option<String> {
        let hd = node
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "HD")?;
        let text = element_text(hd);
        re.captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn parse_govinfo_section(
        &self,
        node: roxmltree::Node<'_, '_>,
        context: &LevelContext,
        title: u16,
    ) -> Option<Section> {
        let sectno = node
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "SECTNO")
            .map(element_text)?;
        let section_id = sectno
            .trim_start_matches(['\u{a7}', ' '])
            .trim()
            .to_string();
        if section_id.is_empty() {
            return None;
        }

        let heading = node
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "SUBJECT")
            .map(element_text)
            .unwrap_or_default()
            .trim()
            .to_string();

        let parts: Vec<String> = node
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "P")
            .map(element_text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Some(self.finish_section(context, title, section_id, heading, parts.join("\n")))
    }

    // -- shared ------------------------------------------------------------

    fn finish_section(
        &self,
        context: &LevelContext,
        title: u16,
        section_id: String,
        heading: String,
        text: String,
    ) -> Section {
        let text = text.trim().to_string();
        let reserved = text.is_empty()
            || self.reserved_re.is_match(&text)
            || self.reserved_re.is_match(&heading);
        let word_count = if reserved {
            0
        } else {
            text.split_whitespace().count() as u64
        };

        Section {
            path: SectionPath {
                title,
                chapter: context.chapter.clone(),
                subchapter: context.subchapter.clone(),
                part: context.part.clone(),
                subpart: context.subpart.clone(),
                section: section_id,
            },
            heading,
            text,
            word_count,
            reserved,
        }
    }
}

/// All text content of an element's subtree in document order.
fn element_text(node: roxmltree::Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Body collection for one eCFR section subtree: the direct HEAD becomes
/// the heading, paragraph-bearing elements contribute text, everything
/// else is recursed into.
fn collect_ecfr_body(
    node: roxmltree::Node<'_, '_>,
    top_level: bool,
    heading: &mut String,
    parts: &mut Vec<String>,
) {
    for child in node.children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "HEAD" => {
                if top_level && heading.is_empty() {
                    *heading = element_text(child);
                }
            }
            "P" | "FP" | "NOTE" | "EXTRACT" | "GPOTABLE" => {
                let text = element_text(child);
                if !text.is_empty() {
                    parts.push(text);
                }
            }
            // AUTH, SOURCE, CITA and friends can nest paragraphs
            _ => collect_ecfr_body(child, false, heading, parts),
        }
    }
}

/// Exact bottom-up aggregate word counts: for every internal hierarchy
/// prefix, the sum of word counts of all leaves rooted there. Recomputed
/// in full from the section set each time, never patched incrementally.
pub fn aggregate_word_counts(sections: &[Section]) -> BTreeMap<String, u64> {
    let mut aggregates = BTreeMap::new();
    for section in sections {
        for prefix in section.path.ancestor_prefixes() {
            *aggregates.entry(prefix).or_insert(0) += section.word_count;
        }
    }
    aggregates
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECFR_SAMPLE: &str = r#"<?xml version="1.0"?>
<ECFR>
  <DIV1 N="47" TYPE="TITLE">
    <HEAD>Title 47 - Telecommunication</HEAD>
    <DIV3 N="I" TYPE="CHAPTER">
      <HEAD>CHAPTER I</HEAD>
      <DIV5 N="73" TYPE="PART">
        <HEAD>PART 73 - RADIO BROADCAST SERVICES</HEAD>
        <DIV8 N="&#167; 73.1" TYPE="SECTION">
          <HEAD>&#167; 73.1 Scope.</HEAD>
          <P>one two three four five six seven eight nine ten</P>
        </DIV8>
        <DIV8 N="&#167; 73.2" TYPE="SECTION">
          <HEAD>&#167; 73.2 Definitions.</HEAD>
          <P>alpha beta gamma delta epsilon zeta eta theta</P>
          <P>iota kappa lambda mu nu omicron pi</P>
        </DIV8>
        <DIV8 N="&#167; 73.3" TYPE="SECTION">
          <HEAD>&#167; 73.3 [Reserved]</HEAD>
        </DIV8>
      </DIV5>
    </DIV3>
  </DIV1>
</ECFR>"#;

    #[test]
    fn ecfr_sections_extract_with_hierarchy() {
        let extractor = Extractor::new();
        let doc = RawTitleDocument::Ecfr(ECFR_SAMPLE.as_bytes().to_vec());
        let extraction = extractor.extract(&doc, 47).unwrap();

        assert_eq!(extraction.sections.len(), 3);
        assert_eq!(extraction.skipped, 0);

        let first = &extraction.sections[0];
        assert_eq!(first.path.title, 47);
        assert_eq!(first.path.chapter.as_deref(), Some("I"));
        assert_eq!(first.path.part.as_deref(), Some("73"));
        assert_eq!(first.path.section, "73.1");
        assert_eq!(first.word_count, 10);
        assert!(!first.reserved);

        assert_eq!(extraction.sections[1].word_count, 15);
    }

    #[test]
    fn reserved_sections_count_zero() {
        let extractor = Extractor::new();
        let doc = RawTitleDocument::Ecfr(ECFR_SAMPLE.as_bytes().to_vec());
        let extraction = extractor.extract(&doc, 47).unwrap();

        let reserved = &extraction.sections[2];
        assert!(reserved.reserved);
        assert_eq!(reserved.word_count, 0);
    }

    #[test]
    fn aggregates_sum_exactly_bottom_up() {
        // One reserved section plus word counts 10 and 15: every ancestor
        // node must read exactly 25.
        let extractor = Extractor::new();
        let doc = RawTitleDocument::Ecfr(ECFR_SAMPLE.as_bytes().to_vec());
        let extraction = extractor.extract(&doc, 47).unwrap();
        let aggregates = aggregate_word_counts(&extraction.sections);

        assert_eq!(aggregates.get("47"), Some(&25));
        assert_eq!(aggregates.get("47/I"), Some(&25));
        assert_eq!(aggregates.get("47/I/"), Some(&25));
        assert_eq!(aggregates.get("47/I//73"), Some(&25));
    }

    #[test]
    fn section_without_identifier_is_skipped() {
        let xml = r#"<ECFR><DIV1 N="1" TYPE="TITLE">
            <DIV8 TYPE="SECTION"><P>orphan text</P></DIV8>
            <DIV8 N="&#167; 1.1" TYPE="SECTION"><P>kept text here</P></DIV8>
        </DIV1></ECFR>"#;
        let extractor = Extractor::new();
        let doc = RawTitleDocument::Ecfr(xml.as_bytes().to_vec());
        let extraction = extractor.extract(&doc, 1).unwrap();
        assert_eq!(extraction.sections.len(), 1);
        assert_eq!(extraction.skipped, 1);
        assert_eq!(extraction.sections[0].path.section, "1.1");
    }

    const GOVINFO_SAMPLE: &str = r#"<?xml version="1.0"?>
<CFRDOC>
  <TITLE>
    <CHAPTER>
      <HD SOURCE="HED">CHAPTER I - FEDERAL COMMUNICATIONS COMMISSION</HD>
      <SUBCHAP>
        <HD SOURCE="HD1">SUBCHAPTER C - BROADCAST RADIO SERVICES</HD>
        <PART>
          <HD SOURCE="HED">PART 73 - RADIO BROADCAST SERVICES</HD>
          <SECTION>
            <SECTNO>&#167; 73.1</SECTNO>
            <SUBJECT>Scope.</SUBJECT>
            <P>one two three four five</P>
            <P>six seven eight</P>
          </SECTION>
          <SECTION>
            <SUBJECT>No number.</SUBJECT>
            <P>anomalous leaf</P>
          </SECTION>
        </PART>
      </SUBCHAP>
    </CHAPTER>
  </TITLE>
</CFRDOC>"#;

    #[test]
    fn govinfo_shape_normalizes_to_same_records() {
        let extractor = Extractor::new();
        let doc = RawTitleDocument::GovinfoVolumes(vec![GOVINFO_SAMPLE.as_bytes().to_vec()]);
        let extraction = extractor.extract(&doc, 47).unwrap();

        assert_eq!(extraction.sections.len(), 1);
        assert_eq!(extraction.skipped, 1);

        let section = &extraction.sections[0];
        assert_eq!(section.path.chapter.as_deref(), Some("I"));
        assert_eq!(section.path.subchapter.as_deref(), Some("C"));
        assert_eq!(section.path.part.as_deref(), Some("73"));
        assert_eq!(section.path.section, "73.1");
        assert_eq!(section.heading, "Scope.");
        assert_eq!(section.word_count, 8);
    }

    #[test]
    fn multiple_volumes_concatenate() {
        let extractor = Extractor::new();
        let doc = RawTitleDocument::GovinfoVolumes(vec![
            GOVINFO_SAMPLE.as_bytes().to_vec(),
            GOVINFO_SAMPLE.as_bytes().to_vec(),
        ]);
        let extraction = extractor.extract(&doc, 47).unwrap();
        assert_eq!(extraction.sections.len(), 2);
    }

    #[test]
    fn empty_text_means_reserved() {
        let extractor = Extractor::new();
        let section = extractor.finish_section(
            &LevelContext::default(),
            1,
            "1.1".into(),
            "Heading".into(),
            "   ".into(),
        );
        assert!(section.reserved);
        assert_eq!(section.word_count, 0);
    }
}
