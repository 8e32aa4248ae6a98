//! # Upstream Sources
//!
//! ## Purpose
//! Concrete clients for the two independent CFR sources and the common
//! `TitleSource` trait the racer and orchestrator work against.
//!
//! ## Sources
//! - **eCFR API** (primary): dated full-title XML, plus the titles and
//!   agencies metadata endpoints.
//! - **govinfo bulk data** (secondary): current eCFR bulk XML, and the
//!   multi-volume CFR annual editions for historical periods.
//!
//! Both sources return whole documents only; a partially retrieved or
//! structurally implausible body is reported as a source failure.

use super::{sniff_xml, DocumentRequest, RawTitleDocument};
use crate::config::SourcesConfig;
use crate::errors::{PipelineError, Result};
use crate::{Agency, CfrReference, Period, TitleMetadata};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// One physical source of full-title documents.
#[async_trait]
pub trait TitleSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch the whole document set for one (title, period).
    async fn fetch_title(&self, request: &DocumentRequest) -> Result<RawTitleDocument>;
}

async fn get_bytes(
    client: &Client,
    source_name: &'static str,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    debug!(source = source_name, url, "fetching");
    let response = client.get(url).timeout(timeout).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::HttpStatus {
            source_name,
            status: status.as_u16(),
        });
    }
    let body = response.bytes().await?.to_vec();
    sniff_xml(source_name, &body)?;
    Ok(body)
}

// -------------------------------------------------------------------------
// eCFR API (primary)
// -------------------------------------------------------------------------

/// Client for the ecfr.gov versioner and admin APIs.
pub struct EcfrApiSource {
    client: Client,
    base_url: String,
    title_timeout: Duration,
    metadata_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TitlesResponse {
    titles: Vec<ApiTitle>,
}

#[derive(Debug, Deserialize)]
struct ApiTitle {
    number: u16,
    name: Option<String>,
    latest_amended_on: Option<String>,
    latest_issue_date: Option<String>,
    up_to_date_as_of: Option<String>,
    #[serde(default)]
    reserved: bool,
}

#[derive(Debug, Deserialize)]
struct AgenciesResponse {
    #[serde(default)]
    agencies: Vec<ApiAgency>,
}

#[derive(Debug, Deserialize)]
struct ApiAgency {
    slug: String,
    name: Option<String>,
    short_name: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    children: Vec<ApiAgency>,
    #[serde(default)]
    cfr_references: Vec<ApiCfrReference>,
}

#[derive(Debug, Deserialize)]
struct ApiCfrReference {
    title: Option<u16>,
    chapter: Option<String>,
    subtitle: Option<String>,
    subchapter: Option<String>,
}

impl EcfrApiSource {
    pub fn new(config: &SourcesConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent("cfr-pipeline/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: config.ecfr_base_url.trim_end_matches('/').to_string(),
            title_timeout: Duration::from_secs(config.title_timeout_secs),
            metadata_timeout: Duration::from_secs(config.metadata_timeout_secs),
        })
    }

    /// Titles metadata listing: numbers, names and latest issue dates.
    pub async fn fetch_titles_metadata(&self) -> Result<Vec<TitleMetadata>> {
        let url = format!("{}/versioner/v1/titles.json", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.metadata_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                source_name: "ecfr",
                status: status.as_u16(),
            });
        }
        let parsed: TitlesResponse = response.json().await?;
        Ok(parsed
            .titles
            .into_iter()
            .map(|t| TitleMetadata {
                number: t.number,
                name: t.name.unwrap_or_default(),
                latest_amended_on: t.latest_amended_on,
                latest_issue_date: t.latest_issue_date,
                up_to_date_as_of: t.up_to_date_as_of,
                reserved: t.reserved,
            })
            .collect())
    }

    /// Agency metadata: the agency tree plus its administered
    /// (title, chapter) references, flattened one level as the API nests
    /// children.
    pub async fn fetch_agencies(&self) -> Result<(Vec<Agency>, Vec<CfrReference>)> {
        let url = format!("{}/admin/v1/agencies.json", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.metadata_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                source_name: "ecfr",
                status: status.as_u16(),
            });
        }
        let parsed: AgenciesResponse = response.json().await?;

        let mut agencies = Vec::new();
        let mut references = Vec::new();
        for agency in parsed.agencies {
            flatten_agency(agency, None, &mut agencies, &mut references);
        }
        Ok((agencies, references))
    }

    fn full_title_url(&self, title: u16, date: &str) -> String {
        format!(
            "{}/versioner/v1/full/{}/title-{}.xml",
            self.base_url, date, title
        )
    }
}

fn flatten_agency(
    api: ApiAgency,
    parent_slug: Option<String>,
    agencies: &mut Vec<Agency>,
    references: &mut Vec<CfrReference>,
) {
    for reference in &api.cfr_references {
        // The API reports a chapter, a subtitle or a subchapter depending
        // on how the agency's scope is drawn; the first present one is the
        // grouping key, matching the chapter-level word-count rollup.
        let chapter = reference
            .chapter
            .clone()
            .or_else(|| reference.subtitle.clone())
            .or_else(|| reference.subchapter.clone());
        if let (Some(title), Some(chapter)) = (reference.title, chapter) {
            references.push(CfrReference {
                agency_slug: api.slug.clone(),
                title,
                chapter,
            });
        }
    }

    let slug = api.slug.clone();
    agencies.push(Agency {
        slug: api.slug,
        name: api.name.unwrap_or_default(),
        short_name: api.short_name,
        display_name: api.display_name,
        parent_slug,
    });

    for child in api.children {
        flatten_agency(child, Some(slug.clone()), agencies, references);
    }
}

#[async_trait]
impl TitleSource for EcfrApiSource {
    fn name(&self) -> &'static str {
        "ecfr"
    }

    async fn fetch_title(&self, request: &DocumentRequest) -> Result<RawTitleDocument> {
        let date = match request.period {
            Period::Current => request.issue_date.clone().ok_or(PipelineError::Internal {
                message: format!(
                    "current-period request for title {} carries no issue date",
                    request.title
                ),
            })?,
            Period::Annual(year) => format!("{}-12-31", year),
        };
        let url = self.full_title_url(request.title, &date);
        let body = get_bytes(&self.client, "ecfr", &url, self.title_timeout).await?;
        Ok(RawTitleDocument::Ecfr(body))
    }
}

// -------------------------------------------------------------------------
// govinfo bulk data (secondary)
// -------------------------------------------------------------------------

/// Client for the govinfo bulk-data archive. Current data is a single
/// eCFR-shaped document; annual editions are split across volumes probed
/// sequentially until the first 404.
pub struct GovinfoBulkSource {
    client: Client,
    ecfr_url: String,
    cfr_url: String,
    title_timeout: Duration,
    max_volumes: u16,
}

impl GovinfoBulkSource {
    pub fn new(config: &SourcesConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent("cfr-pipeline/0.1")
            .build()?;
        Ok(Self {
            client,
            ecfr_url: config.govinfo_ecfr_url.trim_end_matches('/').to_string(),
            cfr_url: config.govinfo_cfr_url.trim_end_matches('/').to_string(),
            title_timeout: Duration::from_secs(config.title_timeout_secs),
            max_volumes: config.max_volumes,
        })
    }

    async fn fetch_volumes(&self, title: u16, year: u16) -> Result<RawTitleDocument> {
        let mut volumes = Vec::new();
        for volume in 1..=self.max_volumes {
            let url = format!(
                "{}/{}/title-{}/CFR-{}-title{}-vol{}.xml",
                self.cfr_url, year, title, year, title, volume
            );
            match get_bytes(&self.client, "govinfo", &url, self.title_timeout).await {
                Ok(body) => volumes.push(body),
                // The volume past the last one 404s; that terminates the
                // probe rather than failing the fetch.
                Err(PipelineError::HttpStatus { status: 404, .. }) => break,
                Err(e) => return Err(e),
            }
        }

        if volumes.is_empty() {
            return Err(PipelineError::HttpStatus {
                source_name: "govinfo",
                status: 404,
            });
        }
        Ok(RawTitleDocument::GovinfoVolumes(volumes))
    }
}

#[async_trait]
impl TitleSource for GovinfoBulkSource {
    fn name(&self) -> &'static str {
        "govinfo"
    }

    async fn fetch_title(&self, request: &DocumentRequest) -> Result<RawTitleDocument> {
        match request.period {
            Period::Current => {
                let url = format!(
                    "{}/title-{}/ECFR-title{}.xml",
                    self.ecfr_url, request.title, request.title
                );
                let body = get_bytes(&self.client, "govinfo", &url, self.title_timeout).await?;
                Ok(RawTitleDocument::Ecfr(body))
            }
            Period::Annual(year) => self.fetch_volumes(request.title, year).await,
        }
    }
}
