use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use super::{check_status, download_pdf, Connector};
use crate::error::SourceError;
use crate::ids::{PaperId, Source};
use crate::model::{
    normalize_authors, parse_date, sort_newest_first, AuthorField, Direction, EdgeDirection,
    PaperMetadata, SearchQuery, SortBy,
};

const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const FIELDS: &str =
    "paperId,externalIds,url,title,abstract,venue,year,publicationDate,journal,authors,citationCount,openAccessPdf";

pub struct SemanticScholarConnector {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl SemanticScholarConnector {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            base_url: BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    /// The Graph API resolves arXiv and PubMed IDs directly through prefixed lookups.
    fn lookup_key(id: &PaperId) -> Result<String, SourceError> {
        match id.source() {
            Source::SemanticScholar => Ok(id.native_id().to_string()),
            Source::ArXiv => Ok(format!("ARXIV:{}", id.native_id())),
            Source::PubMed => Ok(format!("PMID:{}", id.native_id())),
            Source::GoogleScholar => Err(SourceError::not_found(format!(
                "{} cannot be resolved by Semantic Scholar",
                id
            ))),
        }
    }

    async fn edges(
        &self,
        lookup: &str,
        edge: EdgeDirection,
        limit: usize,
    ) -> Result<Vec<PaperId>, SourceError> {
        let (endpoint, field) = match edge {
            EdgeDirection::Cites => ("references", "citedPaper.paperId"),
            EdgeDirection::CitedBy => ("citations", "citingPaper.paperId"),
        };
        let url = format!("{}/paper/{}/{}", self.base_url, lookup, endpoint);
        let limit = limit.clamp(1, 1000).to_string();
        let resp = self
            .add_auth(self.client.get(&url).query(&[("fields", field), ("limit", limit.as_str())]))
            .send()
            .await?;
        let resp: S2EdgeResponse = check_status(resp, lookup).await?.json().await?;
        Ok(resp
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| match edge {
                EdgeDirection::Cites => e.cited_paper,
                EdgeDirection::CitedBy => e.citing_paper,
            })
            .filter_map(|r| r.paper_id)
            .filter_map(|pid| PaperId::new(Source::SemanticScholar, &pid).ok())
            .collect())
    }
}

#[derive(Deserialize)]
struct S2SearchResponse {
    data: Option<Vec<S2Paper>>,
}

#[derive(Deserialize)]
struct S2EdgeResponse {
    data: Option<Vec<S2Edge>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Edge {
    citing_paper: Option<S2Ref>,
    cited_paper: Option<S2Ref>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Ref {
    paper_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    authors: Option<Vec<S2Author>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    venue: Option<String>,
    journal: Option<S2Journal>,
    year: Option<i32>,
    publication_date: Option<String>,
    external_ids: Option<HashMap<String, serde_json::Value>>,
    citation_count: Option<u32>,
    url: Option<String>,
    open_access_pdf: Option<S2Pdf>,
}

#[derive(Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2Journal {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2Pdf {
    url: Option<String>,
}

fn s2_to_metadata(p: S2Paper) -> Option<PaperMetadata> {
    let id = PaperId::new(Source::SemanticScholar, p.paper_id.as_deref()?).ok()?;
    let mut meta = PaperMetadata::new(id, p.title.unwrap_or_default().trim());
    meta.authors = normalize_authors(AuthorField::Many(
        p.authors
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.name)
            .collect(),
    ));
    meta.abstract_text = p.abstract_text.filter(|a| !a.trim().is_empty());
    meta.published_date = p
        .publication_date
        .as_deref()
        .and_then(parse_date)
        .or_else(|| p.year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)));
    meta.venue = p
        .journal
        .and_then(|j| j.name)
        .or(p.venue)
        .filter(|v| !v.trim().is_empty());

    for (key, value) in p.external_ids.unwrap_or_default() {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let name = match key.as_str() {
            "ArXiv" => "arxiv",
            "PubMed" => "pubmed",
            "DOI" => {
                meta.doi = Some(value.clone());
                "doi"
            }
            _ => continue,
        };
        meta.external_ids.insert(name.to_string(), value);
    }

    meta.citation_count = p.citation_count;
    meta.url = p.url;
    meta.pdf_url = p.open_access_pdf.and_then(|pdf| pdf.url).filter(|u| !u.is_empty());
    meta.fulltext_available = meta.pdf_url.is_some();
    Some(meta)
}

#[async_trait]
impl Connector for SemanticScholarConnector {
    fn source(&self) -> Source {
        Source::SemanticScholar
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperMetadata>, SourceError> {
        let url = format!("{}/paper/search", self.base_url);
        let limit = query.max_results.min(100).to_string();
        let resp = self
            .add_auth(self.client.get(&url).query(&[
                ("query", query.query.as_str()),
                ("limit", limit.as_str()),
                ("fields", FIELDS),
            ]))
            .send()
            .await?;
        let resp: S2SearchResponse = check_status(resp, "Semantic Scholar search").await?.json().await?;
        let mut papers: Vec<PaperMetadata> = resp
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(s2_to_metadata)
            .take(query.max_results)
            .collect();
        if query.sort_by == SortBy::Date {
            sort_newest_first(&mut papers);
        }
        Ok(papers)
    }

    async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
        let lookup = Self::lookup_key(id)?;
        let url = format!("{}/paper/{}", self.base_url, lookup);
        let resp = self
            .add_auth(self.client.get(&url).query(&[("fields", FIELDS)]))
            .send()
            .await?;
        let paper: S2Paper = check_status(resp, id).await?.json().await?;
        s2_to_metadata(paper).ok_or_else(|| SourceError::Parse(format!("record for {} has no paperId", id)))
    }

    async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError> {
        let meta = self.fetch_metadata(id).await?;
        match meta.pdf_url {
            Some(url) => download_pdf(&self.client, &url).await,
            None => Ok(None),
        }
    }

    async fn fetch_citations(
        &self,
        id: &PaperId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<PaperId>, SourceError> {
        let lookup = Self::lookup_key(id)?;
        let mut found = Vec::new();
        for edge in direction.edges() {
            found.extend(self.edges(&lookup, *edge, limit).await?);
        }
        found.truncate(limit);
        Ok(found)
    }
}
