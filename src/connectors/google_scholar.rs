use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::{check_status, download_pdf, Connector};
use crate::error::SourceError;
use crate::ids::{self, PaperId, Source};
use crate::model::{
    normalize_authors, parse_date, sort_newest_first, AuthorField, Direction, EdgeDirection,
    PaperMetadata, SearchQuery, SortBy,
};

const BASE_URL: &str = "https://scholar.google.com";

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("valid regex"));
static CLUSTER_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:cites|cluster)=([A-Za-z0-9_-]+)").expect("valid regex"));
static CITED_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Cited by (\d+)").expect("valid regex"));

/// Google Scholar has no API; results are scraped from the HTML result pages.
pub struct GoogleScholarConnector {
    client: reqwest::Client,
    base_url: String,
    arxiv_fallback: Option<Arc<dyn Connector>>,
}

impl GoogleScholarConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
            arxiv_fallback: None,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Full text for results that link to an arXiv preprint is fetched from arXiv
    /// when Scholar itself offers no PDF.
    pub fn with_arxiv_fallback(mut self, connector: Arc<dyn Connector>) -> Self {
        self.arxiv_fallback = Some(connector);
        self
    }

    async fn results_page(&self, params: &[(&str, &str)]) -> Result<Vec<PaperMetadata>, SourceError> {
        let resp = self
            .client
            .get(format!("{}/scholar", self.base_url))
            .query(&[("hl", "en")])
            .query(params)
            .send()
            .await?;
        let html = check_status(resp, "Google Scholar results").await?.text().await?;
        parse_scholar_html(&html)
    }
}

#[async_trait]
impl Connector for GoogleScholarConnector {
    fn source(&self) -> Source {
        Source::GoogleScholar
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperMetadata>, SourceError> {
        let num = query.max_results.min(20).to_string();
        let mut params = vec![("q", query.query.as_str()), ("num", num.as_str())];
        if query.sort_by == SortBy::Date {
            params.push(("scisbd", "1"));
        }
        let mut papers = self.results_page(&params).await?;
        papers.truncate(query.max_results);
        if query.sort_by == SortBy::Date {
            sort_newest_first(&mut papers);
        }
        Ok(papers)
    }

    async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
        let mut papers = self.results_page(&[("cluster", id.native_id())]).await?;
        // A cluster page may lead with a related version; only a lone result stands in for the cluster.
        let pos = match papers.iter().position(|p| p.id == *id) {
            Some(pos) => pos,
            None if papers.len() == 1 => 0,
            None => return Err(SourceError::not_found(id.to_string())),
        };
        let mut meta = papers.swap_remove(pos);
        meta.id = id.clone();
        Ok(meta)
    }

    async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError> {
        let meta = self.fetch_metadata(id).await?;
        if let Some(pdf_url) = &meta.pdf_url {
            match download_pdf(&self.client, pdf_url).await {
                Ok(Some(bytes)) => return Ok(Some(bytes)),
                Ok(None) => {}
                Err(e) => tracing::debug!("PDF download from {} failed: {}", pdf_url, e),
            }
        }

        let arxiv_id = meta
            .external_ids
            .get("arxiv")
            .and_then(|raw| PaperId::new(Source::ArXiv, raw).ok());
        match (arxiv_id, &self.arxiv_fallback) {
            (Some(arxiv_id), Some(arxiv)) => {
                tracing::debug!("Falling back to arXiv for {} via {}", id, arxiv_id);
                arxiv.fetch_fulltext(&arxiv_id).await
            }
            _ => Ok(None),
        }
    }

    /// Scholar only exposes the "cited by" side of the graph.
    async fn fetch_citations(
        &self,
        id: &PaperId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<PaperId>, SourceError> {
        if !direction.edges().contains(&EdgeDirection::CitedBy) {
            return Ok(Vec::new());
        }
        let num = limit.min(20).to_string();
        let papers = self
            .results_page(&[("cites", id.native_id()), ("num", num.as_str())])
            .await?;
        Ok(papers.into_iter().map(|p| p.id).take(limit).collect())
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("{:?}", e)))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn parse_scholar_html(html: &str) -> Result<Vec<PaperMetadata>, SourceError> {
    let document = Html::parse_document(html);

    let captcha = selector("#gs_captcha_ccl, form#captcha-form")?;
    if document.select(&captcha).next().is_some() || html.contains("unusual traffic") {
        return Err(SourceError::RateLimited { retry_after: None });
    }

    let result_sel = selector("div.gs_r.gs_or")?;
    let title_sel = selector("h3.gs_rt")?;
    let title_link_sel = selector("h3.gs_rt a")?;
    let byline_sel = selector("div.gs_a")?;
    let snippet_sel = selector("div.gs_rs")?;
    let pdf_sel = selector("div.gs_or_ggsm a")?;
    let link_sel = selector("div.gs_fl a")?;

    let mut papers = Vec::new();
    for result in document.select(&result_sel) {
        let links: Vec<(String, String)> = result
            .select(&link_sel)
            .map(|a| (a.value().attr("href").unwrap_or_default().to_string(), text_of(a)))
            .collect();

        let cluster = links
            .iter()
            .find_map(|(href, _)| CLUSTER_PARAM.captures(href).map(|c| c[1].to_string()))
            .or_else(|| result.value().attr("data-cid").map(str::to_string));
        let Some(id) = cluster.and_then(|c| PaperId::new(Source::GoogleScholar, &c).ok()) else {
            continue;
        };

        let title_link = result.select(&title_link_sel).next();
        let title = title_link
            .or_else(|| result.select(&title_sel).next())
            .map(text_of)
            .unwrap_or_default();
        // Citation-only entries carry a "[CITATION]" marker before the title.
        let title = title
            .trim_start_matches("[CITATION]")
            .trim_start_matches("[C]")
            .trim_start_matches("[BOOK]")
            .trim_start_matches("[B]")
            .trim()
            .to_string();
        if title.is_empty() {
            continue;
        }

        let mut meta = PaperMetadata::new(id, title);
        meta.url = title_link
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string);

        if let Some(byline) = result.select(&byline_sel).next().map(text_of) {
            let mut parts = byline.split(" - ");
            if let Some(authors) = parts.next() {
                meta.authors = normalize_authors(AuthorField::One(authors.to_string()));
            }
            if let Some(venue_year) = parts.next() {
                // Only the trailing year is the publication year; earlier matches belong to the venue.
                let year = YEAR.find_iter(venue_year).last();
                meta.published_date = year.and_then(|m| parse_date(m.as_str()));
                let venue = match year {
                    Some(m) => format!("{}{}", &venue_year[..m.start()], &venue_year[m.end()..]),
                    None => venue_year.to_string(),
                };
                let venue = venue.trim().trim_end_matches(',').trim();
                if !venue.is_empty() {
                    meta.venue = Some(venue.to_string());
                }
            }
        }

        meta.abstract_text = result
            .select(&snippet_sel)
            .next()
            .map(text_of)
            .filter(|s| !s.is_empty());
        meta.pdf_url = result
            .select(&pdf_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string);
        meta.fulltext_available = meta.pdf_url.is_some();
        meta.citation_count = links.iter().find_map(|(_, text)| {
            CITED_BY
                .captures(text)
                .and_then(|c| c[1].parse::<u32>().ok())
        });

        for link in meta.url.iter().chain(meta.pdf_url.iter()) {
            if let Ok(other) = ids::resolve(link) {
                if other.source() != Source::GoogleScholar {
                    meta.external_ids
                        .entry(other.source().name().to_string())
                        .or_insert_with(|| other.native_id().to_string());
                }
            }
        }
        if meta.external_ids.contains_key("arxiv") {
            meta.fulltext_available = true;
        }

        papers.push(meta);
    }
    Ok(papers)
}
