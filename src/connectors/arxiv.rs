use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{check_status, download_pdf, Connector};
use crate::error::SourceError;
use crate::ids::{PaperId, Source};
use crate::model::{
    normalize_authors, parse_date, sort_newest_first, AuthorField, Direction, PaperMetadata,
    SearchQuery, SortBy,
};

const API_URL: &str = "https://export.arxiv.org/api/query";
const PDF_URL: &str = "https://arxiv.org/pdf";

pub struct ArxivConnector {
    client: reqwest::Client,
    api_url: String,
    pdf_url: String,
    citation_source: Option<Arc<dyn Connector>>,
}

impl ArxivConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_url: API_URL.to_string(),
            pdf_url: PDF_URL.to_string(),
            citation_source: None,
        }
    }

    #[cfg(test)]
    pub fn with_base_urls(mut self, api_url: impl Into<String>, pdf_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self.pdf_url = pdf_url.into();
        self
    }

    /// arXiv publishes no citation data; citation lookups go to this connector instead.
    pub fn with_citation_source(mut self, connector: Arc<dyn Connector>) -> Self {
        self.citation_source = Some(connector);
        self
    }

    async fn query(&self, params: &[(&str, &str)]) -> Result<Vec<PaperMetadata>, SourceError> {
        let resp = self.client.get(&self.api_url).query(params).send().await?;
        let body = check_status(resp, "arXiv query").await?.text().await?;
        parse_atom_feed(&body)
    }
}

#[async_trait]
impl Connector for ArxivConnector {
    fn source(&self) -> Source {
        Source::ArXiv
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperMetadata>, SourceError> {
        let search_query = format!("all:{}", query.query);
        let max_results = query.max_results.to_string();
        let sort_by = match query.sort_by {
            SortBy::Relevance => "relevance",
            SortBy::Date => "submittedDate",
        };
        let mut papers = self
            .query(&[
                ("search_query", search_query.as_str()),
                ("start", "0"),
                ("max_results", max_results.as_str()),
                ("sortBy", sort_by),
                ("sortOrder", "descending"),
            ])
            .await?;
        papers.truncate(query.max_results);
        if query.sort_by == SortBy::Date {
            sort_newest_first(&mut papers);
        }
        Ok(papers)
    }

    async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
        self.query(&[("id_list", id.native_id())])
            .await?
            .into_iter()
            .find(|p| p.id == *id)
            .ok_or_else(|| SourceError::not_found(id.to_string()))
    }

    async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError> {
        let url = format!("{}/{}", self.pdf_url, id.native_id());
        download_pdf(&self.client, &url).await
    }

    async fn fetch_citations(
        &self,
        id: &PaperId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<PaperId>, SourceError> {
        match &self.citation_source {
            Some(delegate) => delegate.fetch_citations(id, direction, limit).await,
            None => {
                tracing::debug!("No citation source configured for arXiv; {} has no edges", id);
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Default)]
struct Entry {
    raw_id: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    author_name: String,
    doi: String,
    journal_ref: String,
    link_abs: String,
    link_pdf: String,
}

impl Entry {
    fn record_link(&mut self, e: &BytesStart<'_>) {
        let mut href = String::new();
        let mut title = String::new();
        for attr in e.attributes().flatten() {
            let val = String::from_utf8_lossy(&attr.value).to_string();
            match attr.key.as_ref() {
                b"href" => href = val,
                b"title" => title = val,
                _ => {}
            }
        }
        if title == "pdf" {
            self.link_pdf = href;
        } else if self.link_abs.is_empty() && href.contains("/abs/") {
            self.link_abs = href;
        }
    }

    fn into_metadata(self) -> Option<PaperMetadata> {
        let native = self
            .raw_id
            .split_once("/abs/")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.raw_id);
        let id = match PaperId::new(Source::ArXiv, native) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!("Skipping arXiv entry: {}", e);
                return None;
            }
        };
        let title = collapse_whitespace(&self.title);
        if title.is_empty() {
            return None;
        }

        let mut meta = PaperMetadata::new(id, title);
        meta.authors = normalize_authors(AuthorField::Many(self.authors));
        meta.abstract_text = Some(collapse_whitespace(&self.summary)).filter(|s| !s.is_empty());
        meta.published_date = parse_date(&self.published);
        meta.venue = Some(collapse_whitespace(&self.journal_ref)).filter(|s| !s.is_empty());
        let doi = self.doi.trim();
        if !doi.is_empty() {
            meta.doi = Some(doi.to_string());
            meta.external_ids.insert("doi".into(), doi.to_string());
        }
        meta.url = Some(self.link_abs).filter(|s| !s.is_empty());
        meta.pdf_url = Some(self.link_pdf).filter(|s| !s.is_empty());
        meta.fulltext_available = true;
        Some(meta)
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an arXiv Atom feed into normalized records, skipping entries without a valid ID.
pub(crate) fn parse_atom_feed(xml: &str) -> Result<Vec<PaperMetadata>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut entry: Option<Entry> = None;
    let mut current_tag = String::new();
    let mut in_author = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    entry = Some(Entry::default());
                } else if let Some(current) = entry.as_mut() {
                    if tag == "author" {
                        in_author = true;
                        current.author_name.clear();
                    } else if tag == "link" {
                        current.record_link(&e);
                    }
                    current_tag = tag;
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(current) = entry.as_mut() {
                    if e.name().as_ref() == b"link" {
                        current.record_link(&e);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(current) = entry.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "id" => current.raw_id.push_str(text.trim()),
                        "title" => current.title.push_str(&text),
                        "summary" => current.summary.push_str(&text),
                        "published" => current.published.push_str(text.trim()),
                        "name" if in_author => current.author_name.push_str(&text),
                        "arxiv:doi" => current.doi.push_str(&text),
                        "arxiv:journal_ref" => current.journal_ref.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    if let Some(meta) = entry.take().and_then(Entry::into_metadata) {
                        papers.push(meta);
                    }
                } else if tag == "author" && in_author {
                    in_author = false;
                    if let Some(current) = entry.as_mut() {
                        let name = current.author_name.trim().to_string();
                        if !name.is_empty() {
                            current.authors.push(name);
                        }
                    }
                }
                if tag == current_tag {
                    current_tag.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(papers)
}
