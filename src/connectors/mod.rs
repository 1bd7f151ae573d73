pub mod arxiv;
pub mod google_scholar;
pub mod pubmed;
pub mod semantic_scholar;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};

use crate::error::SourceError;
use crate::ids::{PaperId, Source};
use crate::model::{Direction, PaperMetadata, SearchQuery};

pub const USER_AGENT: &str = concat!("scholar-graph/", env!("CARGO_PKG_VERSION"));

/// Uniform capability contract every scholarly source is wrapped behind. All
/// source-specific shapes (identifier syntax, author fields, date formats) are
/// normalized inside the implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    fn source(&self) -> Source;

    /// Source-native relevance order, or newest first when `query.sort_by` is `Date`.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperMetadata>, SourceError>;

    async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError>;

    /// `Ok(None)` when the source has no retrievable full text.
    async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError>;

    async fn fetch_citations(
        &self,
        id: &PaperId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<PaperId>, SourceError>;
}

/// Build the per-connector HTTP handle. One is created per connector at startup.
pub fn build_client(request_timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(request_timeout)
        .build()
}

/// Map non-success statuses onto the error taxonomy; `what` names the missing record on 404.
pub(crate) async fn check_status(
    resp: reqwest::Response,
    what: impl std::fmt::Display,
) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 404 {
        return Err(SourceError::not_found(what.to_string()));
    }
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SourceError::RateLimited { retry_after });
    }
    let mut message = resp.text().await.unwrap_or_default();
    message.truncate(200);
    Err(SourceError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Fetch a PDF. Missing documents and non-PDF landing pages yield `Ok(None)`.
pub(crate) async fn download_pdf(
    client: &reqwest::Client,
    url: &str,
) -> Result<Option<Vec<u8>>, SourceError> {
    let resp = client.get(url).send().await?;
    if matches!(resp.status().as_u16(), 403 | 404 | 410) {
        tracing::debug!("No PDF at {} ({})", url, resp.status());
        return Ok(None);
    }
    let resp = check_status(resp, url).await?;
    let is_pdf_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("pdf"));
    let bytes = resp.bytes().await?;
    if is_pdf_type || bytes.starts_with(b"%PDF") {
        Ok(Some(bytes.to_vec()))
    } else {
        tracing::debug!("Content at {} is not a PDF", url);
        Ok(None)
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::Connector;
    use crate::error::SourceError;
    use crate::ids::{PaperId, Source};
    use crate::model::{Direction, EdgeDirection, PaperMetadata, SearchQuery};

    /// In-memory connector with canned answers and call accounting.
    pub struct StubConnector {
        source: Source,
        hits: Vec<PaperMetadata>,
        metadata: HashMap<PaperId, PaperMetadata>,
        fulltext: HashMap<PaperId, Vec<u8>>,
        citations: HashMap<(PaperId, EdgeDirection), Vec<PaperId>>,
        failure: Option<fn() -> SourceError>,
        delay: Duration,
        pub calls: AtomicUsize,
        pub expanded: Mutex<Vec<PaperId>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubConnector {
        pub fn new(source: Source) -> Self {
            Self {
                source,
                hits: Vec::new(),
                metadata: HashMap::new(),
                fulltext: HashMap::new(),
                citations: HashMap::new(),
                failure: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                expanded: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        pub fn with_hits(mut self, hits: Vec<PaperMetadata>) -> Self {
            self.hits = hits;
            self
        }

        pub fn with_metadata(mut self, meta: PaperMetadata) -> Self {
            self.metadata.insert(meta.id.clone(), meta);
            self
        }

        pub fn with_fulltext(mut self, id: PaperId, bytes: &[u8]) -> Self {
            self.fulltext.insert(id, bytes.to_vec());
            self
        }

        pub fn with_citations(mut self, from: PaperId, direction: EdgeDirection, to: Vec<PaperId>) -> Self {
            self.citations.insert((from, direction), to);
            self
        }

        pub fn failing(mut self, failure: fn() -> SourceError) -> Self {
            self.failure = Some(failure);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Most calls observed running at the same time.
        pub fn peak_in_flight(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        async fn enter(&self) -> Result<(), SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.failure {
                Some(fail) => Err(fail()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Connector for StubConnector {
        fn source(&self) -> Source {
            self.source
        }

        async fn search(&self, _query: &SearchQuery) -> Result<Vec<PaperMetadata>, SourceError> {
            self.enter().await?;
            Ok(self.hits.clone())
        }

        async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
            self.enter().await?;
            self.metadata
                .get(id)
                .cloned()
                .ok_or_else(|| SourceError::not_found(id.to_string()))
        }

        async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError> {
            self.enter().await?;
            Ok(self.fulltext.get(id).cloned())
        }

        async fn fetch_citations(
            &self,
            id: &PaperId,
            direction: Direction,
            limit: usize,
        ) -> Result<Vec<PaperId>, SourceError> {
            self.enter().await?;
            if let Ok(mut expanded) = self.expanded.lock() {
                expanded.push(id.clone());
            }
            Ok(direction
                .edges()
                .iter()
                .flat_map(|edge| {
                    self.citations
                        .get(&(id.clone(), *edge))
                        .cloned()
                        .unwrap_or_default()
                })
                .take(limit)
                .collect())
        }
    }
}
