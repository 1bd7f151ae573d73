use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::connectors::arxiv::ArxivConnector;
use crate::connectors::google_scholar::GoogleScholarConnector;
use crate::connectors::pubmed::PubMedConnector;
use crate::connectors::semantic_scholar::SemanticScholarConnector;
use crate::connectors::{build_client, Connector};
use crate::graph::DEFAULT_CITATION_LIMIT;
use crate::ids::Source;
use crate::retry::{RetryExecutor, RetryPolicy, Throttled};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub enabled_sources: Vec<Source>,
    /// Entries of `SCHOLAR_GRAPH_SOURCES` that name no known source.
    pub unknown_sources: Vec<String>,
    pub semantic_scholar_api_key: Option<String>,
    pub pubmed_email: Option<String>,
    pub ncbi_api_key: Option<String>,
    /// Deadline for one executor call, retries included.
    pub timeout: Duration,
    pub max_retries: u32,
    pub citation_limit: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut enabled_sources = Vec::new();
        let mut unknown_sources = Vec::new();
        if let Some(list) = non_empty("SCHOLAR_GRAPH_SOURCES") {
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                match name.parse::<Source>() {
                    Ok(source) if !enabled_sources.contains(&source) => enabled_sources.push(source),
                    Ok(_) => {}
                    Err(_) => unknown_sources.push(name.to_lowercase()),
                }
            }
        }
        if enabled_sources.is_empty() {
            enabled_sources = Source::ALL.to_vec();
        }
        enabled_sources.sort_by_key(|s| s.priority());

        let timeout = number(&non_empty, "SCHOLAR_GRAPH_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);
        Self {
            enabled_sources,
            unknown_sources,
            semantic_scholar_api_key: non_empty("SEMANTIC_SCHOLAR_API_KEY"),
            pubmed_email: non_empty("PUBMED_EMAIL"),
            ncbi_api_key: non_empty("NCBI_API_KEY"),
            timeout: Duration::from_secs(timeout.max(1)),
            max_retries: number(&non_empty, "SCHOLAR_GRAPH_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            citation_limit: number(&non_empty, "SCHOLAR_GRAPH_CITATION_LIMIT", DEFAULT_CITATION_LIMIT),
        }
    }

    pub fn is_enabled(&self, source: Source) -> bool {
        self.enabled_sources.contains(&source)
    }

    /// Build the enabled connectors, each with its own HTTP client.
    ///
    /// arXiv answers citation lookups through Semantic Scholar, and Google Scholar falls back
    /// to arXiv for full text, so those delegates exist even when their own source is disabled.
    /// Delegated calls run through `executor` under the delegate's limits.
    pub fn build_connectors(
        &self,
        executor: &Arc<RetryExecutor>,
    ) -> anyhow::Result<Vec<Arc<dyn Connector>>> {
        for name in &self.unknown_sources {
            tracing::warn!("Ignoring unknown source '{}' in SCHOLAR_GRAPH_SOURCES", name);
        }

        let semantic_scholar = Arc::new(SemanticScholarConnector::new(
            build_client(self.timeout)?,
            self.semantic_scholar_api_key.clone(),
        ));
        let arxiv = Arc::new(
            ArxivConnector::new(build_client(self.timeout)?).with_citation_source(Arc::new(Throttled::new(
                semantic_scholar.clone(),
                executor.clone(),
                self.timeout,
            ))),
        );
        let pubmed = Arc::new(PubMedConnector::new(
            build_client(self.timeout)?,
            self.pubmed_email.clone(),
            self.ncbi_api_key.clone(),
        ));
        let google_scholar = Arc::new(
            GoogleScholarConnector::new(build_client(self.timeout)?).with_arxiv_fallback(Arc::new(
                Throttled::new(arxiv.clone(), executor.clone(), self.timeout),
            )),
        );

        let all: [Arc<dyn Connector>; 4] = [arxiv, semantic_scholar, pubmed, google_scholar];
        Ok(all
            .into_iter()
            .filter(|c| self.is_enabled(c.source()))
            .collect())
    }

    pub fn build_executor(&self) -> RetryExecutor {
        let policies: HashMap<Source, RetryPolicy> = Source::ALL
            .into_iter()
            .map(|source| {
                let keyed = match source {
                    Source::PubMed => self.ncbi_api_key.is_some(),
                    Source::SemanticScholar => self.semantic_scholar_api_key.is_some(),
                    Source::ArXiv | Source::GoogleScholar => false,
                };
                let policy = RetryPolicy::for_source(source, keyed).with_max_retries(self.max_retries);
                (source, policy)
            })
            .collect();
        RetryExecutor::new(policies)
    }

    /// Return a list of source status descriptions.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        Source::ALL
            .into_iter()
            .map(|source| {
                let note = match source {
                    Source::ArXiv => "No API key required; citations via Semantic Scholar".to_string(),
                    Source::PubMed => match (&self.ncbi_api_key, &self.pubmed_email) {
                        (Some(_), _) => "NCBI API key set".to_string(),
                        (None, Some(_)) => "Contact email set, no API key (3 req/s)".to_string(),
                        (None, None) => "No API key (3 req/s)".to_string(),
                    },
                    Source::SemanticScholar => {
                        if self.semantic_scholar_api_key.is_some() {
                            "API key set".to_string()
                        } else {
                            "No API key (rate limited)".to_string()
                        }
                    }
                    Source::GoogleScholar => "HTML scraping, heavily rate limited".to_string(),
                };
                let enabled = self.is_enabled(source);
                SourceStatus {
                    name: source.name().to_string(),
                    enabled,
                    note: if enabled {
                        note
                    } else {
                        "Disabled by SCHOLAR_GRAPH_SOURCES filter".to_string()
                    },
                }
            })
            .collect()
    }
}

fn number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{}='{}' is not a valid number, using the default", key, raw);
            default
        }),
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    pub note: String,
}
