use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::connectors::Connector;
use crate::error::SourceError;
use crate::ids::{ExternalIdConflict, PaperId, Source};
use crate::model::{PaperMetadata, SearchQuery, SearchResult, SortBy};
use crate::retry::RetryExecutor;

/// Fans queries out to the configured connectors and merges what comes back.
pub struct Aggregator {
    connectors: HashMap<Source, Arc<dyn Connector>>,
    executor: Arc<RetryExecutor>,
    deadline: Duration,
}

/// Outcome of one fan-out before deduplication.
struct Collected {
    by_source: BTreeMap<(u8, Source), Vec<PaperMetadata>>,
    errors: BTreeMap<String, String>,
}

/// A set of hits from one or more sources believed to be one paper.
struct Group {
    meta: PaperMetadata,
    keys: Vec<PaperId>,
    best_rank: usize,
    priority: u8,
    first_seen: usize,
}

impl Aggregator {
    pub fn new(
        connectors: impl IntoIterator<Item = Arc<dyn Connector>>,
        executor: Arc<RetryExecutor>,
        deadline: Duration,
    ) -> Self {
        let connectors = connectors.into_iter().map(|c| (c.source(), c)).collect();
        Self {
            connectors,
            executor,
            deadline,
        }
    }

    /// Enabled sources in priority order.
    pub fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.connectors.keys().copied().collect();
        sources.sort_by_key(|s| s.priority());
        sources
    }

    pub fn connectors(&self) -> &HashMap<Source, Arc<dyn Connector>> {
        &self.connectors
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn connector_for(&self, source: Source) -> Result<&Arc<dyn Connector>, SourceError> {
        self.connectors
            .get(&source)
            .ok_or_else(|| SourceError::invalid(format!("source '{}' is not enabled", source)))
    }

    /// Query each requested source concurrently, then deduplicate and order the union.
    /// Source failures land in `source_errors`; they never fail the call.
    pub async fn search_all(
        &self,
        query: &str,
        sources: &[Source],
        max_results_per_source: usize,
        sort_by: SortBy,
    ) -> SearchResult {
        let collected = self
            .fan_out(query, sources, max_results_per_source, sort_by)
            .await;
        finish(collected, BTreeMap::new(), sort_by)
    }

    /// Like [`Aggregator::search_all`] but takes caller-supplied source names. Unknown names are
    /// reported per name; the call fails only when no name is valid. An empty list means every
    /// enabled source.
    pub async fn search_all_named(
        &self,
        query: &str,
        names: &[String],
        max_results_per_source: usize,
        sort_by: SortBy,
    ) -> Result<SearchResult, SourceError> {
        if names.is_empty() {
            return Ok(self
                .search_all(query, &self.sources(), max_results_per_source, sort_by)
                .await);
        }

        let mut sources = Vec::new();
        let mut rejected = BTreeMap::new();
        for name in names {
            match name.parse::<Source>() {
                Ok(source) => sources.push(source),
                Err(e) => {
                    rejected.insert(name.clone(), e.to_string());
                }
            }
        }
        if sources.is_empty() {
            return Err(SourceError::invalid(format!(
                "no recognized source in [{}]",
                names.join(", ")
            )));
        }

        let collected = self
            .fan_out(query, &sources, max_results_per_source, sort_by)
            .await;
        Ok(finish(collected, rejected, sort_by))
    }

    async fn fan_out(
        &self,
        query: &str,
        sources: &[Source],
        max_results_per_source: usize,
        sort_by: SortBy,
    ) -> Collected {
        let mut requested = sources.to_vec();
        requested.sort_by_key(|s| s.priority());
        requested.dedup();
        tracing::info!(
            "Searching {} source(s) for '{}' (max {} each)",
            requested.len(),
            query,
            max_results_per_source
        );

        let mut errors = BTreeMap::new();
        let mut handles = Vec::new();
        for source in requested {
            let Ok(connector) = self.connector_for(source) else {
                errors.insert(source.name().to_string(), "source is not enabled".to_string());
                continue;
            };
            let connector = Arc::clone(connector);
            let executor = Arc::clone(&self.executor);
            let deadline = self.deadline;
            let query = SearchQuery::new(query, max_results_per_source, sort_by);
            let handle = tokio::spawn(async move {
                executor
                    .execute(source, deadline, || connector.search(&query))
                    .await
            });
            handles.push((source, handle));
        }

        // Every handle is awaited before any merging, so completion order cannot leak
        // into the result.
        let mut by_source = BTreeMap::new();
        for (source, handle) in handles {
            match handle.await {
                Ok(Ok(mut papers)) => {
                    papers.truncate(max_results_per_source);
                    tracing::debug!("{} returned {} result(s)", source, papers.len());
                    by_source.insert((source.priority(), source), papers);
                }
                Ok(Err(e)) => {
                    tracing::warn!("{} search failed: {}", source, e);
                    errors.insert(source.name().to_string(), e.to_string());
                }
                Err(e) => {
                    tracing::warn!("{} search task failed: {}", source, e);
                    errors.insert(source.name().to_string(), format!("search task failed: {}", e));
                }
            }
        }
        Collected { by_source, errors }
    }

    /// Metadata for one paper from the source its identifier belongs to.
    pub async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
        let connector = self.connector_for(id.source())?;
        self.executor
            .execute(id.source(), self.deadline, || connector.fetch_metadata(id))
            .await
    }

    /// Full-text bytes for one paper, or `None` when no source can provide them.
    pub async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError> {
        let connector = self.connector_for(id.source())?;
        self.executor
            .execute(id.source(), self.deadline, || connector.fetch_fulltext(id))
            .await
    }
}

fn finish(
    collected: Collected,
    mut rejected: BTreeMap<String, String>,
    sort_by: SortBy,
) -> SearchResult {
    let Collected { by_source, errors } = collected;
    let succeeded = by_source.len();
    let (papers, observations) = deduplicate(by_source, sort_by);
    rejected.extend(errors);
    let partial = !rejected.is_empty() && succeeded > 0;
    SearchResult {
        papers,
        source_errors: rejected,
        partial,
        observations,
    }
}

/// Merge hits that share any identity key, then order the groups.
fn deduplicate(
    by_source: BTreeMap<(u8, Source), Vec<PaperMetadata>>,
    sort_by: SortBy,
) -> (Vec<PaperMetadata>, Vec<ExternalIdConflict>) {
    let mut groups: Vec<Option<Group>> = Vec::new();
    let mut index: HashMap<PaperId, usize> = HashMap::new();
    let mut observations = Vec::new();
    let mut seen = 0usize;

    for ((priority, _), papers) in by_source {
        for (rank, paper) in papers.into_iter().enumerate() {
            let keys = paper.identity_keys();
            let mut matched: Vec<usize> = keys.iter().filter_map(|k| index.get(k).copied()).collect();
            matched.sort_unstable();
            matched.dedup();

            let Some((&target, absorbed)) = matched.split_first() else {
                for key in &keys {
                    index.insert(key.clone(), groups.len());
                }
                groups.push(Some(Group {
                    meta: paper,
                    keys,
                    best_rank: rank,
                    priority,
                    first_seen: seen,
                }));
                seen += 1;
                continue;
            };

            let Some(mut group) = groups[target].take() else {
                continue;
            };
            // A new hit can bridge two groups that were distinct until now.
            for &other in absorbed {
                if let Some(other) = groups[other].take() {
                    let (meta, conflicts) = group.meta.merge(other.meta);
                    group.meta = meta;
                    observations.extend(conflicts);
                    group.keys.extend(other.keys);
                    group.best_rank = group.best_rank.min(other.best_rank);
                    group.priority = group.priority.min(other.priority);
                    group.first_seen = group.first_seen.min(other.first_seen);
                }
            }
            let (meta, conflicts) = group.meta.merge(paper);
            group.meta = meta;
            observations.extend(conflicts);
            group.keys.extend(keys);
            group.keys.extend(group.meta.identity_keys());
            group.keys.sort();
            group.keys.dedup();
            group.best_rank = group.best_rank.min(rank);
            for key in &group.keys {
                index.insert(key.clone(), target);
            }
            groups[target] = Some(group);
        }
    }

    let mut merged: Vec<Group> = groups.into_iter().flatten().collect();
    match sort_by {
        SortBy::Relevance => merged.sort_by_key(|g| (g.best_rank, g.priority, g.first_seen)),
        SortBy::Date => merged.sort_by_key(|g| {
            (
                g.meta.published_date.is_none(),
                Reverse(g.meta.published_date),
                g.priority,
                g.first_seen,
            )
        }),
    }
    (merged.into_iter().map(|g| g.meta).collect(), observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::testing::StubConnector;
    use crate::ids::parse;
    use crate::retry::RetryPolicy;
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn fast_executor() -> Arc<RetryExecutor> {
        let fast = RetryPolicy {
            max_concurrent: 4,
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            min_interval: Duration::ZERO,
        };
        Arc::new(RetryExecutor::new(
            Source::ALL.into_iter().map(|s| (s, fast)).collect(),
        ))
    }

    fn aggregator(connectors: Vec<StubConnector>) -> Aggregator {
        Aggregator::new(
            connectors
                .into_iter()
                .map(|c| Arc::new(c) as Arc<dyn Connector>),
            fast_executor(),
            Duration::from_secs(5),
        )
    }

    fn paper(id: &str, title: &str) -> PaperMetadata {
        PaperMetadata::new(parse(id).unwrap(), title)
    }

    fn dated(id: &str, date: Option<(i32, u32, u32)>) -> PaperMetadata {
        let mut p = paper(id, id);
        p.published_date = date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d));
        p
    }

    fn ids(result: &SearchResult) -> Vec<String> {
        result.papers.iter().map(|p| p.id.to_string()).collect()
    }

    fn unavailable() -> SourceError {
        SourceError::Status {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[tokio::test]
    async fn test_truncates_to_max_in_rank_order() {
        let hits = (1..=5)
            .map(|n| paper(&format!("arxiv:2106.1484{}", n), &format!("hit {}", n)))
            .collect();
        let agg = aggregator(vec![StubConnector::new(Source::ArXiv).with_hits(hits)]);

        let result = agg
            .search_all("transformer protein folding", &[Source::ArXiv], 3, SortBy::Relevance)
            .await;
        assert_eq!(
            ids(&result),
            vec!["arxiv:2106.14841", "arxiv:2106.14842", "arxiv:2106.14843"]
        );
        assert!(!result.partial);
        assert!(result.source_errors.is_empty());
    }

    #[tokio::test]
    async fn test_failing_source_gives_partial_result() {
        let agg = aggregator(vec![
            StubConnector::new(Source::ArXiv).failing(unavailable),
            StubConnector::new(Source::PubMed).with_hits(vec![paper("pubmed:34265844", "AlphaFold")]),
        ]);

        let result = agg
            .search_all("alphafold", &[Source::ArXiv, Source::PubMed], 10, SortBy::Relevance)
            .await;
        assert!(result.partial);
        assert_eq!(result.source_errors.len(), 1);
        assert!(result.source_errors["arxiv"].contains("2 attempt"));
        assert_eq!(ids(&result), vec!["pubmed:34265844"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_without_holding_back_others() {
        let agg = aggregator(vec![
            StubConnector::new(Source::ArXiv)
                .with_hits(vec![paper("arxiv:2106.14843", "late")])
                .with_delay(Duration::from_secs(10)),
            StubConnector::new(Source::PubMed).with_hits(vec![paper("pubmed:34265844", "AlphaFold")]),
        ]);

        let started = tokio::time::Instant::now();
        let result = agg
            .search_all("alphafold", &[Source::ArXiv, Source::PubMed], 10, SortBy::Relevance)
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.partial);
        assert!(result.source_errors["arxiv"].contains("Timed out"));
        assert_eq!(ids(&result), vec!["pubmed:34265844"]);
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_not_partial() {
        let agg = aggregator(vec![
            StubConnector::new(Source::ArXiv).failing(|| SourceError::Parse("bad feed".into())),
        ]);
        let result = agg
            .search_all("x", &[Source::ArXiv, Source::GoogleScholar], 10, SortBy::Relevance)
            .await;
        assert!(!result.partial);
        assert!(result.papers.is_empty());
        assert_eq!(result.source_errors["googlescholar"], "source is not enabled");
        assert!(result.source_errors["arxiv"].contains("bad feed"));
    }

    #[tokio::test]
    async fn test_cross_referenced_hits_are_merged() {
        let arxiv_hit = paper("arxiv:2106.14843", "CLIPDraw");
        let mut s2_hit = paper(
            "semanticscholar:0123456789abcdef0123456789abcdef01234567",
            "CLIPDraw: Exploring Text-to-Drawing Synthesis",
        );
        s2_hit.authors = vec!["Kevin Frans".into()];
        s2_hit.citation_count = Some(120);
        s2_hit.external_ids.insert("arxiv".into(), "2106.14843".into());

        let agg = aggregator(vec![
            StubConnector::new(Source::ArXiv).with_hits(vec![arxiv_hit]),
            StubConnector::new(Source::SemanticScholar).with_hits(vec![s2_hit]),
        ]);
        let result = agg
            .search_all("clipdraw", &[Source::ArXiv, Source::SemanticScholar], 5, SortBy::Relevance)
            .await;

        assert_eq!(result.papers.len(), 1);
        let merged = &result.papers[0];
        assert_eq!(merged.title, "CLIPDraw: Exploring Text-to-Drawing Synthesis");
        assert_eq!(merged.citation_count, Some(120));
        assert_eq!(merged.external_ids["arxiv"], "2106.14843");
    }

    #[tokio::test]
    async fn test_no_two_results_share_an_identifier() {
        let mut bridge = paper("pubmed:34265844", "AlphaFold");
        bridge.external_ids.insert("arxiv".into(), "2106.14843".into());
        bridge
            .external_ids
            .insert("semanticscholar".into(), "CorpusId:235959867".into());

        let agg = aggregator(vec![
            StubConnector::new(Source::ArXiv).with_hits(vec![paper("arxiv:2106.14843v2", "a")]),
            StubConnector::new(Source::SemanticScholar)
                .with_hits(vec![paper("semanticscholar:CorpusId:235959867", "b")]),
            StubConnector::new(Source::PubMed).with_hits(vec![bridge]),
        ]);
        let result = agg
            .search_all(
                "alphafold",
                &[Source::ArXiv, Source::SemanticScholar, Source::PubMed],
                5,
                SortBy::Relevance,
            )
            .await;

        assert_eq!(result.papers.len(), 1);
        let mut seen = HashSet::new();
        for p in &result.papers {
            for key in p.identity_keys() {
                assert!(seen.insert(key), "identifier repeated across results");
            }
        }
    }

    #[tokio::test]
    async fn test_date_sort_breaks_ties_by_source_priority() {
        let agg = aggregator(vec![
            StubConnector::new(Source::PubMed).with_hits(vec![
                dated("pubmed:1", Some((2021, 6, 1))),
                dated("pubmed:2", None),
            ]),
            StubConnector::new(Source::ArXiv).with_hits(vec![
                dated("arxiv:2106.14843", Some((2021, 6, 1))),
                dated("arxiv:2301.00001", Some((2023, 1, 1))),
            ]),
        ]);
        let result = agg
            .search_all("q", &[Source::PubMed, Source::ArXiv], 5, SortBy::Date)
            .await;
        assert_eq!(
            ids(&result),
            vec!["arxiv:2301.00001", "arxiv:2106.14843", "pubmed:1", "pubmed:2"]
        );
    }

    #[tokio::test]
    async fn test_completion_order_does_not_change_output() {
        let run = |arxiv_delay: u64, s2_delay: u64| async move {
            let agg = aggregator(vec![
                StubConnector::new(Source::ArXiv)
                    .with_hits(vec![paper("arxiv:2106.14843", "a"), paper("arxiv:2106.00001", "b")])
                    .with_delay(Duration::from_millis(arxiv_delay)),
                StubConnector::new(Source::SemanticScholar)
                    .with_hits(vec![paper("semanticscholar:CorpusId:1", "c")])
                    .with_delay(Duration::from_millis(s2_delay)),
            ]);
            let result = agg
                .search_all("q", &[Source::SemanticScholar, Source::ArXiv], 5, SortBy::Relevance)
                .await;
            ids(&result)
        };
        let fast_arxiv = run(0, 40).await;
        let slow_arxiv = run(40, 0).await;
        assert_eq!(fast_arxiv, slow_arxiv);
        assert_eq!(
            fast_arxiv,
            vec!["arxiv:2106.14843", "semanticscholar:CorpusId:1", "arxiv:2106.00001"]
        );
    }

    #[tokio::test]
    async fn test_named_sources_report_unknown_names() {
        let agg = aggregator(vec![
            StubConnector::new(Source::ArXiv).with_hits(vec![paper("arxiv:2106.14843", "a")]),
        ]);
        let result = agg
            .search_all_named("q", &["ArXiv".into(), "biorxiv".into()], 5, SortBy::Relevance)
            .await
            .unwrap();
        assert_eq!(ids(&result), vec!["arxiv:2106.14843"]);
        assert!(result.source_errors.contains_key("biorxiv"));
        assert!(result.partial);

        let err = agg
            .search_all_named("q", &["biorxiv".into()], 5, SortBy::Relevance)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn test_single_paper_lookups_route_by_source() {
        let id = parse("arxiv:2106.14843").unwrap();
        let agg = aggregator(vec![StubConnector::new(Source::ArXiv)
            .with_metadata(paper("arxiv:2106.14843", "CLIPDraw"))
            .with_fulltext(id.clone(), b"%PDF-1.5")]);

        assert_eq!(agg.fetch_metadata(&id).await.unwrap().title, "CLIPDraw");
        assert_eq!(
            agg.fetch_fulltext(&id).await.unwrap().as_deref(),
            Some(&b"%PDF-1.5"[..])
        );

        let missing = parse("arxiv:2301.00001").unwrap();
        assert!(matches!(
            agg.fetch_metadata(&missing).await,
            Err(SourceError::NotFound(_))
        ));
        let disabled = parse("pubmed:1").unwrap();
        assert!(matches!(
            agg.fetch_fulltext(&disabled).await,
            Err(SourceError::InvalidIdentifier(_))
        ));
    }
}
