use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ids::{self, ExternalIdConflict, PaperId, Source};

static AUTHOR_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*|;\s*|\s+and\s+").expect("valid regex"));

/// Normalized metadata for one paper, whatever source produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub id: PaperId,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub published_date: Option<NaiveDate>,
    pub venue: Option<String>,
    /// Cross-references keyed by source name (`arxiv`, `pubmed`, ...) or `doi`.
    pub external_ids: BTreeMap<String, String>,
    pub fulltext_available: bool,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    pub doi: Option<String>,
    pub citation_count: Option<u32>,
}

impl PaperMetadata {
    pub fn new(id: PaperId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            authors: Vec::new(),
            abstract_text: None,
            published_date: None,
            venue: None,
            external_ids: BTreeMap::new(),
            fulltext_available: false,
            url: None,
            pdf_url: None,
            doi: None,
            citation_count: None,
        }
    }

    /// Number of populated fields; the richer record survives a merge.
    pub fn richness(&self) -> u32 {
        let filled = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.trim().is_empty());
        [
            !self.title.trim().is_empty(),
            !self.authors.is_empty(),
            filled(&self.abstract_text),
            self.published_date.is_some(),
            filled(&self.venue),
            !self.external_ids.is_empty(),
            self.fulltext_available,
            filled(&self.url),
            filled(&self.pdf_url),
            filled(&self.doi),
            self.citation_count.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count() as u32
    }

    /// Every identifier this record answers to: its own plus parseable cross-references.
    pub fn identity_keys(&self) -> Vec<PaperId> {
        let mut keys = vec![self.id.clone()];
        for (key, value) in &self.external_ids {
            let Ok(source) = key.parse::<Source>() else {
                continue;
            };
            if let Ok(id) = PaperId::new(source, value) {
                if !keys.contains(&id) {
                    keys.push(id);
                }
            }
        }
        keys
    }

    /// Merge two records believed to describe the same paper. `self` counts as first-seen:
    /// it wins ties on richness and keeps its external IDs on conflict.
    pub fn merge(self, other: PaperMetadata) -> (PaperMetadata, Vec<ExternalIdConflict>) {
        let (external_ids, conflicts) = ids::merge_external_ids(&self, &other);
        let (mut winner, loser) = if other.richness() > self.richness() {
            (other, self)
        } else {
            (self, other)
        };

        winner.external_ids = external_ids;
        if loser.id != winner.id {
            winner
                .external_ids
                .entry(loser.id.source().name().to_string())
                .or_insert_with(|| loser.id.native_id().to_string());
        }
        if winner.authors.is_empty() {
            winner.authors = loser.authors;
        }
        winner.abstract_text = winner.abstract_text.or(loser.abstract_text);
        winner.published_date = winner.published_date.or(loser.published_date);
        winner.venue = winner.venue.or(loser.venue);
        winner.url = winner.url.or(loser.url);
        winner.pdf_url = winner.pdf_url.or(loser.pdf_url);
        winner.doi = winner.doi.or(loser.doi);
        winner.citation_count = winner.citation_count.or(loser.citation_count);
        winner.fulltext_available |= loser.fulltext_available;
        (winner, conflicts)
    }
}

/// Author data as upstream sources deliver it: one delimited string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AuthorField {
    One(String),
    Many(Vec<String>),
}

/// Every connector funnels author data through here so callers only ever see a list.
pub fn normalize_authors(field: AuthorField) -> Vec<String> {
    let names: Vec<String> = match field {
        AuthorField::One(joined) => AUTHOR_SEPARATOR
            .split(&joined)
            .map(str::to_string)
            .collect(),
        AuthorField::Many(list) => list,
    };
    names
        .into_iter()
        .map(|name| name.trim().trim_end_matches('…').trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Lenient date parsing for the formats seen upstream: ISO timestamps, `YYYY-MM-DD`,
/// `YYYY-MM`, `YYYY`, and MEDLINE-style `2020 Jan 15` / `2020 Jan-Feb`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some(date) = raw
        .get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
    {
        return Some(date);
    }

    let mut tokens = raw
        .split(|c: char| c == '-' || c == '/' || c.is_whitespace())
        .filter(|t| !t.is_empty());
    let year = tokens
        .next()
        .filter(|t| t.len() == 4)
        .and_then(|t| t.parse::<i32>().ok())?;
    let month = tokens.next().and_then(parse_month);
    let day = month
        .and_then(|_| tokens.next())
        .and_then(|t| t.parse::<u32>().ok())
        .filter(|d| (1..=31).contains(d));
    NaiveDate::from_ymd_opt(year, month.unwrap_or(1), day.unwrap_or(1))
}

fn parse_month(token: &str) -> Option<u32> {
    if let Ok(n) = token.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let prefix = token.get(..3)?.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|i| i as u32 + 1)
}

/// Newest first; undated records go last, otherwise the input order is kept.
pub fn sort_newest_first(papers: &mut [PaperMetadata]) {
    papers.sort_by_key(|p| (p.published_date.is_none(), Reverse(p.published_date)));
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    Date,
}

/// What a connector's `search` is asked for.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    pub sort_by: SortBy,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, max_results: usize, sort_by: SortBy) -> Self {
        Self {
            query: query.into(),
            max_results,
            sort_by,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResult {
    pub papers: Vec<PaperMetadata>,
    pub source_errors: BTreeMap<String, String>,
    pub partial: bool,
    /// Cross-reference disagreements seen while merging duplicates.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<ExternalIdConflict>,
}

/// Which relationships to follow from a paper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Cites,
    CitedBy,
    #[default]
    Both,
}

impl Direction {
    pub fn edges(self) -> &'static [EdgeDirection] {
        match self {
            Direction::Cites => &[EdgeDirection::Cites],
            Direction::CitedBy => &[EdgeDirection::CitedBy],
            Direction::Both => &[EdgeDirection::Cites, EdgeDirection::CitedBy],
        }
    }
}

impl From<EdgeDirection> for Direction {
    fn from(edge: EdgeDirection) -> Self {
        match edge {
            EdgeDirection::Cites => Direction::Cites,
            EdgeDirection::CitedBy => Direction::CitedBy,
        }
    }
}

/// `from` cites `to`, or `from` is cited by `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDirection {
    Cites,
    CitedBy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CitationEdge {
    pub from: PaperId,
    pub to: PaperId,
    pub direction: EdgeDirection,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CitationGraph {
    pub nodes: BTreeSet<PaperId>,
    pub edges: BTreeSet<CitationEdge>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<PaperId, PaperMetadata>,
    /// Per-node expansion or lookup failures, keyed by node ID.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}
