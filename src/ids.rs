use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::model::PaperMetadata;

static ARXIV_NEW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}\.\d{4,5}$").expect("valid regex"));
static ARXIV_OLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]+(-[a-z]+)*(\.[A-Z]{2})?/\d{7}$").expect("valid regex")
});
static ARXIV_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v\d+$").expect("valid regex"));
static PMID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,9}$").expect("valid regex"));
static S2_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{40}$").expect("valid regex"));
static S2_CORPUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i:corpusid):(\d+)$").expect("valid regex"));
static SCHOLAR_CLUSTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

/// The scholarly sources a paper identifier can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    ArXiv,
    PubMed,
    SemanticScholar,
    GoogleScholar,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::ArXiv,
        Source::PubMed,
        Source::SemanticScholar,
        Source::GoogleScholar,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Source::ArXiv => "arxiv",
            Source::PubMed => "pubmed",
            Source::SemanticScholar => "semanticscholar",
            Source::GoogleScholar => "googlescholar",
        }
    }

    /// Tie-break order used when sorting merged results: lower wins.
    pub fn priority(self) -> u8 {
        match self {
            Source::ArXiv => 0,
            Source::SemanticScholar => 1,
            Source::PubMed => 2,
            Source::GoogleScholar => 3,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Source {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Source::ALL
            .into_iter()
            .find(|src| src.name() == lower)
            .ok_or_else(|| SourceError::invalid(format!("unknown source '{}'", s.trim())))
    }
}

/// A normalized `(source, native_id)` pair. Construct through [`PaperId::new`] or [`parse`]
/// so the native ID is always validated and canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaperId {
    source: Source,
    native_id: String,
}

impl PaperId {
    pub fn new(source: Source, native_id: &str) -> Result<Self, SourceError> {
        let raw = native_id.trim();
        let normalized = match source {
            Source::ArXiv => normalize_arxiv(raw),
            Source::PubMed => PMID.is_match(raw).then(|| raw.to_string()),
            Source::SemanticScholar => normalize_s2(raw),
            Source::GoogleScholar => SCHOLAR_CLUSTER.is_match(raw).then(|| raw.to_string()),
        };
        normalized
            .map(|native_id| Self { source, native_id })
            .ok_or_else(|| SourceError::invalid(format!("{}:{}", source, raw)))
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn native_id(&self) -> &str {
        &self.native_id
    }
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.native_id)
    }
}

impl FromStr for PaperId {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl TryFrom<String> for PaperId {
    type Error = SourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse(&value)
    }
}

impl From<PaperId> for String {
    fn from(id: PaperId) -> Self {
        format(&id)
    }
}

/// Parse the boundary form `"<source>:<native_id>"`. The source name is case-insensitive.
pub fn parse(raw: &str) -> Result<PaperId, SourceError> {
    let raw = raw.trim();
    let (prefix, native) = raw
        .split_once(':')
        .ok_or_else(|| SourceError::invalid(format!("expected <source>:<id>, got '{}'", raw)))?;
    let source: Source = prefix.parse()?;
    PaperId::new(source, native)
}

/// Inverse of [`parse`] for valid identifiers; the source is always lowercase.
pub fn format(id: &PaperId) -> String {
    id.to_string()
}

/// Lenient resolution used at the tool boundary: accepts the canonical form, the
/// landing-page URLs of each source, and bare arXiv IDs, PMIDs and Semantic Scholar hashes.
pub fn resolve(raw: &str) -> Result<PaperId, SourceError> {
    let raw = raw.trim();
    if let Some((prefix, _)) = raw.split_once(':') {
        if prefix.parse::<Source>().is_ok() {
            return parse(raw);
        }
    }

    let without_query = raw.split(['?', '#']).next().unwrap_or(raw);
    if let Some(rest) = ["arxiv.org/abs/", "arxiv.org/pdf/"]
        .iter()
        .find_map(|marker| without_query.split_once(marker).map(|(_, rest)| rest))
    {
        let id = rest.trim_end_matches('/').trim_end_matches(".pdf");
        return PaperId::new(Source::ArXiv, id);
    }
    if let Some((_, rest)) = without_query.split_once("pubmed.ncbi.nlm.nih.gov/") {
        let pmid = rest.split('/').find(|seg| !seg.is_empty()).unwrap_or_default();
        return PaperId::new(Source::PubMed, pmid);
    }
    if without_query.contains("semanticscholar.org/paper/") {
        let last = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        return PaperId::new(Source::SemanticScholar, last);
    }
    if raw.contains("scholar.google.") {
        let cluster = ["cluster=", "cites="].iter().find_map(|key| {
            raw.split_once(key)
                .and_then(|(_, rest)| rest.split('&').next())
        });
        if let Some(cluster) = cluster {
            return PaperId::new(Source::GoogleScholar, cluster);
        }
    }

    if ARXIV_NEW.is_match(&ARXIV_VERSION.replace(raw, "")) {
        return PaperId::new(Source::ArXiv, raw);
    }
    if PMID.is_match(raw) {
        return PaperId::new(Source::PubMed, raw);
    }
    if S2_SHA.is_match(&raw.to_ascii_lowercase()) {
        return PaperId::new(Source::SemanticScholar, raw);
    }
    Err(SourceError::invalid(format!("unrecognized identifier '{}'", raw)))
}

fn normalize_arxiv(raw: &str) -> Option<String> {
    let raw = raw
        .strip_prefix("arXiv:")
        .or_else(|| raw.strip_prefix("arxiv:"))
        .unwrap_or(raw);
    // Versions of one preprint are the same logical paper.
    let base = ARXIV_VERSION.replace(raw, "");
    if ARXIV_NEW.is_match(&base) {
        return Some(base.into_owned());
    }
    let (prefix, number) = base.split_once('/')?;
    let canonical = match prefix.split_once('.') {
        Some((archive, subject)) => format!(
            "{}.{}/{}",
            archive.to_ascii_lowercase(),
            subject.to_ascii_uppercase(),
            number
        ),
        None => format!("{}/{}", prefix.to_ascii_lowercase(), number),
    };
    ARXIV_OLD.is_match(&canonical).then_some(canonical)
}

fn normalize_s2(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase();
    if S2_SHA.is_match(&lower) {
        return Some(lower);
    }
    S2_CORPUS
        .captures(raw)
        .map(|caps| format!("CorpusId:{}", &caps[1]))
}

/// Canonical form of an `external_ids` value so equal references compare equal.
pub fn normalize_external(key: &str, value: &str) -> String {
    if let Ok(source) = key.parse::<Source>() {
        if let Ok(id) = PaperId::new(source, value) {
            return id.native_id;
        }
    }
    if key.eq_ignore_ascii_case("doi") {
        return value.trim().to_ascii_lowercase();
    }
    value.trim().to_string()
}

/// Two records disagreed on the native ID for one external source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalIdConflict {
    pub key: String,
    pub kept: String,
    pub ignored: String,
}

/// Union of two records' cross-references; the first-seen value wins on conflict.
pub fn merge_external_ids(
    a: &PaperMetadata,
    b: &PaperMetadata,
) -> (BTreeMap<String, String>, Vec<ExternalIdConflict>) {
    let mut merged = a.external_ids.clone();
    let mut conflicts = Vec::new();

    for (key, value) in &b.external_ids {
        match merged.get(key) {
            Some(existing) if normalize_external(key, existing) != normalize_external(key, value) => {
                tracing::debug!(
                    "external id conflict for {} on '{}': keeping {}, ignoring {}",
                    a.id,
                    key,
                    existing,
                    value
                );
                conflicts.push(ExternalIdConflict {
                    key: key.clone(),
                    kept: existing.clone(),
                    ignored: value.clone(),
                });
            }
            Some(_) => {}
            None => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    (merged, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> PaperId {
        parse(raw).unwrap()
    }

    #[test]
    fn test_parse_and_format_round_trip() {
        for raw in [
            "arxiv:2106.14843",
            "arxiv:hep-th/9901001",
            "arxiv:math.GT/0309136",
            "pubmed:34265844",
            "semanticscholar:649def34f8be52c8b66281af98ae884c09aef38b",
            "semanticscholar:CorpusId:215416146",
            "googlescholar:5768921834532618465",
        ] {
            let parsed = id(raw);
            assert_eq!(format(&parsed), raw);
            assert_eq!(parse(&format(&parsed)).unwrap(), parsed);
        }
    }

    #[test]
    fn test_source_is_case_insensitive_on_input() {
        let parsed = id("ArXiv:2106.14843");
        assert_eq!(parsed.source(), Source::ArXiv);
        assert_eq!(format(&parsed), "arxiv:2106.14843");
        assert_eq!(id("PUBMED:123").source(), Source::PubMed);
    }

    #[test]
    fn test_arxiv_versions_are_one_paper() {
        assert_eq!(id("arxiv:2106.14843v2"), id("arxiv:2106.14843"));
        assert_eq!(id("arxiv:2106.14843v1").native_id(), "2106.14843");
        assert_eq!(id("arxiv:HEP-TH/9901001v3").native_id(), "hep-th/9901001");
    }

    #[test]
    fn test_semantic_scholar_hash_is_case_folded() {
        let upper = id("semanticscholar:649DEF34F8BE52C8B66281AF98AE884C09AEF38B");
        let lower = id("semanticscholar:649def34f8be52c8b66281af98ae884c09aef38b");
        assert_eq!(upper, lower);
        assert_eq!(id("semanticscholar:corpusid:42").native_id(), "CorpusId:42");
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        for raw in [
            "2106.14843",
            "crossref:10.1/abc",
            "arxiv:not-an-id",
            "arxiv:21.06",
            "pubmed:12ab",
            "semanticscholar:xyz",
            "googlescholar:has space",
            "",
        ] {
            assert!(
                matches!(parse(raw), Err(SourceError::InvalidIdentifier(_))),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn test_resolve_urls_and_bare_ids() {
        assert_eq!(resolve("https://arxiv.org/abs/2106.14843v1").unwrap(), id("arxiv:2106.14843"));
        assert_eq!(resolve("https://arxiv.org/pdf/2106.14843.pdf").unwrap(), id("arxiv:2106.14843"));
        assert_eq!(resolve("https://pubmed.ncbi.nlm.nih.gov/34265844/").unwrap(), id("pubmed:34265844"));
        assert_eq!(
            resolve("https://www.semanticscholar.org/paper/Attention-Is-All/649def34f8be52c8b66281af98ae884c09aef38b").unwrap(),
            id("semanticscholar:649def34f8be52c8b66281af98ae884c09aef38b")
        );
        assert_eq!(
            resolve("https://scholar.google.com/scholar?cluster=123456&hl=en").unwrap(),
            id("googlescholar:123456")
        );
        assert_eq!(resolve("2106.14843").unwrap(), id("arxiv:2106.14843"));
        assert_eq!(resolve("34265844").unwrap(), id("pubmed:34265844"));
        assert!(resolve("arxiv:bogus").is_err());
        assert!(resolve("https://example.com/paper").is_err());
    }

    #[test]
    fn test_serde_uses_boundary_string() {
        let parsed = id("arxiv:2106.14843");
        let json = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, "\"arxiv:2106.14843\"");
        let back: PaperId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parsed);
        assert!(serde_json::from_str::<PaperId>("\"bogus\"").is_err());
    }

    fn meta_with(ids: &[(&str, &str)]) -> PaperMetadata {
        let mut meta = PaperMetadata::new(id("arxiv:2106.14843"), "Paper");
        for (k, v) in ids {
            meta.external_ids.insert(k.to_string(), v.to_string());
        }
        meta
    }

    #[test]
    fn test_merge_external_ids_first_seen_wins() {
        let a = meta_with(&[("semanticscholar", "649def34f8be52c8b66281af98ae884c09aef38b")]);
        let b = meta_with(&[
            ("semanticscholar", "0000000000000000000000000000000000000000"),
            ("pubmed", "34265844"),
        ]);
        let (merged, conflicts) = merge_external_ids(&a, &b);
        assert_eq!(merged["semanticscholar"], "649def34f8be52c8b66281af98ae884c09aef38b");
        assert_eq!(merged["pubmed"], "34265844");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].key, "semanticscholar");
    }

    #[test]
    fn test_merge_external_ids_normalizes_before_comparing() {
        let a = meta_with(&[("arxiv", "2106.14843v1"), ("doi", "10.1000/ABC")]);
        let b = meta_with(&[("arxiv", "2106.14843v3"), ("doi", "10.1000/abc")]);
        let (merged, conflicts) = merge_external_ids(&a, &b);
        assert!(conflicts.is_empty());
        assert_eq!(merged["arxiv"], "2106.14843v1");
    }
}
