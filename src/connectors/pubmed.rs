use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

use super::{check_status, download_pdf, Connector};
use crate::error::SourceError;
use crate::ids::{PaperId, Source};
use crate::model::{
    normalize_authors, parse_date, sort_newest_first, AuthorField, Direction, EdgeDirection,
    PaperMetadata, SearchQuery, SortBy,
};

const EUTILS_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const PMC_URL: &str = "https://www.ncbi.nlm.nih.gov/pmc/articles";

/// PubMed through the NCBI E-utilities (esearch, efetch, elink).
pub struct PubMedConnector {
    client: reqwest::Client,
    email: Option<String>,
    api_key: Option<String>,
    eutils_url: String,
    pmc_url: String,
}

impl PubMedConnector {
    pub fn new(client: reqwest::Client, email: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            email,
            api_key,
            eutils_url: EUTILS_URL.to_string(),
            pmc_url: PMC_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_urls(mut self, eutils_url: impl Into<String>, pmc_url: impl Into<String>) -> Self {
        self.eutils_url = eutils_url.into();
        self.pmc_url = pmc_url.into();
        self
    }

    fn eutil(&self, name: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(format!("{}/{}.fcgi", self.eutils_url, name))
            .query(&[("db", "pubmed"), ("tool", "scholar-graph")]);
        if let Some(email) = &self.email {
            req = req.query(&[("email", email)]);
        }
        if let Some(key) = &self.api_key {
            req = req.query(&[("api_key", key)]);
        }
        req
    }

    async fn efetch(&self, pmids: &[String]) -> Result<Vec<PaperMetadata>, SourceError> {
        let ids = pmids.join(",");
        let resp = self
            .eutil("efetch")
            .query(&[("id", ids.as_str()), ("retmode", "xml")])
            .send()
            .await?;
        let body = check_status(resp, "PubMed efetch").await?.text().await?;
        parse_pubmed_xml(&body)
    }

    async fn elink(&self, id: &PaperId, edge: EdgeDirection) -> Result<Vec<PaperId>, SourceError> {
        let linkname = match edge {
            EdgeDirection::Cites => "pubmed_pubmed_refs",
            EdgeDirection::CitedBy => "pubmed_pubmed_citedin",
        };
        let resp = self
            .eutil("elink")
            .query(&[
                ("dbfrom", "pubmed"),
                ("id", id.native_id()),
                ("linkname", linkname),
                ("retmode", "json"),
            ])
            .send()
            .await?;
        let resp: ELinkResponse = check_status(resp, id).await?.json().await?;
        Ok(resp
            .linksets
            .into_iter()
            .flat_map(|set| set.linksetdbs)
            .filter(|db| db.linkname == linkname)
            .flat_map(|db| db.links)
            .filter_map(|pmid| PaperId::new(Source::PubMed, &pmid).ok())
            .collect())
    }
}

#[derive(Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

#[derive(Deserialize)]
struct ELinkResponse {
    #[serde(default)]
    linksets: Vec<ELinkSet>,
}

#[derive(Deserialize)]
struct ELinkSet {
    #[serde(default)]
    linksetdbs: Vec<ELinkDb>,
}

#[derive(Deserialize)]
struct ELinkDb {
    linkname: String,
    #[serde(default)]
    links: Vec<String>,
}

#[async_trait]
impl Connector for PubMedConnector {
    fn source(&self) -> Source {
        Source::PubMed
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PaperMetadata>, SourceError> {
        let retmax = query.max_results.to_string();
        let sort = match query.sort_by {
            SortBy::Relevance => "relevance",
            SortBy::Date => "pub_date",
        };
        let resp = self
            .eutil("esearch")
            .query(&[
                ("term", query.query.as_str()),
                ("retmax", retmax.as_str()),
                ("sort", sort),
                ("retmode", "json"),
            ])
            .send()
            .await?;
        let resp: ESearchResponse = check_status(resp, "PubMed esearch").await?.json().await?;
        let idlist = resp.esearchresult.idlist;
        if idlist.is_empty() {
            return Ok(Vec::new());
        }

        let mut papers = self.efetch(&idlist).await?;
        // efetch does not promise to echo the esearch order.
        papers.sort_by_key(|p| {
            idlist
                .iter()
                .position(|pmid| pmid == p.id.native_id())
                .unwrap_or(usize::MAX)
        });
        papers.truncate(query.max_results);
        if query.sort_by == SortBy::Date {
            sort_newest_first(&mut papers);
        }
        Ok(papers)
    }

    async fn fetch_metadata(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
        self.efetch(&[id.native_id().to_string()])
            .await?
            .into_iter()
            .find(|p| p.id == *id)
            .ok_or_else(|| SourceError::not_found(id.to_string()))
    }

    /// Full text only exists for records deposited in PubMed Central.
    async fn fetch_fulltext(&self, id: &PaperId) -> Result<Option<Vec<u8>>, SourceError> {
        let meta = self.fetch_metadata(id).await?;
        let Some(pmc) = meta.external_ids.get("pmc") else {
            return Ok(None);
        };
        let url = format!("{}/{}/pdf/", self.pmc_url, pmc);
        download_pdf(&self.client, &url).await
    }

    async fn fetch_citations(
        &self,
        id: &PaperId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<PaperId>, SourceError> {
        let mut found = Vec::new();
        for edge in direction.edges() {
            found.extend(self.elink(id, *edge).await?);
        }
        found.truncate(limit);
        Ok(found)
    }
}

#[derive(Default)]
struct Record {
    pmid: String,
    title: String,
    abstract_parts: Vec<String>,
    authors: Vec<String>,
    last_name: String,
    fore_name: String,
    initials: String,
    collective_name: String,
    journal_title: String,
    iso_abbreviation: String,
    year: String,
    month: String,
    day: String,
    medline_date: String,
    doi: String,
    pmc: String,
}

impl Record {
    fn finish_author(&mut self) {
        let name = if !self.collective_name.trim().is_empty() {
            self.collective_name.trim().to_string()
        } else if !self.fore_name.trim().is_empty() {
            format!("{} {}", self.fore_name.trim(), self.last_name.trim())
        } else {
            format!("{} {}", self.last_name.trim(), self.initials.trim())
        };
        self.authors.push(name);
        self.last_name.clear();
        self.fore_name.clear();
        self.initials.clear();
        self.collective_name.clear();
    }

    fn into_metadata(self) -> Option<PaperMetadata> {
        let id = PaperId::new(Source::PubMed, &self.pmid).ok()?;
        let mut meta = PaperMetadata::new(id, self.title.trim());
        meta.authors = normalize_authors(AuthorField::Many(self.authors));
        let abstract_text = self
            .abstract_parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        meta.abstract_text = Some(abstract_text).filter(|a| !a.is_empty());
        meta.published_date = if self.year.trim().is_empty() {
            parse_date(&self.medline_date)
        } else {
            parse_date(&format!("{} {} {}", self.year.trim(), self.month.trim(), self.day.trim()))
        };
        meta.venue = [self.journal_title, self.iso_abbreviation]
            .into_iter()
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty());
        meta.url = Some(format!("https://pubmed.ncbi.nlm.nih.gov/{}/", self.pmid.trim()));
        let doi = self.doi.trim();
        if !doi.is_empty() {
            meta.doi = Some(doi.to_string());
            meta.external_ids.insert("doi".into(), doi.to_string());
        }
        let pmc = self.pmc.trim();
        if !pmc.is_empty() {
            meta.external_ids.insert("pmc".into(), pmc.to_string());
            meta.fulltext_available = true;
        }
        Some(meta)
    }
}

/// Parse an efetch `PubmedArticleSet` document.
pub(crate) fn parse_pubmed_xml(xml: &str) -> Result<Vec<PaperMetadata>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut record: Option<Record> = None;
    let mut stack: Vec<String> = Vec::new();
    let mut article_id_type = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match tag.as_str() {
                    "PubmedArticle" => record = Some(Record::default()),
                    "AbstractText" => {
                        if let Some(r) = record.as_mut() {
                            r.abstract_parts.push(String::new());
                        }
                    }
                    "ArticleId" => {
                        article_id_type = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"IdType")
                            .map(|a| String::from_utf8_lossy(&a.value).to_string())
                            .unwrap_or_default();
                    }
                    _ => {}
                }
                stack.push(tag);
            }
            Ok(Event::Text(e)) => {
                let Some(r) = record.as_mut() else {
                    buf.clear();
                    continue;
                };
                let text = e.unescape().unwrap_or_default().to_string();
                let top = stack.last().map(String::as_str).unwrap_or_default();
                let parent = stack
                    .len()
                    .checked_sub(2)
                    .and_then(|i| stack.get(i))
                    .map(String::as_str)
                    .unwrap_or_default();
                let inside = |name: &str| stack.iter().any(|t| t == name);
                let at = |path: &[&str]| {
                    stack.len() >= path.len()
                        && stack[stack.len() - path.len()..].iter().map(String::as_str).eq(path.iter().copied())
                };

                if inside("ArticleTitle") {
                    r.title.push_str(&text);
                } else if inside("AbstractText") {
                    if let Some(part) = r.abstract_parts.last_mut() {
                        part.push_str(&text);
                    }
                } else if top == "PMID" && parent == "MedlineCitation" {
                    r.pmid.push_str(text.trim());
                } else if parent == "Author" {
                    match top {
                        "LastName" => r.last_name.push_str(&text),
                        "ForeName" => r.fore_name.push_str(&text),
                        "Initials" => r.initials.push_str(&text),
                        "CollectiveName" => r.collective_name.push_str(&text),
                        _ => {}
                    }
                } else if parent == "Journal" && top == "Title" {
                    r.journal_title.push_str(&text);
                } else if parent == "Journal" && top == "ISOAbbreviation" {
                    r.iso_abbreviation.push_str(&text);
                } else if parent == "PubDate" && inside("JournalIssue") {
                    match top {
                        "Year" => r.year.push_str(&text),
                        "Month" => r.month.push_str(&text),
                        "Day" => r.day.push_str(&text),
                        "MedlineDate" => r.medline_date.push_str(&text),
                        _ => {}
                    }
                } else if at(&["PubmedArticle", "PubmedData", "ArticleIdList", "ArticleId"]) {
                    // Cited references carry their own ArticleIdList under ReferenceList.
                    match article_id_type.as_str() {
                        "doi" => r.doi.push_str(&text),
                        "pmc" => r.pmc.push_str(&text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                stack.pop();
                match tag.as_str() {
                    "Author" => {
                        if let Some(r) = record.as_mut() {
                            r.finish_author();
                        }
                    }
                    "PubmedArticle" => {
                        if let Some(meta) = record.take().and_then(Record::into_metadata) {
                            papers.push(meta);
                        }
                    }
                    _ => {}
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_XML: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE PubmedArticleSet PUBLIC "-//NLM//DTD PubMedArticle, 1st January 2024//EN" "https://dtd.nlm.nih.gov/ncbi/pubmed/out/pubmed_240101.dtd">
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">34265844</PMID>
      <Article PubModel="Print-Electronic">
        <Journal>
          <JournalIssue CitedMedium="Internet">
            <PubDate><Year>2021</Year><Month>Aug</Month><Day>26</Day></PubDate>
          </JournalIssue>
          <Title>Nature</Title>
          <ISOAbbreviation>Nature</ISOAbbreviation>
        </Journal>
        <ArticleTitle>Highly accurate protein structure prediction with <i>AlphaFold</i>.</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">Proteins are essential.</AbstractText>
          <AbstractText Label="RESULTS">We predict structures.</AbstractText>
        </Abstract>
        <AuthorList CompleteYN="Y">
          <Author ValidYN="Y"><LastName>Jumper</LastName><ForeName>John</ForeName><Initials>J</Initials></Author>
          <Author ValidYN="Y"><LastName>Evans</LastName><Initials>R</Initials></Author>
          <Author ValidYN="Y"><CollectiveName>DeepMind Team</CollectiveName></Author>
        </AuthorList>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections RefType="CommentIn"><PMID Version="1">99999999</PMID></CommentsCorrections>
      </CommentsCorrectionsList>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">34265844</ArticleId>
        <ArticleId IdType="doi">10.1038/s41586-021-03819-2</ArticleId>
        <ArticleId IdType="pmc">PMC8371605</ArticleId>
      </ArticleIdList>
      <ReferenceList>
        <Reference>
          <Citation>Anfinsen CB. Principles that govern the folding of protein chains.</Citation>
          <ArticleIdList>
            <ArticleId IdType="doi">10.1126/science.181.4096.223</ArticleId>
            <ArticleId IdType="pmc">PMC1111111</ArticleId>
          </ArticleIdList>
        </Reference>
      </ReferenceList>
    </PubmedData>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">11111111</PMID>
      <Article>
        <Journal>
          <JournalIssue><PubDate><MedlineDate>1998 Dec-1999 Jan</MedlineDate></PubDate></JournalIssue>
          <ISOAbbreviation>J Old</ISOAbbreviation>
        </Journal>
        <ArticleTitle>An older record</ArticleTitle>
      </Article>
    </MedlineCitation>
    <PubmedData>
      <ReferenceList>
        <Reference>
          <Citation>Someone A. A cited work.</Citation>
          <ArticleIdList>
            <ArticleId IdType="doi">10.1000/cited.1</ArticleId>
            <ArticleId IdType="pmc">PMC2222222</ArticleId>
          </ArticleIdList>
        </Reference>
      </ReferenceList>
    </PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

    fn connector(server: &MockServer) -> PubMedConnector {
        PubMedConnector::new(reqwest::Client::new(), Some("dev@example.org".into()), None)
            .with_base_urls(server.uri(), format!("{}/pmc", server.uri()))
    }

    #[test]
    fn test_parse_pubmed_xml() {
        let papers = parse_pubmed_xml(SAMPLE_XML).unwrap();
        assert_eq!(papers.len(), 2);

        let p = &papers[0];
        assert_eq!(p.id.to_string(), "pubmed:34265844");
        assert_eq!(p.title, "Highly accurate protein structure prediction with AlphaFold.");
        assert_eq!(p.authors, vec!["John Jumper", "Evans R", "DeepMind Team"]);
        assert_eq!(p.abstract_text.as_deref(), Some("Proteins are essential. We predict structures."));
        assert_eq!(p.published_date, chrono::NaiveDate::from_ymd_opt(2021, 8, 26));
        assert_eq!(p.venue.as_deref(), Some("Nature"));
        assert_eq!(p.doi.as_deref(), Some("10.1038/s41586-021-03819-2"));
        assert_eq!(p.external_ids.get("pmc").map(String::as_str), Some("PMC8371605"));
        assert!(p.fulltext_available);

        let old = &papers[1];
        assert_eq!(old.published_date, chrono::NaiveDate::from_ymd_opt(1998, 12, 1));
        assert_eq!(old.venue.as_deref(), Some("J Old"));
        assert!(!old.fulltext_available);
    }

    #[test]
    fn test_reference_list_ids_are_not_the_articles() {
        let papers = parse_pubmed_xml(SAMPLE_XML).unwrap();

        let p = &papers[0];
        assert_eq!(p.doi.as_deref(), Some("10.1038/s41586-021-03819-2"));
        assert_eq!(p.external_ids.get("pmc").map(String::as_str), Some("PMC8371605"));

        let old = &papers[1];
        assert!(old.doi.is_none());
        assert!(!old.external_ids.contains_key("pmc"));
        assert!(!old.fulltext_available);
    }

    #[tokio::test]
    async fn test_search_keeps_esearch_rank_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("term", "protein folding"))
            .and(query_param("email", "dev@example.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "esearchresult": {"count": "2", "idlist": ["11111111", "34265844"]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_XML))
            .mount(&server)
            .await;

        let papers = connector(&server)
            .search(&SearchQuery::new("protein folding", 5, SortBy::Relevance))
            .await
            .unwrap();
        let ids: Vec<String> = papers.iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["pubmed:11111111", "pubmed:34265844"]);
    }

    #[tokio::test]
    async fn test_cited_by_uses_elink() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/elink.fcgi"))
            .and(query_param("linkname", "pubmed_pubmed_citedin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "linksets": [{
                    "dbfrom": "pubmed",
                    "ids": ["34265844"],
                    "linksetdbs": [{"dbto": "pubmed", "linkname": "pubmed_pubmed_citedin", "links": ["1", "2", "3"]}]
                }]
            })))
            .mount(&server)
            .await;

        let id = crate::ids::parse("pubmed:34265844").unwrap();
        let cited_by = connector(&server)
            .fetch_citations(&id, Direction::CitedBy, 2)
            .await
            .unwrap();
        assert_eq!(cited_by.len(), 2);
        assert_eq!(cited_by[0].to_string(), "pubmed:1");
    }

    #[tokio::test]
    async fn test_fulltext_comes_from_pmc() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_XML))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pmc/PMC8371605/pdf/"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
            .mount(&server)
            .await;

        let connector = connector(&server);
        let with_pmc = crate::ids::parse("pubmed:34265844").unwrap();
        let bytes = connector.fetch_fulltext(&with_pmc).await.unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"%PDF-1.7"[..]));

        let without_pmc = crate::ids::parse("pubmed:11111111").unwrap();
        assert!(connector.fetch_fulltext(&without_pmc).await.unwrap().is_none());
    }
}
