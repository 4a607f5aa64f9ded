use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::batch;
use crate::domain::{QueryDetails, QueryFile, Record};
use crate::error::HarvestError;
use crate::naming;
use crate::store;

pub const DEFAULT_API_URL: &str = "https://export.arxiv.org/api/query";
pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const DEFAULT_JSON_DIR: &str = "search_results_json";

const BROAD_CATEGORIES: [&str; 4] = ["cs", "math", "physics", "stat"];
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub api_url: String,
    pub page_size: usize,
    pub delay: Duration,
    pub retries: u32,
    pub timeout: Duration,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            page_size: 100,
            delay: Duration::from_secs(3),
            retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub keyword: String,
    pub category: String,
    pub max_results: usize,
}

impl SearchRequest {
    pub fn query(&self) -> String {
        format!("({}) AND cat:{}", self.keyword, self.category)
    }

    pub fn is_broad_category(&self) -> bool {
        BROAD_CATEGORIES
            .iter()
            .any(|broad| self.category.eq_ignore_ascii_case(broad))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub search_query: String,
    pub start: usize,
    pub max_results: usize,
}

pub trait FeedClient: Send + Sync {
    fn fetch_feed(&self, request: &PageRequest) -> Result<String, HarvestError>;
}

pub struct ArxivClient {
    client: Client,
    api_url: String,
}

impl ArxivClient {
    pub fn new(settings: &SearchSettings) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("paper-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::SearchHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| HarvestError::SearchHttp(err.to_string()))?;
        Ok(Self {
            client,
            api_url: settings.api_url.clone(),
        })
    }
}

impl FeedClient for ArxivClient {
    fn fetch_feed(&self, request: &PageRequest) -> Result<String, HarvestError> {
        let start = request.start.to_string();
        let max_results = request.max_results.to_string();
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("search_query", request.search_query.as_str()),
                ("start", start.as_str()),
                ("max_results", max_results.as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .map_err(|err| HarvestError::SearchHttp(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::SearchHttp(format!(
                "{} returned {}",
                self.api_url,
                status.as_u16()
            )));
        }
        response
            .text()
            .map_err(|err| HarvestError::SearchHttp(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(rename = "entry", default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    published: String,
    #[serde(default)]
    updated: String,
    #[serde(rename = "author", default)]
    authors: Vec<Author>,
    #[serde(rename = "link", default)]
    links: Vec<Link>,
    #[serde(rename = "category", default)]
    categories: Vec<Category>,
    #[serde(rename = "arxiv:primary_category", alias = "primary_category", default)]
    primary_category: Option<Category>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "@href")]
    href: String,
    #[serde(rename = "@title", default)]
    title: Option<String>,
    #[serde(rename = "@type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Category {
    #[serde(rename = "@term")]
    term: String,
}

pub fn parse_feed(xml: &str) -> Result<Vec<Record>, HarvestError> {
    let feed: Feed =
        quick_xml::de::from_str(xml).map_err(|err| HarvestError::SearchParse(err.to_string()))?;
    if let Some(entry) = feed.entries.iter().find(|entry| entry.id.contains("/api/errors")) {
        return Err(HarvestError::SearchParse(collapse_whitespace(&entry.summary)));
    }
    Ok(feed.entries.into_iter().map(entry_record).collect())
}

fn entry_record(entry: Entry) -> Record {
    let entry_id = identity_from_url(&entry.id);
    let pdf_url = entry
        .links
        .iter()
        .find(|link| {
            link.title.as_deref() == Some("pdf") || link.kind.as_deref() == Some("application/pdf")
        })
        .map(|link| link.href.clone())
        .unwrap_or_else(|| entry.id.replace("/abs/", "/pdf/"));
    let categories: Vec<String> = entry.categories.into_iter().map(|cat| cat.term).collect();
    let primary_category = entry
        .primary_category
        .map(|cat| cat.term)
        .or_else(|| categories.first().cloned())
        .unwrap_or_default();

    let mut record = Record::new(entry_id)
        .with_title(collapse_whitespace(&entry.title))
        .with_pdf_url(pdf_url);
    let authors: Vec<Value> = entry
        .authors
        .into_iter()
        .map(|author| Value::from(author.name.trim()))
        .collect();
    let fields = [
        ("authors", Value::from(authors)),
        ("summary", Value::from(collapse_whitespace(&entry.summary))),
        ("published_date", Value::from(format_date(&entry.published))),
        ("updated_date", Value::from(format_date(&entry.updated))),
        ("primary_category", Value::from(primary_category)),
        ("categories", Value::from(categories)),
    ];
    for (key, value) in fields {
        record.extra.insert(key.to_string(), value);
    }
    record
}

pub fn identity_from_url(url: &str) -> String {
    match url.rfind("/abs/") {
        Some(pos) => url[pos + "/abs/".len()..].to_string(),
        None => url.rsplit('/').next().unwrap_or(url).to_string(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn format_date(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|date| date.with_timezone(&Utc).format(DATE_FORMAT).to_string())
        .unwrap_or_else(|_| raw.trim().to_string())
}

pub fn search<C: FeedClient + ?Sized>(
    client: &C,
    request: &SearchRequest,
    settings: &SearchSettings,
) -> Result<Vec<Record>, HarvestError> {
    let search_query = request.query();
    let page_size = settings.page_size.max(1);
    let mut papers = Vec::new();
    while papers.len() < request.max_results {
        if !papers.is_empty() && !settings.delay.is_zero() {
            thread::sleep(settings.delay);
        }
        let page = PageRequest {
            search_query: search_query.clone(),
            start: papers.len(),
            max_results: page_size.min(request.max_results - papers.len()),
        };
        let xml = fetch_with_retries(client, &page, settings)?;
        let records = parse_feed(&xml)?;
        debug!(start = page.start, received = records.len(), "search page");
        let exhausted = records.len() < page.max_results;
        papers.extend(records.into_iter().take(request.max_results - papers.len()));
        if exhausted {
            break;
        }
    }
    Ok(papers)
}

fn fetch_with_retries<C: FeedClient + ?Sized>(
    client: &C,
    page: &PageRequest,
    settings: &SearchSettings,
) -> Result<String, HarvestError> {
    let mut attempt = 0;
    loop {
        match client.fetch_feed(page) {
            Ok(xml) => return Ok(xml),
            Err(err) if attempt < settings.retries => {
                attempt += 1;
                warn!(start = page.start, attempt, error = %err, "search request failed, retrying");
                thread::sleep(settings.delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub query: String,
    pub output: Utf8PathBuf,
    pub results_count: usize,
    pub error: Option<String>,
}

pub fn output_file_name(request: &SearchRequest) -> String {
    let stem: Vec<String> = [
        naming::sanitize_for_dirname(&request.keyword, 35),
        naming::sanitize_for_dirname(&request.category, 25),
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect();
    let stem = if stem.is_empty() {
        "search".to_string()
    } else {
        stem.join("_")
    };
    format!("{stem}_{}.json", batch::timestamp())
}

pub fn run_search<C: FeedClient + ?Sized>(
    client: &C,
    request: &SearchRequest,
    settings: &SearchSettings,
    json_dir: &Utf8Path,
    file_name: Option<&str>,
) -> Result<SearchReport, HarvestError> {
    if request.is_broad_category() {
        warn!(
            category = %request.category,
            "top-level category; the API expects a subcategory such as cs.AI and may return nothing"
        );
    }
    let query = request.query();
    info!(query = %query, max_results = request.max_results, "searching arXiv");
    let started = Instant::now();
    let (papers, failure) = match search(client, request, settings) {
        Ok(papers) => (papers, None),
        Err(err) => {
            error!(query = %query, error = %err, "search failed");
            (Vec::new(), Some(err.to_string()))
        }
    };
    let elapsed = started.elapsed().as_secs_f64();

    let mut query_details = QueryDetails {
        keyword: Some(request.keyword.clone()),
        category: Some(request.category.clone()),
        ..QueryDetails::default()
    };
    query_details.extra.insert(
        "max_results_requested".to_string(),
        Value::from(request.max_results),
    );
    query_details.extra.insert(
        "timestamp".to_string(),
        Value::from(Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string()),
    );
    query_details.extra.insert(
        "search_duration_seconds".to_string(),
        Value::from((elapsed * 100.0).round() / 100.0),
    );

    let file_name = file_name
        .map(str::to_string)
        .unwrap_or_else(|| output_file_name(request));
    let output = json_dir.join(file_name);
    let results_count = papers.len();
    let file = QueryFile {
        query_details,
        results_count: Some(results_count),
        papers,
    };
    store::write_json_atomic(&output, &file)?;
    if results_count == 0 && failure.is_none() {
        warn!(query = %query, "no papers matched; check that the category is specific enough");
    }
    info!(path = %output, results = results_count, "search results written");
    Ok(SearchReport {
        query,
        output,
        results_count,
        error: failure,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    struct MockFeed {
        pages: Mutex<Vec<Result<String, HarvestError>>>,
        requests: Mutex<Vec<PageRequest>>,
    }

    impl MockFeed {
        fn new(pages: Vec<Result<String, HarvestError>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl FeedClient for MockFeed {
        fn fetch_feed(&self, request: &PageRequest) -> Result<String, HarvestError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(feed(&[]));
            }
            pages.remove(0)
        }
    }

    fn entry(id: &str) -> String {
        format!(
            r#"<entry>
    <id>http://arxiv.org/abs/{id}</id>
    <updated>2024-05-02T10:00:00Z</updated>
    <published>2024-05-01T09:30:00Z</published>
    <title>Paper
      {id}</title>
    <summary>  An abstract
      across lines. </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/{id}" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/{id}" rel="related" type="application/pdf"/>
    <arxiv:primary_category xmlns:arxiv="http://arxiv.org/schemas/atom" term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>"#
        )
    }

    fn feed(ids: &[&str]) -> String {
        let entries: String = ids.iter().map(|id| entry(id)).collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>arXiv Query</title>
  <id>http://arxiv.org/api/query</id>
  {entries}
</feed>"#
        )
    }

    fn quick() -> SearchSettings {
        SearchSettings {
            page_size: 2,
            delay: Duration::ZERO,
            retries: 1,
            ..SearchSettings::default()
        }
    }

    fn request(max_results: usize) -> SearchRequest {
        SearchRequest {
            keyword: "graph neural networks".to_string(),
            category: "cs.AI".to_string(),
            max_results,
        }
    }

    #[test]
    fn query_joins_keyword_and_category() {
        assert_eq!(request(1).query(), "(graph neural networks) AND cat:cs.AI");
        let broad = SearchRequest {
            category: "CS".to_string(),
            ..request(1)
        };
        assert!(broad.is_broad_category());
        assert!(!request(1).is_broad_category());
    }

    #[test]
    fn entry_fields_are_mapped() {
        let records = parse_feed(&feed(&["2405.00001v1", "math/0211159v2"])).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.identity(), Some("2405.00001v1"));
        assert_eq!(first.title.as_deref(), Some("Paper 2405.00001v1"));
        assert_eq!(first.primary_url(), Some("http://arxiv.org/pdf/2405.00001v1"));
        assert_eq!(first.extra_str("summary"), Some("An abstract across lines."));
        assert_eq!(first.extra_str("published_date"), Some("2024-05-01 09:30:00 UTC"));
        assert_eq!(first.extra_str("primary_category"), Some("cs.AI"));
        assert_eq!(first.extra["authors"], serde_json::json!(["Ada Lovelace", "Alan Turing"]));
        assert_eq!(first.extra["categories"], serde_json::json!(["cs.AI", "cs.LG"]));

        assert_eq!(records[1].identity(), Some("math/0211159v2"));
    }

    #[test]
    fn api_error_entry_is_a_parse_error() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/api/errors#incorrect_id_format_for_x</id>
    <title>Error</title>
    <summary>incorrect id format for x</summary>
  </entry>
</feed>"#;
        assert_matches!(parse_feed(xml), Err(HarvestError::SearchParse(message)) if message == "incorrect id format for x");
    }

    #[test]
    fn paging_stops_at_max_results() {
        let client = MockFeed::new(vec![Ok(feed(&["a1", "a2"])), Ok(feed(&["a3"]))]);
        let papers = search(&client, &request(3), &quick()).unwrap();

        assert_eq!(papers.len(), 3);
        let requests = client.requests.lock().unwrap();
        assert_eq!(
            requests
                .iter()
                .map(|page| (page.start, page.max_results))
                .collect::<Vec<_>>(),
            [(0, 2), (2, 1)]
        );
        assert!(requests.iter().all(|page| page.search_query == "(graph neural networks) AND cat:cs.AI"));
    }

    #[test]
    fn short_page_ends_the_search() {
        let client = MockFeed::new(vec![Ok(feed(&["only"]))]);
        let papers = search(&client, &request(10), &quick()).unwrap();
        assert_eq!(papers.len(), 1);
        assert_eq!(client.requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn transient_failure_is_retried() {
        let client = MockFeed::new(vec![
            Err(HarvestError::SearchHttp("503".to_string())),
            Ok(feed(&["r1"])),
        ]);
        let papers = search(&client, &request(2), &quick()).unwrap();
        assert_eq!(papers.len(), 1);
        assert_eq!(client.requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn results_are_written_in_query_file_format() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let client = MockFeed::new(vec![Ok(feed(&["w1", "w2"]))]);

        let report = run_search(&client, &request(2), &quick(), &dir, None).unwrap();

        let name = report.output.file_name().unwrap();
        assert!(name.starts_with("graph_neural_networks_cs.AI_"));
        assert!(name.ends_with(".json"));
        assert_eq!(report.results_count, 2);
        assert_eq!(report.error, None);

        let written = QueryFile::load(&report.output).unwrap();
        assert_eq!(written.query_details.keyword(), Some("graph neural networks"));
        assert_eq!(written.query_details.category(), Some("cs.AI"));
        assert_eq!(written.query_details.extra["max_results_requested"], 2);
        assert_eq!(written.results_count, Some(2));
        assert_eq!(written.papers[1].identity(), Some("w2"));
    }

    #[test]
    fn failed_search_still_writes_an_empty_result() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let client = MockFeed::new(vec![
            Err(HarvestError::SearchHttp("down".to_string())),
            Err(HarvestError::SearchHttp("down".to_string())),
        ]);

        let report = run_search(&client, &request(5), &quick(), &dir, Some("out.json")).unwrap();

        assert_eq!(report.output, dir.join("out.json"));
        assert_eq!(report.results_count, 0);
        assert!(report.error.is_some());
        let written = QueryFile::load(&report.output).unwrap();
        assert!(written.papers.is_empty());
        assert_eq!(written.results_count, Some(0));
    }
}
