//! DuckDuckGo web search tool
//!
//! Scrapes the HTML endpoint, which needs no API key.

use super::{Tool, ToolResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DUCKDUCKGO_HTML_URL: &str = "https://html.duckduckgo.com/html/";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub href: String,
    pub body: String,
}

pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(max_results: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: DUCKDUCKGO_HTML_URL.to_string(),
            max_results,
        }
    }

    /// Search against another endpoint serving the same HTML
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let url = format!("{}?q={}", self.endpoint, urlencoding::encode(query));
        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("DuckDuckGo request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("DuckDuckGo returned status {}", response.status());
        }

        let html = response.text().await?;
        Ok(parse_results(&html, max_results))
    }
}

/// Parse the DuckDuckGo HTML results page
fn parse_results(html: &str, max_results: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);

    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse(".result"),
        Selector::parse(".result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    document
        .select(&result_sel)
        .filter_map(|element| {
            let link = element.select(&link_sel).next()?;
            let title = link.text().collect::<String>().trim().to_string();
            let href = normalize_url(link.value().attr("href").unwrap_or_default());
            let body = element
                .select(&snippet_sel)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .unwrap_or_default();

            (!title.is_empty() && !href.is_empty()).then_some(SearchHit { title, href, body })
        })
        .take(max_results)
        .collect()
}

/// Unwrap DuckDuckGo redirect links (`//duckduckgo.com/l/?uddg=...`)
fn normalize_url(raw_url: &str) -> String {
    let absolute = if raw_url.starts_with("//") {
        format!("https:{}", raw_url)
    } else {
        raw_url.to_string()
    };

    let Ok(parsed) = url::Url::parse(&absolute) else {
        return raw_url.to_string();
    };

    if parsed.domain() == Some("duckduckgo.com") && parsed.path().starts_with("/l/") {
        if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
            return target.into_owned();
        }
    }

    absolute
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "duckduckgo_search"
    }

    fn description(&self) -> &str {
        "Searches DuckDuckGo for a query and returns the top results as JSON (title, href, body)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The query to search for"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            query: String,
            max_results: Option<usize>,
        }

        let params: Params = serde_json::from_value(params)?;
        if params.query.trim().is_empty() {
            return Ok(ToolResult::error("Query must not be empty"));
        }
        let max_results = params.max_results.unwrap_or(self.max_results).max(1);

        tracing::debug!(query = %params.query, "Searching DuckDuckGo");
        match self.search(&params.query, max_results).await {
            Ok(hits) => Ok(ToolResult::success(serde_json::to_string_pretty(&hits)?)),
            Err(e) => Ok(ToolResult::error(format!("Search failed: {:#}", e))),
        }
    }
}
