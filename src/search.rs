use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSnippet {
    pub title: String,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search provider is not configured: {0}")]
    NotConfigured(&'static str),
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search API error ({status}): {body}")]
    Status { status: u16, body: String },
}

/// Query in, ranked snippets out.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchSnippet>, SearchError>;
}

/// Render the top `limit` snippets the way the model is fed them.
pub fn format_snippets(snippets: &[SearchSnippet], limit: usize) -> String {
    if snippets.is_empty() {
        return "No results found.".into();
    }
    snippets
        .iter()
        .take(limit)
        .map(|s| format!("- {}: {} ({})", s.title, s.content, s.url))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone)]
pub struct TavilyClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    search_depth: String,
}

impl TavilyClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, search_depth: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            search_depth: search_depth.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'a str,
    max_results: usize,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl SearchProvider for TavilyClient {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchSnippet>, SearchError> {
        let api_key = self.api_key.as_deref().ok_or(SearchError::NotConfigured("TAVILY_API_KEY is not set"))?;
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let body = TavilyRequest {
            api_key,
            query,
            search_depth: &self.search_depth,
            max_results,
            include_answer: false,
        };
        let resp = self.client.post(url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SearchError::Status { status: status.as_u16(), body });
        }
        let parsed: TavilyResponse = resp.json().await?;
        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchSnippet { title: r.title, url: r.url, content: r.content })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(i: usize) -> SearchSnippet {
        SearchSnippet {
            title: format!("T{i}"),
            url: format!("https://example.com/{i}"),
            content: format!("C{i}"),
        }
    }

    #[test]
    fn formats_top_n() {
        let all: Vec<_> = (1..=5).map(snippet).collect();
        let text = format_snippets(&all, 3);
        assert_eq!(
            text,
            "- T1: C1 (https://example.com/1)\n- T2: C2 (https://example.com/2)\n- T3: C3 (https://example.com/3)"
        );
    }

    #[test]
    fn empty_results_message() {
        assert_eq!(format_snippets(&[], 3), "No results found.");
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let c = TavilyClient::new("http://127.0.0.1:9", None, "advanced");
        let err = c.search("anything", 3).await.unwrap_err();
        assert!(matches!(err, SearchError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn posts_query_and_maps_results() {
        use axum::{routing::post, Json, Router};
        let app = Router::new().route(
            "/search",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["query"], "Chez Pierre Lyon");
                assert_eq!(body["search_depth"], "advanced");
                Json(serde_json::json!({
                    "results": [{"title": "Chez Pierre", "url": "https://x.fr", "content": "Bistro in Lyon"}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let c = TavilyClient::new(format!("http://{addr}"), Some("k".into()), "advanced");
        let got = c.search("Chez Pierre Lyon", 3).await.unwrap();
        assert_eq!(got, vec![SearchSnippet {
            title: "Chez Pierre".into(),
            url: "https://x.fr".into(),
            content: "Bistro in Lyon".into(),
        }]);
    }
}
