use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::sections::parse_extract;
use super::{EncyclopediaLookup, EncyclopediaPage};
use crate::error::FetchError;

pub const DEFAULT_WIKI_API: &str = "https://en.wikipedia.org/w/api.php";

/// MediaWiki action API client: one `action=query` call per title, returning
/// the plain-text extract, canonical URL and categories.
#[derive(Debug, Clone)]
pub struct WikipediaClient {
    http: Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    query: Option<QueryBody>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    pages: Vec<PageBody>,
}

#[derive(Debug, Deserialize)]
struct PageBody {
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    extract: String,
    #[serde(default)]
    fullurl: String,
    #[serde(default)]
    categories: Vec<CategoryBody>,
}

#[derive(Debug, Deserialize)]
struct CategoryBody {
    title: String,
}

impl WikipediaClient {
    pub fn new(api_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
        })
    }

    pub fn query_url(&self, title: &str) -> String {
        format!(
            "{}?action=query&format=json&formatversion=2&redirects=1\
             &prop=extracts%7Cinfo%7Ccategories&explaintext=1&exsectionformat=wiki\
             &inprop=url&cllimit=max&titles={}",
            self.api_url,
            urlencoding::encode(title)
        )
    }
}

/// Pick the single page out of a `formatversion=2` query response.
pub fn page_from_response(url: &str, body: Value) -> Result<Option<EncyclopediaPage>, FetchError> {
    let decode = |message: String| FetchError::Decode {
        url: url.to_string(),
        message,
    };
    let resp: QueryResponse = serde_json::from_value(body).map_err(|e| decode(e.to_string()))?;
    let Some(page) = resp.query.and_then(|q| q.pages.into_iter().next()) else {
        return Err(decode("response has no query.pages entry".into()));
    };
    if page.missing || page.invalid {
        return Ok(None);
    }

    let parsed = parse_extract(&page.extract).map_err(|e| decode(e.to_string()))?;
    Ok(Some(EncyclopediaPage {
        title: page.title,
        url: page.fullurl,
        summary: parsed.summary,
        sections: parsed.sections,
        categories: page.categories.into_iter().map(|c| c.title).collect(),
    }))
}

#[async_trait]
impl EncyclopediaLookup for WikipediaClient {
    async fn lookup(&self, title: &str) -> Result<Option<EncyclopediaPage>, FetchError> {
        let url = self.query_url(title);
        debug!(title, "encyclopedia query");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::transport(&url, e))?;
        let status = resp.status();
        if status != StatusCode::OK {
            warn!(title, status = status.as_u16(), "encyclopedia rejected query");
            return Err(FetchError::RemoteRejected {
                url,
                status: status.as_u16(),
            });
        }
        let body = resp.json::<Value>().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Decode {
                    url: url.clone(),
                    message: e.to_string(),
                }
            } else {
                FetchError::transport(&url, e)
            }
        })?;
        page_from_response(&url, body)
    }
}
