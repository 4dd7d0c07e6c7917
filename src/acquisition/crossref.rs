//! Keyword search against a Crossref-style `/works` endpoint.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use time::{Date, macros::format_description};

use super::{AcquisitionError, normalize_base_url, rejection};
use crate::config::SearchConfig;
use crate::metadata::ArticleMetadata;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const SELECT_FIELDS: &str = "DOI,title,URL,container-title,created";

/// Raw search hit as returned by the bibliographic service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Article identifier (DOI).
    #[serde(rename = "DOI", alias = "id", default)]
    pub id: Option<String>,
    /// Title variants; the first one is used.
    #[serde(default)]
    pub title: Vec<String>,
    /// Landing page locator.
    #[serde(rename = "URL", alias = "url", default)]
    pub url: Option<String>,
    /// Venue name variants; the first one is used.
    #[serde(rename = "container-title", default)]
    pub container_title: Vec<String>,
    /// Record creation stamp.
    #[serde(default)]
    pub created: Option<CreatedStamp>,
}

/// Creation timestamp wrapper (`created.date-time`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatedStamp {
    /// RFC 3339 creation instant.
    #[serde(rename = "date-time", default)]
    pub date_time: Option<String>,
}

impl CandidateRecord {
    /// Best-effort identifier for logging, even when the record is malformed.
    pub fn display_id(&self) -> &str {
        self.id.as_deref().unwrap_or("<missing id>")
    }

    /// Validate required fields and build an [`ArticleMetadata`].
    pub fn into_article(self) -> Result<ArticleMetadata, AcquisitionError> {
        let id = required(self.id, "DOI")?;
        let title = required(self.title.into_iter().next(), "title")?;
        let url = required(self.url, "URL")?;
        let created = required(self.created.and_then(|c| c.date_time), "created.date-time")?;
        let publication_date = normalize_date(&created)?;
        let container_title = self
            .container_title
            .into_iter()
            .next()
            .map(|value| value.trim().to_string())
            .unwrap_or_default();

        Ok(ArticleMetadata {
            id,
            title,
            url,
            container_title,
            publication_date,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, AcquisitionError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AcquisitionError::MalformedRecord(format!("missing {field}")))
}

fn normalize_date(stamp: &str) -> Result<String, AcquisitionError> {
    let malformed = || AcquisitionError::MalformedRecord(format!("unparseable date '{stamp}'"));
    let prefix = stamp.get(..10).ok_or_else(malformed)?;
    let date = Date::parse(prefix, format_description!("[year]-[month]-[day]"))
        .map_err(|_| malformed())?;
    date.format(format_description!("[year]-[month]-[day]"))
        .map_err(|_| malformed())
}

#[derive(Deserialize)]
struct WorksEnvelope {
    message: WorksMessage,
}

#[derive(Deserialize)]
struct WorksMessage {
    #[serde(default)]
    items: Vec<CandidateRecord>,
}

/// HTTP client for the `/works` search endpoint.
pub struct SearchClient {
    client: Client,
    base_url: String,
    filter: String,
    sample: bool,
}

impl SearchClient {
    /// Build a client from search settings.
    pub fn new(config: &SearchConfig) -> Result<Self, AcquisitionError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(AcquisitionError::Http)?;
        let base_url = normalize_base_url(&config.base_url)?;
        tracing::debug!(url = %base_url, sample = config.sample, "Initialized search client");
        Ok(Self {
            client,
            base_url,
            filter: config.filter.clone(),
            sample: config.sample,
        })
    }

    /// Query the service; no retries are attempted on failure.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CandidateRecord>, AcquisitionError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let limit_value = limit.to_string();
        let mut params: Vec<(&str, &str)> = vec![("query", query), ("select", SELECT_FIELDS)];
        if !self.filter.trim().is_empty() {
            params.push(("filter", self.filter.as_str()));
        }
        if self.sample {
            params.push(("sample", limit_value.as_str()));
        } else {
            params.extend([
                ("rows", limit_value.as_str()),
                ("sort", "created"),
                ("order", "asc"),
            ]);
        }

        let response = self
            .client
            .get(format!("{}/works", self.base_url))
            .query(&params)
            .send()
            .await
            .map_err(AcquisitionError::from_reqwest)?;

        if !response.status().is_success() {
            let error = rejection(response).await;
            tracing::error!(query, error = %error, "Search request rejected");
            return Err(error);
        }

        let envelope: WorksEnvelope = response.json().await.map_err(AcquisitionError::Http)?;
        let mut items = envelope.message.items;
        items.truncate(limit);
        tracing::info!(query, limit, returned = items.len(), "Search completed");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;

    fn config(base_url: String, sample: bool) -> SearchConfig {
        SearchConfig {
            base_url,
            filter: "member:311".into(),
            sample,
            user_agent: "paperhoard-test".into(),
        }
    }

    fn item(doi: &str) -> serde_json::Value {
        json!({
            "DOI": doi,
            "title": ["Graphene membranes"],
            "URL": format!("https://doi.org/{doi}"),
            "container-title": ["Small"],
            "created": { "date-time": "2025-03-04T10:11:12Z" }
        })
    }

    #[test]
    fn candidate_normalizes_to_article() {
        let record: CandidateRecord = serde_json::from_value(item("10.1002/smll.1")).unwrap();
        let article = record.into_article().unwrap();
        assert_eq!(article.id, "10.1002/smll.1");
        assert_eq!(article.title, "Graphene membranes");
        assert_eq!(article.container_title, "Small");
        assert_eq!(article.publication_date, "2025-03-04");
    }

    #[test]
    fn missing_container_becomes_empty() {
        let mut value = item("x");
        value.as_object_mut().unwrap().remove("container-title");
        let record: CandidateRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.into_article().unwrap().container_title, "");
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        for field in ["DOI", "title", "URL", "created"] {
            let mut value = item("x");
            value.as_object_mut().unwrap().remove(field);
            let record: CandidateRecord = serde_json::from_value(value).unwrap();
            assert!(
                matches!(record.into_article(), Err(AcquisitionError::MalformedRecord(_))),
                "{field} should be required"
            );
        }

        let mut bad_date = item("x");
        bad_date["created"]["date-time"] = json!("2025-13");
        let record: CandidateRecord = serde_json::from_value(bad_date).unwrap();
        assert!(record.into_article().is_err());
    }

    #[tokio::test]
    async fn deterministic_search_sends_sorted_rows() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/works")
                    .query_param("query", "graphene")
                    .query_param("rows", "2")
                    .query_param("sort", "created")
                    .query_param("filter", "member:311")
                    .header("user-agent", "paperhoard-test");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "message": { "items": [item("a"), item("b"), item("c")] }
                }));
            })
            .await;

        let client = SearchClient::new(&config(server.base_url(), false)).unwrap();
        let results = client.search("graphene", 2).await.unwrap();
        mock.assert_async().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn sampling_is_opt_in() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/works").query_param("sample", "3");
                then.status(200)
                    .json_body(json!({ "message": { "items": [] } }));
            })
            .await;

        let client = SearchClient::new(&config(server.base_url(), true)).unwrap();
        assert!(client.search("alloy", 3).await.unwrap().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_surface_status_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/works");
                then.status(400).body("bad filter");
            })
            .await;

        let client = SearchClient::new(&config(server.base_url(), false)).unwrap();
        let error = client.search("alloy", 5).await.unwrap_err();
        assert_eq!(error.status(), Some(reqwest::StatusCode::BAD_REQUEST));
        assert!(!error.is_transient());
        mock.assert_hits_async(1).await;
    }
}
