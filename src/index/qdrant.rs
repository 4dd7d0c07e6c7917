//! Qdrant-backed [`VectorStore`]: one collection plays the role of the chunk table.
//!
//! The configured name is an alias. Each generation of the table is a physical collection
//! named `{alias}-{uuid}`; an overwrite fills a fresh generation and then repoints the alias in
//! a single atomic alias update, so a failed rebuild leaves the previous generation serving.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::payload::{build_payload, current_timestamp_rfc3339, parse_payload};
use super::{IndexError, IndexHit, IndexedChunk, VectorStore};

const PAYLOAD_INDEXES: [&str; 2] = ["metadata.source_id", "fingerprint"];
/// Points per `PUT points` request; keeps bodies well under Qdrant's request size limit.
const UPSERT_BATCH_POINTS: usize = 256;

/// HTTP client for a single aliased Qdrant collection.
pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
struct QueryPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct AliasesResponse {
    result: AliasList,
}

#[derive(Deserialize)]
struct AliasList {
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

#[derive(Deserialize)]
struct AliasEntry {
    alias_name: String,
    collection_name: String,
}

impl QdrantStore {
    /// Construct a store for the alias `collection` at `url`.
    pub fn new(url: &str, api_key: Option<String>, collection: &str) -> Result<Self, IndexError> {
        let client = Client::builder().user_agent("paperhoard/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(IndexError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            collection,
            has_api_key = api_key.as_deref().is_some_and(|key| !key.is_empty()),
            "Initialized Qdrant HTTP client"
        );
        Ok(Self {
            client,
            base_url,
            api_key,
            collection: collection.to_string(),
        })
    }

    /// Alias under which the table is read and written.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn next_generation(&self) -> String {
        format!("{}-{}", self.collection, Uuid::new_v4().simple())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, IndexError> {
        let response = self
            .request(Method::GET, &format!("collections/{name}"))
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(failure(response, "Collection existence check failed").await),
        }
    }

    async fn create_collection(&self, name: &str, dimension: usize) -> Result<(), IndexError> {
        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine"
            }
        });
        let response = self
            .request(Method::PUT, &format!("collections/{name}"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(failure(response, "Failed to create collection").await);
        }
        tracing::info!(collection = name, dimension, "Collection created");
        self.ensure_payload_indexes(name).await
    }

    async fn delete_collection(&self, name: &str) -> Result<(), IndexError> {
        let response = self
            .request(Method::DELETE, &format!("collections/{name}"))
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            tracing::info!(collection = name, "Collection dropped");
            Ok(())
        } else {
            Err(failure(response, "Failed to drop collection").await)
        }
    }

    async fn ensure_payload_indexes(&self, name: &str) -> Result<(), IndexError> {
        for field in PAYLOAD_INDEXES {
            let body = json!({
                "field_name": field,
                "field_schema": "keyword",
            });
            let response = self
                .request(Method::PUT, &format!("collections/{name}/index"))
                .query(&[("wait", true)])
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() || response.status() == StatusCode::CONFLICT {
                tracing::debug!(collection = name, field, "Payload index ensured");
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = IndexError::UnexpectedStatus { status, body };
                tracing::warn!(collection = name, field, error = %error, "Failed to ensure payload index");
            }
        }
        Ok(())
    }

    /// Physical collection the alias currently points at.
    async fn alias_target(&self) -> Result<Option<String>, IndexError> {
        let response = self.request(Method::GET, "aliases").send().await?;
        if !response.status().is_success() {
            return Err(failure(response, "Failed to list aliases").await);
        }
        let parsed: AliasesResponse = response.json().await?;
        Ok(parsed
            .result
            .aliases
            .into_iter()
            .find(|entry| entry.alias_name == self.collection)
            .map(|entry| entry.collection_name))
    }

    async fn point_alias_at(&self, target: &str, replaces: bool) -> Result<(), IndexError> {
        let mut actions = Vec::with_capacity(2);
        if replaces {
            actions.push(json!({ "delete_alias": { "alias_name": self.collection } }));
        }
        actions.push(json!({
            "create_alias": { "collection_name": target, "alias_name": self.collection }
        }));
        let response = self
            .request(Method::POST, "collections/aliases")
            .json(&json!({ "actions": actions }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(failure(response, "Failed to switch collection alias").await);
        }
        tracing::info!(alias = %self.collection, collection = target, "Alias switched");
        Ok(())
    }

    async fn upsert_into(&self, name: &str, rows: &[IndexedChunk]) -> Result<(), IndexError> {
        let now = current_timestamp_rfc3339();
        for batch in rows.chunks(UPSERT_BATCH_POINTS) {
            let points: Vec<Value> = batch
                .iter()
                .map(|row| {
                    json!({
                        "id": row.id.to_string(),
                        "vector": row.vector,
                        "payload": build_payload(&row.chunk, &row.fingerprint, &now),
                    })
                })
                .collect();
            let response = self
                .request(Method::PUT, &format!("collections/{name}/points"))
                .query(&[("wait", true)])
                .json(&json!({ "points": points }))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(failure(response, "Failed to upsert points").await);
            }
            tracing::debug!(collection = name, points = batch.len(), "Points upserted");
        }
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_schema(&self, dimension: usize) -> Result<(), IndexError> {
        if self.collection_exists(&self.collection).await? {
            return Ok(());
        }
        let generation = self.next_generation();
        self.create_collection(&generation, dimension).await?;
        self.point_alias_at(&generation, false).await
    }

    async fn replace(&self, dimension: usize, rows: Vec<IndexedChunk>) -> Result<(), IndexError> {
        let generation = self.next_generation();
        self.create_collection(&generation, dimension).await?;
        if let Err(error) = self.upsert_into(&generation, &rows).await {
            if let Err(cleanup) = self.delete_collection(&generation).await {
                tracing::warn!(collection = %generation, error = %cleanup, "Failed to drop abandoned generation");
            }
            return Err(error);
        }

        let previous = self.alias_target().await?;
        if previous.is_none() && self.collection_exists(&self.collection).await? {
            // A plain collection holds the name; it has to go before the alias can take it.
            self.delete_collection(&self.collection).await?;
        }
        self.point_alias_at(&generation, previous.is_some()).await?;
        if let Some(previous) = previous
            && let Err(error) = self.delete_collection(&previous).await
        {
            tracing::warn!(collection = %previous, error = %error, "Failed to drop previous generation");
        }
        tracing::info!(alias = %self.collection, collection = %generation, points = rows.len(), "Index replaced");
        Ok(())
    }

    async fn upsert(&self, rows: Vec<IndexedChunk>) -> Result<(), IndexError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.upsert_into(&self.collection, &rows).await
    }

    async fn query(&self, vector: Vec<f32>, k: usize) -> Result<Vec<IndexHit>, IndexError> {
        let body = json!({
            "query": vector,
            "limit": k,
            "with_payload": true,
        });
        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/query", self.collection),
            )
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(failure(response, "Qdrant search failed").await);
        }

        let parsed: QueryResponse = response.json().await?;
        let points = match parsed.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };
        points
            .into_iter()
            .map(|point| {
                let id = stringify_point_id(point.id);
                let payload = point
                    .payload
                    .ok_or_else(|| IndexError::MalformedRow(format!("point {id} has no payload")))?;
                let (text, origin) = parse_payload(payload)
                    .map_err(|e| IndexError::MalformedRow(format!("point {id}: {e}")))?;
                Ok(IndexHit {
                    id,
                    score: point.score,
                    text,
                    origin,
                })
            })
            .collect()
    }
}

async fn failure(response: reqwest::Response, context: &'static str) -> IndexError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let error = IndexError::UnexpectedStatus { status, body };
    tracing::error!(error = %error, "{context}");
    error
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{Chunk, ChunkOrigin};
    use crate::index::chunk_key;
    use httpmock::{
        Method::{DELETE, GET, POST, PUT},
        MockServer,
    };
    use regex::Regex;

    fn store(server: &MockServer) -> QdrantStore {
        QdrantStore::new(&server.base_url(), Some("key".into()), "articles").unwrap()
    }

    fn row(text: &str) -> IndexedChunk {
        let key = chunk_key("10.1/a", text);
        IndexedChunk {
            id: key.point_id,
            fingerprint: key.fingerprint,
            vector: vec![0.1, 0.2],
            chunk: Chunk {
                text: text.into(),
                origin: ChunkOrigin {
                    source_id: "10.1/a".into(),
                    page_numbers: Some(vec![1]),
                    heading: Some("Intro".into()),
                },
            },
        }
    }

    fn generation_path(suffix: &str) -> Regex {
        Regex::new(&format!("^/collections/articles-[0-9a-f]{{32}}{suffix}$")).unwrap()
    }

    async fn mock_alias_target(server: &MockServer, target: &str) {
        let aliases = if target.is_empty() {
            json!([])
        } else {
            json!([{ "alias_name": "articles", "collection_name": target }])
        };
        server
            .mock_async(|when, then| {
                when.method(GET).path("/aliases");
                then.status(200)
                    .json_body(json!({ "result": { "aliases": aliases } }));
            })
            .await;
    }

    #[tokio::test]
    async fn ensure_schema_creates_aliased_generation_with_indexes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/articles");
                then.status(404);
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path_matches(generation_path(""))
                    .header("api-key", "key")
                    .json_body(json!({ "vectors": { "size": 2, "distance": "Cosine" } }));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let indexes = server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path("/index"));
                then.status(200).json_body(json!({ "result": {} }));
            })
            .await;
        let alias = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/aliases")
                    .body_contains("create_alias")
                    .body_contains("\"alias_name\":\"articles\"");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;

        store(&server).ensure_schema(2).await.unwrap();
        create.assert_async().await;
        indexes.assert_hits_async(PAYLOAD_INDEXES.len()).await;
        alias.assert_async().await;
    }

    #[tokio::test]
    async fn existing_collection_is_left_alone() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/articles");
                then.status(200).json_body(json!({ "result": {} }));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT).path_contains("/collections/");
                then.status(200);
            })
            .await;

        store(&server).ensure_schema(2).await.unwrap();
        create.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn replace_fills_a_new_generation_in_batches_then_switches_the_alias() {
        let server = MockServer::start_async().await;
        mock_alias_target(&server, "articles-old").await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path(""));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path("/index"));
                then.status(200);
            })
            .await;
        let points = server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path("/points"));
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;
        let switch = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/aliases")
                    .body_contains("delete_alias")
                    .body_contains("create_alias");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let drop_old = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/collections/articles-old");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;

        let rows: Vec<IndexedChunk> = (0..UPSERT_BATCH_POINTS + 44)
            .map(|n| row(&format!("chunk {n}")))
            .collect();
        store(&server).replace(2, rows).await.unwrap();

        points.assert_hits_async(2).await;
        switch.assert_async().await;
        drop_old.assert_async().await;
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_the_serving_generation() {
        let server = MockServer::start_async().await;
        mock_alias_target(&server, "articles-old").await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path(""));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path("/index"));
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path("/points"));
                then.status(413).body("payload too large");
            })
            .await;
        let drop_abandoned = server
            .mock_async(|when, then| {
                when.method(DELETE).path_matches(generation_path(""));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let drop_old = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/collections/articles-old");
                then.status(200);
            })
            .await;
        let switch = server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/aliases");
                then.status(200);
            })
            .await;

        let error = store(&server)
            .replace(2, vec![row("alpha")])
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            IndexError::UnexpectedStatus { status, .. } if status == StatusCode::PAYLOAD_TOO_LARGE
        ));
        drop_abandoned.assert_async().await;
        switch.assert_hits_async(0).await;
        drop_old.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn replace_takes_over_a_plain_collection_name() {
        let server = MockServer::start_async().await;
        mock_alias_target(&server, "").await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path(""));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path("/index"));
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path_matches(generation_path("/points"));
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/articles");
                then.status(200).json_body(json!({ "result": {} }));
            })
            .await;
        let drop_plain = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/collections/articles");
                then.status(200);
            })
            .await;
        let switch = server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/aliases");
                then.status(200);
            })
            .await;

        store(&server).replace(2, vec![row("alpha")]).await.unwrap();
        drop_plain.assert_async().await;
        switch.assert_async().await;
    }

    #[tokio::test]
    async fn upsert_sends_fingerprint_ids_and_metadata_in_batches() {
        let server = MockServer::start_async().await;
        let expected = row("alpha");
        let first = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/articles/points")
                    .query_param("wait", "true")
                    .body_contains(expected.id.to_string())
                    .body_contains(&expected.fingerprint)
                    .body_contains("\"source_id\":\"10.1/a\"");
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;
        let rest = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/articles/points");
                then.status(200).json_body(json!({ "result": { "status": "completed" } }));
            })
            .await;

        let mut rows = vec![row("alpha")];
        rows.extend((0..UPSERT_BATCH_POINTS).map(|n| row(&format!("filler {n}"))));
        store(&server).upsert(rows).await.unwrap();
        first.assert_async().await;
        rest.assert_async().await;
    }

    #[tokio::test]
    async fn query_decodes_hits() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/articles/points/query");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [{
                            "id": "5f0c6b9e-0000-0000-0000-000000000000",
                            "score": 0.87,
                            "payload": {
                                "text": "Raman peaks",
                                "fingerprint": "abc",
                                "metadata": {
                                    "source_id": "10.1/a",
                                    "page_numbers": [4, 5],
                                    "heading": "Results"
                                }
                            }
                        }]
                    }
                }));
            })
            .await;

        let hits = store(&server).query(vec![0.1, 0.2], 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "Raman peaks");
        assert_eq!(hits[0].origin.page_numbers, Some(vec![4, 5]));
        assert_eq!(hits[0].origin.heading.as_deref(), Some("Results"));
        assert!((hits[0].score - 0.87).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn server_errors_carry_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/articles/points/query");
                then.status(500).body("boom");
            })
            .await;

        let error = store(&server).query(vec![0.1], 1).await.unwrap_err();
        assert!(matches!(
            error,
            IndexError::UnexpectedStatus { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
    }
}
