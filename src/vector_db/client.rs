//! Chroma REST client implementation

use super::models::{sanitize_metadata, CollectionHandle, EmbeddingRecord, Metadata, QueryMatch, QueryParams};
use super::VectorStore;
use crate::config::ServerConfig;
use crate::error::{Result, ServiceError, VectorDbError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const API_PREFIX: &str = "/api/v2";

/// Client for a Chroma vector database server
pub struct ChromaClient {
    http: Client,
    base_url: String,
    tenant: String,
    database: String,
}

#[derive(Debug, Deserialize)]
struct CollectionModel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(rename = "nanosecond heartbeat")]
    nanosecond_heartbeat: u64,
}

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    ids: Vec<&'a str>,
    embeddings: Vec<&'a [f32]>,
    metadatas: Vec<Option<Metadata>>,
    documents: Vec<Option<&'a str>>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    ids: Vec<String>,
    #[serde(default)]
    embeddings: Option<Vec<Option<Vec<f32>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Metadata>>>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
}

impl ChromaClient {
    /// Create a new client; no network traffic happens here
    pub fn new(config: &ServerConfig, request_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = config.auth_token() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ServiceError::Config(format!("Invalid auth token: {}", e)))?;
            let raw = HeaderValue::from_str(token)
                .map_err(|e| ServiceError::Config(format!("Invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, bearer);
            headers.insert("X-Chroma-Token", raw);
        }

        let http = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(4)
            .default_headers(headers)
            .build()
            .map_err(|e| VectorDbError::ConnectionError(e.to_string()))?;

        let base_url = config.base_url();
        info!("Chroma client targeting {}", base_url);

        Ok(Self {
            http,
            base_url,
            tenant: config.tenant.clone(),
            database: config.database.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collections_url(&self) -> String {
        format!(
            "{}{}/tenants/{}/databases/{}/collections",
            self.base_url, API_PREFIX, self.tenant, self.database
        )
    }

    fn collection_url(&self, collection: &CollectionHandle, action: &str) -> String {
        format!("{}/{}/{}", self.collections_url(), collection.id, action)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(VectorDbError::from)?;
        parse_json(check_status(response).await?).await
    }

    async fn post_unit<B: Serialize>(&self, url: &str, body: &B) -> Result<()> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(VectorDbError::from)?;
        check_status(response).await?;
        Ok(())
    }
}

/// Map non-success statuses onto the error taxonomy
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    let err = match status {
        StatusCode::NOT_FOUND => VectorDbError::CollectionNotFound(message),
        StatusCode::TOO_MANY_REQUESTS => VectorDbError::ServerError { status: status.as_u16(), message },
        s if s.is_server_error() => VectorDbError::ServerError { status: s.as_u16(), message },
        s => VectorDbError::RequestRejected { status: s.as_u16(), message },
    };
    Err(err.into())
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| VectorDbError::InvalidResponse(e.to_string()).into())
}

#[async_trait]
impl VectorStore for ChromaClient {
    async fn heartbeat(&self) -> Result<u64> {
        let url = format!("{}{}/heartbeat", self.base_url, API_PREFIX);
        let response = self.http.get(&url).send().await.map_err(VectorDbError::from)?;
        let beat: HeartbeatResponse = parse_json(check_status(response).await?).await?;
        Ok(beat.nanosecond_heartbeat)
    }

    async fn get_or_create_collection(&self, name: &str) -> Result<CollectionHandle> {
        debug!("Getting or creating collection: {}", name);

        let body = json!({
            "name": name,
            "metadata": { "hnsw:space": "cosine" },
            "get_or_create": true,
        });
        let model: CollectionModel = self.post_json(&self.collections_url(), &body).await?;

        debug!("Collection {} resolved to id {}", model.name, model.id);
        Ok(CollectionHandle {
            id: model.id,
            name: model.name,
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        debug!("Deleting collection: {}", name);

        let url = format!("{}/{}", self.collections_url(), name);
        let response = self.http.delete(&url).send().await.map_err(VectorDbError::from)?;
        check_status(response).await?;

        info!("Collection deleted: {}", name);
        Ok(())
    }

    async fn upsert(&self, collection: &CollectionHandle, records: Vec<EmbeddingRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        debug!("Upserting {} records into collection: {}", records.len(), collection.name);

        let body = UpsertRequest {
            ids: records.iter().map(|r| r.id.as_str()).collect(),
            embeddings: records.iter().map(|r| r.vector.as_slice()).collect(),
            metadatas: records
                .iter()
                .map(|r| Some(sanitize_metadata(&r.metadata)).filter(|m| !m.is_empty()))
                .collect(),
            documents: records.iter().map(|r| r.document.as_deref()).collect(),
        };

        self.post_unit(&self.collection_url(collection, "upsert"), &body).await
    }

    async fn query(&self, collection: &CollectionHandle, params: QueryParams) -> Result<Vec<QueryMatch>> {
        debug!("Querying collection: {} with top_k: {}", collection.name, params.top_k);

        let mut body = json!({
            "query_embeddings": [params.vector],
            "n_results": params.top_k,
            "include": ["metadatas", "documents", "distances"],
        });
        if let Some(filter) = params.filter {
            body["where"] = filter;
        }

        let response: QueryResponse = self.post_json(&self.collection_url(collection, "query"), &body).await?;

        let ids = response.ids.into_iter().next().unwrap_or_default();
        let distances = response.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();
        let metadatas = response.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
        let documents = response.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();

        let matches = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let distance = distances.get(i).copied().flatten().unwrap_or(1.0);
                let metadata = metadatas.get(i).cloned().flatten().unwrap_or_default();
                let document = documents.get(i).cloned().flatten();
                QueryMatch::from_distance(id, distance, metadata, document)
            })
            .collect::<Vec<_>>();

        debug!("Found {} matches", matches.len());
        Ok(matches)
    }

    async fn get(
        &self,
        collection: &CollectionHandle,
        ids: Option<Vec<String>>,
        limit: Option<usize>,
        include_vectors: bool,
    ) -> Result<Vec<EmbeddingRecord>> {
        let mut include = vec!["metadatas", "documents"];
        if include_vectors {
            include.push("embeddings");
        }

        let mut body = json!({ "include": include });
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            body["ids"] = Value::from(ids);
        }
        if let Some(limit) = limit {
            body["limit"] = Value::from(limit);
        }

        let response: GetResponse = self.post_json(&self.collection_url(collection, "get"), &body).await?;

        let embeddings = response.embeddings.unwrap_or_default();
        let metadatas = response.metadatas.unwrap_or_default();
        let documents = response.documents.unwrap_or_default();

        Ok(response
            .ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| EmbeddingRecord {
                id,
                vector: embeddings.get(i).cloned().flatten().unwrap_or_default(),
                metadata: metadatas.get(i).cloned().flatten().unwrap_or_default(),
                document: documents.get(i).cloned().flatten(),
            })
            .collect())
    }

    async fn delete(&self, collection: &CollectionHandle, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        debug!("Deleting {} records from collection: {}", ids.len(), collection.name);
        self.post_unit(&self.collection_url(collection, "delete"), &json!({ "ids": ids }))
            .await
    }

    async fn count(&self, collection: &CollectionHandle) -> Result<usize> {
        let url = self.collection_url(collection, "count");
        let response = self.http.get(&url).send().await.map_err(VectorDbError::from)?;
        parse_json(check_status(response).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> ChromaClient {
        let config = ServerConfig {
            url: Some(server.url()),
            ..ServerConfig::default()
        };
        ChromaClient::new(&config, Duration::from_secs(2)).unwrap()
    }

    fn handle() -> CollectionHandle {
        CollectionHandle { id: "c-1".into(), name: "file_embeddings".into() }
    }

    const COLLECTIONS: &str = "/api/v2/tenants/default_tenant/databases/default_database/collections";

    #[tokio::test]
    async fn test_heartbeat() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2/heartbeat")
            .with_status(200)
            .with_body(r#"{"nanosecond heartbeat": 1234}"#)
            .create_async()
            .await;

        let beat = client_for(&server).heartbeat().await.unwrap();
        assert_eq!(beat, 1234);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_or_create_collection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", COLLECTIONS)
            .match_body(Matcher::PartialJson(json!({ "name": "file_embeddings", "get_or_create": true })))
            .with_status(200)
            .with_body(r#"{"id": "c-1", "name": "file_embeddings", "metadata": null}"#)
            .create_async()
            .await;

        let handle = client_for(&server).get_or_create_collection("file_embeddings").await.unwrap();
        assert_eq!(handle.id, "c-1");
    }

    #[tokio::test]
    async fn test_upsert_sends_sanitized_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", format!("{}/c-1/upsert", COLLECTIONS).as_str())
            .match_body(Matcher::PartialJson(json!({
                "ids": ["f1"],
                "metadatas": [{ "path": "/a", "tags": "[\"x\"]" }],
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let record = EmbeddingRecord::new("f1", vec![0.1, 0.2])
            .with_metadata("path", "/a")
            .with_metadata("tags", json!(["x"]));
        client_for(&server).upsert(&handle(), vec![record]).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_parses_matches() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("{}/c-1/query", COLLECTIONS).as_str())
            .with_status(200)
            .with_body(
                r#"{"ids": [["a", "b"]], "distances": [[0.1, 0.4]],
                    "metadatas": [[{"name": "Docs"}, null]], "documents": [[null, "b doc"]]}"#,
            )
            .create_async()
            .await;

        let matches = client_for(&server)
            .query(&handle(), QueryParams::new(vec![0.1, 0.2], 2))
            .await
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "a");
        assert!((matches[0].score - 0.9).abs() < 1e-6);
        assert_eq!(matches[0].metadata.get("name"), Some(&json!("Docs")));
        assert_eq!(matches[1].document.as_deref(), Some("b doc"));
    }

    #[tokio::test]
    async fn test_stale_collection_maps_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("{}/c-1/delete", COLLECTIONS).as_str())
            .with_status(404)
            .with_body(r#"{"error": "NotFoundError", "message": "Collection c-1 does not exist."}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .delete(&handle(), vec!["f1".into()])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("{}/c-1/count", COLLECTIONS).as_str())
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let err = client_for(&server).count(&handle()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_auth_token_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2/heartbeat")
            .match_header("authorization", "Bearer s3cret")
            .match_header("x-chroma-token", "s3cret")
            .with_status(200)
            .with_body(r#"{"nanosecond heartbeat": 1}"#)
            .create_async()
            .await;

        let config = ServerConfig {
            url: Some(server.url()),
            auth_token: Some(secrecy::Secret::new("s3cret".to_string())),
            ..ServerConfig::default()
        };
        let client = ChromaClient::new(&config, Duration::from_secs(2)).unwrap();
        client.heartbeat().await.unwrap();
        mock.assert_async().await;
    }
}
