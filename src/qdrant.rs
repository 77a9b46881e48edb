//! Qdrant vector store client.
//!
//! A thin REST client over the Qdrant HTTP API covering exactly what the
//! indexing and retrieval paths need: collection lifecycle with a
//! refuse-to-corrupt dimension check, a keyword payload index on
//! `content_type`, batched idempotent upsert, and filtered search.
//!
//! Collections are split per content type: `<base>__code` and
//! `<base>__docs`. The legacy `QDRANT_COLLECTION` variable is still parsed
//! into the config for compatibility, but the split-name resolver never
//! consults it.
//!
//! # Filters
//!
//! Caller filters are lowered to store-native clauses:
//! - `path_prefix` → a full-text match on `path` (approximate prefix)
//! - list values → match-any
//! - scalars → match-equal

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";
pub const DEFAULT_QDRANT_COLLECTION_BASE: &str = "scout";
pub const DEFAULT_QDRANT_DISTANCE: &str = "cosine";
pub const DEFAULT_QDRANT_UPSERT_BATCH: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The collection exists with a different dimensionality. Creating or
    /// writing would corrupt it, so this always fails loudly.
    #[error(
        "collection '{collection}' has vector size {existing}, but the embedding model \
         returns {requested}; use another collection or delete the existing one"
    )]
    CollectionMismatch {
        collection: String,
        existing: usize,
        requested: usize,
    },
    #[error("unknown distance metric: '{0}' (valid: cosine, euclid, dot, manhattan)")]
    UnknownDistance(String),
    #[error("vector store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("vector store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Resolved vector store settings, frozen after construction.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection_base: String,
    /// Legacy single-collection override; parsed but never used by the
    /// split-collection resolver.
    pub collection: Option<String>,
    pub distance: String,
    pub upsert_batch: usize,
}

/// Resolve the vector store configuration from environment and defaults.
pub fn load_qdrant_config<E>(env: E) -> Result<QdrantConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let upsert_batch = match env("QDRANT_UPSERT_BATCH") {
        None => DEFAULT_QDRANT_UPSERT_BATCH,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(parsed) => parsed,
            Err(_) => bail!("QDRANT_UPSERT_BATCH must be a valid integer, got '{}'", raw),
        },
    };

    Ok(QdrantConfig {
        url: env("QDRANT_URL").unwrap_or_else(|| DEFAULT_QDRANT_URL.to_string()),
        api_key: env("QDRANT_API_KEY"),
        collection_base: env("QDRANT_COLLECTION_BASE")
            .unwrap_or_else(|| DEFAULT_QDRANT_COLLECTION_BASE.to_string()),
        collection: env("QDRANT_COLLECTION"),
        distance: env("QDRANT_DISTANCE").unwrap_or_else(|| DEFAULT_QDRANT_DISTANCE.to_string()),
        upsert_batch,
    })
}

/// Map a distance string to the store's metric name.
pub fn resolve_distance(distance: &str) -> Result<&'static str, StoreError> {
    match distance.trim().to_lowercase().as_str() {
        "cosine" => Ok("Cosine"),
        "euclid" => Ok("Euclid"),
        "dot" => Ok("Dot"),
        "manhattan" => Ok("Manhattan"),
        other => Err(StoreError::UnknownDistance(other.to_string())),
    }
}

/// The pair of per-content-type collection names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitCollections {
    pub code: String,
    pub docs: String,
}

/// One record in a vector collection.
#[derive(Debug, Clone, Serialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: Value,
    pub vector: Option<Vec<f32>>,
}

/// Outcome of [`QdrantStore::ensure_collection`].
#[derive(Debug, Clone, Serialize)]
pub struct EnsureOutcome {
    pub action: &'static str,
    pub collection: String,
    pub vector_size: usize,
    pub distance: String,
}

/// Upsert counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertStats {
    pub points_upserted: usize,
    pub batches: usize,
}

/// Lower caller filters to a store-native `must` clause.
pub fn build_filter(filters: &Map<String, Value>) -> Option<Value> {
    let mut must = Vec::new();

    for (key, value) in filters {
        if key == "path_prefix" {
            must.push(json!({"key": "path", "match": {"text": value}}));
        } else if value.is_array() {
            must.push(json!({"key": key, "match": {"any": value}}));
        } else {
            must.push(json!({"key": key, "match": {"value": value}}));
        }
    }

    if must.is_empty() {
        None
    } else {
        Some(json!({"must": must}))
    }
}

/// Read the configured vector size out of a collection-info result.
///
/// Handles both the single unnamed vector config and named vector maps
/// (default entry first, else the first named entry).
pub(crate) fn extract_vector_size(info: &Value) -> Option<usize> {
    let vectors = info.pointer("/config/params/vectors")?;

    if let Some(size) = vectors.get("size").and_then(Value::as_u64) {
        return Some(size as usize);
    }

    let map = vectors.as_object()?;
    if let Some(size) = map.get("").and_then(|v| v.get("size")).and_then(Value::as_u64) {
        return Some(size as usize);
    }
    map.values()
        .find_map(|v| v.get("size").and_then(Value::as_u64))
        .map(|size| size as usize)
}

/// Short-lived client for one indexing or retrieval operation.
pub struct QdrantStore {
    config: QdrantConfig,
    distance: &'static str,
    client: reqwest::Client,
}

impl QdrantStore {
    /// Validates the configured distance metric eagerly; an unknown metric
    /// is a construction error.
    pub fn new(config: QdrantConfig) -> Result<Self, StoreError> {
        let distance = resolve_distance(&config.distance)?;
        let client = reqwest::Client::new();
        Ok(Self {
            config,
            distance,
            client,
        })
    }

    pub fn config(&self) -> &QdrantConfig {
        &self.config
    }

    /// Split collection names for the configured base. `dim` and
    /// `model_name` are accepted for forward compatibility but do not
    /// affect naming.
    pub fn resolve_split_collection_names(
        &self,
        _dim: usize,
        _model_name: &str,
    ) -> SplitCollections {
        SplitCollections {
            code: format!("{}__code", self.config.collection_base),
            docs: format!("{}__docs", self.config.collection_base),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn read_error(response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StoreError::Status { status, body }
    }

    /// Fetch collection info; `None` when the collection does not exist.
    async fn collection_info(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let response = self
            .request(self.client.get(self.endpoint(&format!("/collections/{name}"))))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let json: Value = response.json().await?;
        Ok(Some(json.get("result").cloned().unwrap_or(Value::Null)))
    }

    /// Idempotently ensure a collection with the given dimensionality.
    ///
    /// Creates it when absent; validates when present. A present collection
    /// with a different dimensionality fails with
    /// [`StoreError::CollectionMismatch`].
    pub async fn ensure_collection(
        &self,
        name: &str,
        vector_size: usize,
    ) -> Result<EnsureOutcome, StoreError> {
        match self.collection_info(name).await? {
            None => {
                info!(collection = name, vector_size, "creating collection");
                let body = json!({
                    "vectors": {"size": vector_size, "distance": self.distance},
                });
                let response = self
                    .request(self.client.put(self.endpoint(&format!("/collections/{name}"))))
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Self::read_error(response).await);
                }
                Ok(EnsureOutcome {
                    action: "created",
                    collection: name.to_string(),
                    vector_size,
                    distance: self.config.distance.clone(),
                })
            }
            Some(info) => {
                let existing = extract_vector_size(&info).ok_or_else(|| {
                    StoreError::Other(format!(
                        "could not determine vector size of collection '{name}'"
                    ))
                })?;

                if existing != vector_size {
                    return Err(StoreError::CollectionMismatch {
                        collection: name.to_string(),
                        existing,
                        requested: vector_size,
                    });
                }

                debug!(collection = name, vector_size = existing, "collection validated");
                Ok(EnsureOutcome {
                    action: "validated",
                    collection: name.to_string(),
                    vector_size: existing,
                    distance: self.config.distance.clone(),
                })
            }
        }
    }

    /// Create a keyword payload index on `field`. Idempotent at the store
    /// level; an already-indexed field is not an error.
    pub async fn ensure_payload_keyword_index(
        &self,
        name: &str,
        field: &str,
    ) -> Result<(), StoreError> {
        let body = json!({"field_name": field, "field_schema": "keyword"});
        let response = self
            .request(
                self.client
                    .put(self.endpoint(&format!("/collections/{name}/index")))
                    .query(&[("wait", "true")]),
            )
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if text.contains("already exists") {
            return Ok(());
        }
        Err(StoreError::Status { status, body: text })
    }

    /// True iff the collection's reported payload schema lists `field`.
    pub async fn has_payload_field(&self, name: &str, field: &str) -> Result<bool, StoreError> {
        let Some(info) = self.collection_info(name).await? else {
            return Ok(false);
        };
        Ok(info
            .get("payload_schema")
            .and_then(Value::as_object)
            .map(|schema| schema.contains_key(field))
            .unwrap_or(false))
    }

    /// Upsert points in batches of the configured size. Repeated ids
    /// overwrite, so re-running an index pass is idempotent.
    pub async fn upsert(
        &self,
        points: &[VectorPoint],
        collection: &str,
    ) -> Result<UpsertStats, StoreError> {
        if points.is_empty() {
            return Ok(UpsertStats::default());
        }

        let mut stats = UpsertStats::default();
        for batch in points.chunks(self.config.upsert_batch.max(1)) {
            let body = json!({"points": batch});
            let response = self
                .request(
                    self.client
                        .put(self.endpoint(&format!("/collections/{collection}/points")))
                        .query(&[("wait", "true")]),
                )
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(Self::read_error(response).await);
            }

            stats.points_upserted += batch.len();
            stats.batches += 1;
            debug!(batch = stats.batches, points = batch.len(), "upsert batch stored");
        }

        info!(
            collection,
            points = stats.points_upserted,
            batches = stats.batches,
            "upsert complete"
        );
        Ok(stats)
    }

    /// Search a collection, returning hits sorted by descending score.
    ///
    /// A missing collection (404) yields an empty list; other failures
    /// bubble up.
    pub async fn search(
        &self,
        query_vector: &[f32],
        collection: &str,
        filters: Option<&Map<String, Value>>,
        top_k: usize,
        with_vector: bool,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let mut body = json!({
            "vector": query_vector,
            "limit": top_k,
            "with_payload": true,
            "with_vector": with_vector,
        });
        if let Some(filter) = filters.and_then(build_filter) {
            body["filter"] = filter;
        }

        let response = self
            .request(
                self.client
                    .post(self.endpoint(&format!("/collections/{collection}/points/search"))),
            )
            .json(&body)
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let json: Value = response.json().await?;
        let hits = json
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .iter()
            .map(|hit| ScoredPoint {
                id: match hit.get("id") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
                score: hit.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                payload: hit.get("payload").cloned().unwrap_or(Value::Null),
                vector: hit.get("vector").and_then(Value::as_array).map(|values| {
                    values
                        .iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect()
                }),
            })
            .collect())
    }
}
