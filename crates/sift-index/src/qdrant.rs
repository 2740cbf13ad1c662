//! Qdrant adapter for the [`VectorStore`] boundary.
//!
//! Entity ids are 128-bit hex strings and map one-to-one onto UUID point ids.
//! Every point carries `file_path` and `origin` in its payload; path-scoped
//! operations filter on `file_path` and exclude curated points. Upserts
//! leave out ids that already hold a curated point.
//!
//! The collection itself is created and dropped outside this crate.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, DeletePointsBuilder, Filter, PointId, PointStruct,
    ScrollPointsBuilder, SetPayloadPointsBuilder, UpsertPointsBuilder, Value,
};
use qdrant_client::{Payload, Qdrant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{EmbeddedEntity, Origin, StoreError, VectorStore};

/// Where the points live. `dimensions` is only used to word the error when
/// the collection is missing.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection_name: String,
    pub dimensions: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_name: crate::DEFAULT_COLLECTION.to_string(),
            dimensions: crate::DEFAULT_DIMENSIONS,
        }
    }
}

/// Vector store backed by a Qdrant collection.
pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
    dimensions: usize,
}

impl QdrantStore {
    pub async fn from_config(config: &QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(key) = &config.api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder
            .build()
            .with_context(|| format!("cannot build Qdrant client for {}", config.url))?;
        info!(url = %config.url, collection = %config.collection_name, "qdrant client ready");

        Ok(Self {
            client,
            collection_name: config.collection_name.clone(),
            dimensions: config.dimensions,
        })
    }

    /// Fail unless the target collection exists.
    pub async fn check_collection(&self) -> Result<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .context("Failed to list collections")?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection_name);
        if !exists {
            anyhow::bail!(
                "collection {} does not exist; create it with {} dimensions first",
                self.collection_name,
                self.dimensions
            );
        }
        debug!("Collection {} exists", self.collection_name);
        Ok(())
    }

    async fn count_matching(&self, filter: Filter) -> Result<usize> {
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection_name)
                    .filter(filter)
                    .exact(true),
            )
            .await
            .context("Failed to count points")?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn try_upsert(&self, entities: Vec<EmbeddedEntity>) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let uuids = entities
            .iter()
            .map(|e| point_uuid(&e.entity.id))
            .collect::<Result<Vec<_>>>()?;
        let curated = self.curated_among(&uuids).await?;
        let points = derived_points(entities, uuids, &curated);
        if points.is_empty() {
            return Ok(());
        }
        debug!(points = points.len(), "upserting");

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .context("Failed to upsert points")?;
        Ok(())
    }

    /// Which of `uuids` already exist as curated points. A curated point
    /// written between this lookup and the upsert is still overwritten.
    async fn curated_among(&self, uuids: &[String]) -> Result<HashSet<String>> {
        let ids: Vec<PointId> = uuids.iter().cloned().map(PointId::from).collect();
        let limit = u32::try_from(ids.len()).unwrap_or(u32::MAX);
        let filter = Filter::must([Condition::has_id(ids), curated_condition()]);
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection_name)
                    .filter(filter)
                    .limit(limit)
                    .with_payload(false)
                    .with_vectors(false),
            )
            .await
            .context("Failed to look up curated points")?;
        Ok(response
            .result
            .into_iter()
            .filter_map(|point| uuid_of(point.id?))
            .collect())
    }

    async fn try_delete(&self, filter: Filter) -> Result<usize> {
        let count = self.count_matching(filter.clone()).await?;
        if count == 0 {
            return Ok(0);
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await
            .context("Failed to delete points")?;
        Ok(count)
    }

    async fn try_update_path(&self, old_path: &str, new_path: &str) -> Result<usize> {
        let filter = derived_for_path(old_path);
        let count = self.count_matching(filter.clone()).await?;
        if count == 0 {
            return Ok(0);
        }

        let mut payload = HashMap::new();
        payload.insert("file_path".to_string(), Value::from(new_path.to_string()));

        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.collection_name, Payload::from(payload))
                    .points_selector(filter)
                    .wait(true),
            )
            .await
            .context("Failed to update file_path payload")?;
        Ok(count)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, entities: Vec<EmbeddedEntity>) -> Result<(), StoreError> {
        self.try_upsert(entities).await.map_err(to_store_error)
    }

    async fn delete_by_path(&self, file_path: &str) -> Result<usize, StoreError> {
        self.try_delete(derived_for_path(file_path))
            .await
            .map_err(to_store_error)
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let point_ids = ids
            .iter()
            .map(|id| point_id(id))
            .collect::<Result<Vec<_>>>()
            .map_err(to_store_error)?;
        let mut filter = Filter::must([Condition::has_id(point_ids)]);
        filter.must_not.push(curated_condition());
        self.try_delete(filter).await.map_err(to_store_error)
    }

    async fn update_path(&self, old_path: &str, new_path: &str) -> Result<usize, StoreError> {
        self.try_update_path(old_path, new_path)
            .await
            .map_err(to_store_error)
    }

    async fn count_for_path(&self, file_path: &str) -> Result<usize, StoreError> {
        self.count_matching(derived_for_path(file_path))
            .await
            .map_err(to_store_error)
    }
}

fn to_store_error(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{:#}", err))
}

/// Entity ids are 32 hex characters, i.e. a UUID without dashes. Points use
/// the hyphenated form.
fn point_uuid(entity_id: &str) -> Result<String> {
    let uuid = Uuid::parse_str(entity_id)
        .with_context(|| format!("entity id {:?} is not a 128-bit hex id", entity_id))?;
    Ok(uuid.to_string())
}

fn point_id(entity_id: &str) -> Result<PointId> {
    point_uuid(entity_id).map(PointId::from)
}

/// Build points for `entities`, leaving out ids held by curated points.
fn derived_points(
    entities: Vec<EmbeddedEntity>,
    uuids: Vec<String>,
    curated: &HashSet<String>,
) -> Vec<PointStruct> {
    let mut points = Vec::with_capacity(entities.len());
    for (embedded, uuid) in entities.into_iter().zip(uuids) {
        if curated.contains(&uuid) {
            warn!("Not overwriting curated point {}", embedded.entity.id);
            continue;
        }
        let payload = entity_payload(&embedded);
        points.push(PointStruct::new(PointId::from(uuid), embedded.vector, payload));
    }
    points
}

fn uuid_of(id: PointId) -> Option<String> {
    match id.point_id_options? {
        PointIdOptions::Uuid(uuid) => Some(uuid),
        PointIdOptions::Num(_) => None,
    }
}

fn curated_condition() -> Condition {
    Condition::matches("origin", Origin::Curated.as_str().to_string())
}

/// Derived points of one file.
fn derived_for_path(file_path: &str) -> Filter {
    let mut filter = Filter::must([Condition::matches("file_path", file_path.to_string())]);
    filter.must_not.push(curated_condition());
    filter
}

/// Payload stored with each point.
fn entity_payload(embedded: &EmbeddedEntity) -> HashMap<String, Value> {
    let e = &embedded.entity;
    let mut map = HashMap::new();

    map.insert("entity_id".to_string(), Value::from(e.id.clone()));
    map.insert("file_path".to_string(), Value::from(e.file_path.clone()));
    map.insert("kind".to_string(), Value::from(e.kind.as_str().to_string()));
    map.insert("name".to_string(), Value::from(e.name.clone()));
    map.insert("line_start".to_string(), Value::from(e.span.start_line as i64));
    map.insert("line_end".to_string(), Value::from(e.span.end_line as i64));
    map.insert(
        "content_hash".to_string(),
        Value::from(e.content_hash.as_str().to_string()),
    );
    map.insert("variant".to_string(), Value::from(e.variant.as_str().to_string()));
    map.insert(
        "origin".to_string(),
        Value::from(Origin::Derived.as_str().to_string()),
    );
    map.insert("text".to_string(), Value::from(e.text.clone()));

    if let Some(ref sig) = e.signature {
        map.insert("signature".to_string(), Value::from(sig.clone()));
    }
    if let Some(ref scope) = e.scope {
        map.insert("scope".to_string(), Value::from(scope.clone()));
    }

    map
}
