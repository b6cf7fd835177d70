#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **walproxy-mapper** – the Collection Identity Mapper.
//!
//! Each backend assigns its own UUID when a logical collection is created
//! on it; this crate translates between the client-visible logical name
//! and whichever UUID the chosen backend understands, and keeps an
//! in-memory cache keyed by name on top of the durable
//! [`walproxy_store::StoreAdapter`] table.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use walproxy_store::StoreAdapter;
use walproxy_types::{BackendName, CollectionMapping, Error, Result};

/// Maintains `CollectionMapping` rows and a name-keyed in-memory cache.
///
/// Generic over `S: StoreAdapter + ?Sized` so the service binary can use
/// `CollectionMapper<dyn StoreAdapter>` behind a single `Arc`, while unit
/// tests here use a concrete, sized `SqliteStore`.
pub struct CollectionMapper<S: StoreAdapter + ?Sized> {
    store: Arc<S>,
    by_name: DashMap<String, CollectionMapping>,
    by_uuid: DashMap<Uuid, String>,
}

impl<S: StoreAdapter + ?Sized> CollectionMapper<S> {
    /// Build a mapper over the given store, with an empty cache — entries
    /// are populated lazily on first lookup or auto-mapped on create.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            by_name: DashMap::new(),
            by_uuid: DashMap::new(),
        }
    }

    fn cache_insert(&self, mapping: CollectionMapping) {
        if let Some(uuid) = mapping.primary_uuid {
            self.by_uuid.insert(uuid, mapping.name.clone());
        }
        if let Some(uuid) = mapping.replica_uuid {
            self.by_uuid.insert(uuid, mapping.name.clone());
        }
        self.by_name.insert(mapping.name.clone(), mapping);
    }

    fn cache_remove(&self, name: &str) {
        if let Some((_, mapping)) = self.by_name.remove(name) {
            if let Some(uuid) = mapping.primary_uuid {
                self.by_uuid.remove(&uuid);
            }
            if let Some(uuid) = mapping.replica_uuid {
                self.by_uuid.remove(&uuid);
            }
        }
    }

    async fn mapping_by_name(&self, name: &str) -> Result<Option<CollectionMapping>> {
        if let Some(mapping) = self.by_name.get(name) {
            return Ok(Some(mapping.clone()));
        }
        if let Some(mapping) = self.store.get_mapping_by_name(name).await? {
            self.cache_insert(mapping.clone());
            return Ok(Some(mapping));
        }
        Ok(None)
    }

    async fn mapping_by_uuid(&self, uuid: Uuid) -> Result<Option<CollectionMapping>> {
        if let Some(name) = self.by_uuid.get(&uuid) {
            return self.mapping_by_name(&name).await;
        }
        if let Some(mapping) = self.store.get_mapping_by_uuid(uuid).await? {
            self.cache_insert(mapping.clone());
            return Ok(Some(mapping));
        }
        Ok(None)
    }

    /// Resolve `ident` (a logical name or either backend's UUID) to the
    /// UUID `backend` understands. Returns `Ok(None)` when resolution
    /// fails rather than an error — the caller decides whether that's
    /// fatal.
    pub async fn resolve_for_backend(
        &self,
        ident: &str,
        backend: BackendName,
    ) -> Result<Option<Uuid>> {
        if let Ok(uuid) = Uuid::parse_str(ident) {
            if let Some(mapping) = self.mapping_by_uuid(uuid).await? {
                return Ok(mapping.uuid_for(backend));
            }
            // Unknown UUID: treat as identity on the backend it was minted for.
            return Ok(Some(uuid));
        }
        let mapping = self.mapping_by_name(ident).await?;
        Ok(mapping.and_then(|m| m.uuid_for(backend)))
    }

    /// Rewrite a `…/collections/{ident}…` path so the segment targets the
    /// UUID `backend` understands. Leaves the path untouched when `ident`
    /// cannot be resolved, so a write racing an unmapped collection still
    /// proceeds unrewritten.
    pub async fn rewrite_path(&self, path: &str, backend: BackendName) -> Result<String> {
        let Some((prefix, ident, suffix)) = split_collection_ident(path) else {
            return Ok(path.to_string());
        };
        match self.resolve_for_backend(ident, backend).await? {
            Some(uuid) => Ok(format!("{prefix}{uuid}{suffix}")),
            None => {
                debug!(ident, %backend, "collection identity unresolved, passing through");
                Ok(path.to_string())
            }
        }
    }

    /// Observe a 2xx response to `POST …/collections` and auto-map the
    /// logical name. Idempotent: a repeated observation for an
    /// already-complete mapping is a no-op.
    pub async fn observe_create(
        &self,
        backend: BackendName,
        name: &str,
        backend_uuid: Uuid,
        configuration: serde_json::Value,
    ) -> Result<CollectionMapping> {
        let now = Utc::now();
        let mut mapping = match self.mapping_by_name(name).await? {
            Some(existing) => existing,
            None => CollectionMapping {
                name: name.to_string(),
                primary_uuid: None,
                replica_uuid: None,
                configuration,
                created_at: now,
                updated_at: now,
            },
        };

        let slot = match backend {
            BackendName::Primary => &mut mapping.primary_uuid,
            BackendName::Replica => &mut mapping.replica_uuid,
        };
        match slot {
            Some(existing) if *existing != backend_uuid => {
                warn!(
                    name,
                    %backend,
                    existing = %existing,
                    observed = %backend_uuid,
                    "collection mapping conflict"
                );
                return Err(Error::MappingConflict(format!(
                    "name {name} already mapped to {existing} on {backend}, observed {backend_uuid}"
                )));
            }
            _ => *slot = Some(backend_uuid),
        }
        mapping.updated_at = now;

        self.store.upsert_mapping(&mapping).await?;
        self.cache_insert(mapping.clone());
        Ok(mapping)
    }

    /// Resolve both backend UUIDs for `name` and forget the mapping. The
    /// caller (Proxy Frontend / WAL engine) is responsible for issuing the
    /// per-backend `DELETE` calls and logging the WAL entry; this only
    /// handles the identity bookkeeping.
    pub async fn take_for_delete(&self, name: &str) -> Result<Option<CollectionMapping>> {
        let mapping = self.mapping_by_name(name).await?;
        if mapping.is_some() {
            self.store.delete_mapping(name).await?;
            self.cache_remove(name);
        }
        Ok(mapping)
    }

    /// Look up a mapping by logical name without mutating anything.
    pub async fn get(&self, name: &str) -> Result<Option<CollectionMapping>> {
        self.mapping_by_name(name).await
    }
}

/// Split a path of the form `…/collections/{ident}…` into
/// `(prefix_through_slash, ident, suffix)`.
fn split_collection_ident(path: &str) -> Option<(&str, &str, &str)> {
    const MARKER: &str = "/collections/";
    let marker_at = path.find(MARKER)?;
    let ident_start = marker_at + MARKER.len();
    let rest = &path[ident_start..];
    let ident_len = rest.find('/').unwrap_or(rest.len());
    if ident_len == 0 {
        return None;
    }
    Some((
        &path[..ident_start],
        &rest[..ident_len],
        &rest[ident_len..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use walproxy_store::SqliteStore;

    async fn mapper() -> CollectionMapper<SqliteStore> {
        CollectionMapper::new(Arc::new(SqliteStore::in_memory().await.unwrap()))
    }

    #[test]
    fn split_collection_ident_extracts_middle_segment() {
        let (prefix, ident, suffix) =
            split_collection_ident("/api/v2/tenants/t/databases/d/collections/docs/add").unwrap();
        assert_eq!(prefix, "/api/v2/tenants/t/databases/d/collections/");
        assert_eq!(ident, "docs");
        assert_eq!(suffix, "/add");
    }

    #[test]
    fn split_collection_ident_handles_bare_trailing_segment() {
        let (_, ident, suffix) =
            split_collection_ident("/api/v2/tenants/t/databases/d/collections/docs").unwrap();
        assert_eq!(ident, "docs");
        assert_eq!(suffix, "");
    }

    #[tokio::test]
    async fn observe_create_then_resolve_round_trips() {
        let mapper = mapper().await;
        let primary_uuid = Uuid::new_v4();
        mapper
            .observe_create(BackendName::Primary, "docs", primary_uuid, serde_json::json!({}))
            .await
            .unwrap();

        let resolved = mapper
            .resolve_for_backend("docs", BackendName::Primary)
            .await
            .unwrap();
        assert_eq!(resolved, Some(primary_uuid));

        let unresolved = mapper
            .resolve_for_backend("docs", BackendName::Replica)
            .await
            .unwrap();
        assert_eq!(unresolved, None);
    }

    #[tokio::test]
    async fn observe_create_fills_opportunistic_peer_slot() {
        let mapper = mapper().await;
        let primary_uuid = Uuid::new_v4();
        let replica_uuid = Uuid::new_v4();
        mapper
            .observe_create(BackendName::Primary, "docs", primary_uuid, serde_json::json!({}))
            .await
            .unwrap();
        let mapping = mapper
            .observe_create(BackendName::Replica, "docs", replica_uuid, serde_json::json!({}))
            .await
            .unwrap();

        assert!(mapping.is_complete());
    }

    #[tokio::test]
    async fn observe_create_rejects_conflicting_uuid_for_same_slot() {
        let mapper = mapper().await;
        let uuid_a = Uuid::new_v4();
        let uuid_b = Uuid::new_v4();
        mapper
            .observe_create(BackendName::Primary, "docs", uuid_a, serde_json::json!({}))
            .await
            .unwrap();

        let err = mapper
            .observe_create(BackendName::Primary, "docs", uuid_b, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MappingConflict(_)));
    }

    #[tokio::test]
    async fn take_for_delete_forgets_mapping() {
        let mapper = mapper().await;
        let uuid = Uuid::new_v4();
        mapper
            .observe_create(BackendName::Primary, "docs", uuid, serde_json::json!({}))
            .await
            .unwrap();

        let taken = mapper.take_for_delete("docs").await.unwrap();
        assert!(taken.is_some());
        assert!(mapper.get("docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewrite_path_passes_through_when_unresolved() {
        let mapper = mapper().await;
        let path = "/api/v2/tenants/t/databases/d/collections/unknown/add";
        let rewritten = mapper.rewrite_path(path, BackendName::Primary).await.unwrap();
        assert_eq!(rewritten, path);
    }

    #[tokio::test]
    async fn rewrite_path_substitutes_known_uuid() {
        let mapper = mapper().await;
        let uuid = Uuid::new_v4();
        mapper
            .observe_create(BackendName::Primary, "docs", uuid, serde_json::json!({}))
            .await
            .unwrap();

        let path = "/api/v2/tenants/t/databases/d/collections/docs/add";
        let rewritten = mapper.rewrite_path(path, BackendName::Primary).await.unwrap();
        assert_eq!(
            rewritten,
            format!("/api/v2/tenants/t/databases/d/collections/{uuid}/add")
        );
    }
}
