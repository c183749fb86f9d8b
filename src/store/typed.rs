//! CRUD over one resource kind.
//!
//! Reads are served from the cache. Writes are validated against the caches
//! and sent to the store with a precondition. A write returns once the store
//! acknowledges it; the change reaches the cache through the watch loop, so
//! reads right after a write may briefly see the previous state.

use super::cache::{Cache, CacheSet};
use super::watch::{WatchSession, WatchStatus};
use crate::core::error::{TrellisError, TrellisResult};
use crate::core::time::{next_update_time, unix_seconds, IdGenerator};
use crate::kv::{KvClient, Precondition};
use crate::resource::validate::validate_key;
use crate::resource::{Resource, ResourceCodec, ResourceKind, Validator};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Attempts made by an update whose key changes underneath it.
const UPDATE_ATTEMPTS: usize = 3;

/// Row filter for [`ListQuery`].
pub type Predicate = Arc<dyn Fn(&Resource) -> bool + Send + Sync>;

/// Row ordering for [`ListQuery`].
pub type Comparator = Arc<dyn Fn(&Resource, &Resource) -> Ordering + Send + Sync>;

/// Filter, order, and page selection for [`TypedStore::list`].
#[derive(Clone, Default)]
pub struct ListQuery {
    predicate: Option<Predicate>,
    order: Option<Comparator>,
    page_size: usize,
    page_number: usize,
}

impl std::fmt::Debug for ListQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListQuery")
            .field("filtered", &self.predicate.is_some())
            .field("ordered", &self.order.is_some())
            .field("page_size", &self.page_size)
            .field("page_number", &self.page_number)
            .finish()
    }
}

impl ListQuery {
    /// Every row, default order, no paging.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only rows for which `predicate` returns true.
    pub fn filter(
        mut self,
        predicate: impl Fn(&Resource) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Replace the default ordering.
    pub fn order_by(
        mut self,
        order: impl Fn(&Resource, &Resource) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.order = Some(Arc::new(order));
        self
    }

    /// Return page `number` (1-based) of `size` rows. A size of zero
    /// disables paging.
    pub fn page(mut self, size: usize, number: usize) -> Self {
        self.page_size = size;
        self.page_number = number;
        self
    }
}

/// A page of list results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOutput {
    pub rows: Vec<Resource>,
    /// Matches before paging.
    pub total_size: usize,
}

/// Ordering used when the caller supplies none: create time, then update
/// time, then id.
pub fn default_order(a: &Resource, b: &Resource) -> Ordering {
    a.create_time
        .cmp(&b.create_time)
        .then(a.update_time.cmp(&b.update_time))
        .then_with(|| a.id.cmp(&b.id))
}

/// Store for one resource kind.
#[derive(Debug)]
pub struct TypedStore {
    kind: ResourceKind,
    client: KvClient,
    cache: Arc<Cache>,
    caches: Arc<CacheSet>,
    ids: Arc<IdGenerator>,
    session: Arc<WatchSession>,
}

impl TypedStore {
    pub fn new(
        client: KvClient,
        cache: Arc<Cache>,
        caches: Arc<CacheSet>,
        ids: Arc<IdGenerator>,
        session: Arc<WatchSession>,
    ) -> Self {
        Self {
            kind: cache.kind(),
            client,
            cache,
            caches,
            ids,
            session,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn session(&self) -> &Arc<WatchSession> {
        &self.session
    }

    /// Watch progress for this kind.
    pub fn status(&self) -> WatchStatus {
        self.session.status()
    }

    /// Full storage key for `id`.
    pub fn storage_key(&self, id: &str) -> String {
        self.client.storage_key(self.kind, id)
    }

    /// Read one resource from the cache.
    pub fn get(&self, id: &str) -> TrellisResult<Resource> {
        let entry = self
            .cache
            .get(id)
            .ok_or_else(|| TrellisError::not_found(id))?;
        match &entry.resource {
            Some(resource) => Ok(resource.as_ref().clone()),
            None => Err(TrellisError::codec(format!(
                "key {} holds a value that does not decode",
                entry.key
            ))),
        }
    }

    /// Every decodable resource in key order.
    pub fn snapshot(&self) -> Vec<Arc<Resource>> {
        self.cache
            .snapshot()
            .into_iter()
            .filter_map(|entry| entry.resource.clone())
            .collect()
    }

    /// Filter, sort, and page the cached resources.
    pub fn list(&self, query: &ListQuery) -> ListOutput {
        let mut rows: Vec<Arc<Resource>> = self
            .snapshot()
            .into_iter()
            .filter(|resource| {
                query
                    .predicate
                    .as_ref()
                    .map_or(true, |p| p(resource.as_ref()))
            })
            .collect();

        match &query.order {
            Some(order) => rows.sort_by(|a, b| order(a.as_ref(), b.as_ref())),
            None => rows.sort_by(|a, b| default_order(a.as_ref(), b.as_ref())),
        }

        let total_size = rows.len();
        let rows = if query.page_size == 0 {
            rows
        } else {
            let page = query.page_number.max(1);
            let start = (page - 1).saturating_mul(query.page_size);
            rows.into_iter()
                .skip(start)
                .take(query.page_size)
                .collect()
        };

        ListOutput {
            rows: rows.iter().map(|r| r.as_ref().clone()).collect(),
            total_size,
        }
    }

    fn ensure_writable(&self) -> TrellisResult<()> {
        if !self.kind.is_writable() {
            return Err(TrellisError::validation(format!(
                "{} is read-only",
                self.kind
            )));
        }
        Ok(())
    }

    fn validate(&self, resource: &Resource) -> TrellisResult<String> {
        Validator::for_kind(self.kind).validate(resource, self.caches.as_ref())?;
        self.key_of(resource)
    }

    fn key_of(&self, resource: &Resource) -> TrellisResult<String> {
        resource.key_for(self.kind).ok_or_else(|| {
            TrellisError::validation(format!("{} is required", self.kind.key_field()))
        })
    }

    /// Validate a prospective create without writing anything.
    ///
    /// The conflict check reads the cache, so it can miss a key created
    /// elsewhere moments ago; `create` catches that at the store.
    pub fn create_check(&self, resource: &Resource) -> TrellisResult<Resource> {
        self.ensure_writable()?;
        let key = self.validate(resource)?;
        if self.cache.contains(&key) {
            return Err(TrellisError::already_exists(key));
        }
        Ok(resource.clone())
    }

    /// Create a resource, generating its id when absent.
    pub async fn create(&self, mut resource: Resource) -> TrellisResult<Resource> {
        self.ensure_writable()?;
        if resource.id.is_empty() {
            if self.kind.generates_keys() {
                resource.id = self.ids.next_id();
            } else if let Some(key) = resource.key_for(self.kind) {
                resource.id = key;
            }
        }
        let now = unix_seconds();
        resource.create_time = now;
        resource.update_time = now;

        self.create_check(&resource)?;
        let key = self.key_of(&resource)?;
        self.write(&key, &resource, Precondition::MustNotExist)
            .await?;
        Ok(resource)
    }

    /// Replace an existing resource. `NotFound` if it is absent from the store.
    pub async fn update(&self, id: &str, resource: Resource) -> TrellisResult<Resource> {
        self.update_inner(id, resource, false).await
    }

    /// Replace a resource, creating it when absent.
    pub async fn upsert(&self, id: &str, resource: Resource) -> TrellisResult<Resource> {
        self.update_inner(id, resource, true).await
    }

    async fn update_inner(
        &self,
        id: &str,
        mut resource: Resource,
        create_if_missing: bool,
    ) -> TrellisResult<Resource> {
        self.ensure_writable()?;
        self.bind_path_key(id, &mut resource)?;
        self.validate(&resource)?;

        let storage_key = self.storage_key(id);
        for _ in 0..UPDATE_ATTEMPTS {
            let Some(existing) = self.client.get(&storage_key).await? else {
                if !create_if_missing {
                    return Err(TrellisError::not_found(id));
                }
                let now = unix_seconds();
                resource.create_time = now;
                resource.update_time = now;
                self.write(id, &resource, Precondition::MustNotExist).await?;
                return Ok(resource);
            };

            // Pin the write to the generation read above so create_time is
            // never copied from a key that was deleted and recreated since.
            let previous = ResourceCodec::decode(id, &existing.value)?;
            resource.create_time = previous.create_time;
            resource.update_time = next_update_time(previous.update_time);
            let written = self
                .write(id, &resource, Precondition::ModRevision(existing.mod_revision))
                .await;
            match written {
                Ok(_) => return Ok(resource),
                Err(TrellisError::PreconditionFailed { .. }) => {
                    tracing::debug!(
                        kind = %self.kind,
                        key = %id,
                        "key changed during update; retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(TrellisError::unavailable(format!(
            "{} {} kept changing during update",
            self.kind, id
        )))
    }

    /// Make the body agree with the key given by the caller.
    fn bind_path_key(&self, id: &str, resource: &mut Resource) -> TrellisResult<()> {
        let field = self.kind.key_field();
        if field == "id" {
            if !resource.id.is_empty() && resource.id != id {
                return Err(TrellisError::validation(format!(
                    "ID on path ({}) doesn't match ID on body ({})",
                    id, resource.id
                )));
            }
            resource.id = id.to_string();
            return Ok(());
        }

        if resource.id.is_empty() {
            resource.id = id.to_string();
        }
        match resource.key_for(self.kind) {
            Some(key) if key != id => Err(TrellisError::validation(format!(
                "{} on path ({}) doesn't match {} on body ({})",
                field, id, field, key
            ))),
            Some(_) => Ok(()),
            None => {
                resource
                    .payload
                    .insert(field.to_string(), Value::String(id.to_string()));
                Ok(())
            }
        }
    }

    async fn write(
        &self,
        key: &str,
        resource: &Resource,
        precondition: Precondition,
    ) -> TrellisResult<u64> {
        let storage_key = self.storage_key(key);
        let value = ResourceCodec::encode(resource)?;
        let revision = self
            .client
            .put(&storage_key, value, Some(precondition))
            .await
            .map_err(|e| match (e, precondition) {
                (TrellisError::PreconditionFailed { .. }, Precondition::MustNotExist) => {
                    TrellisError::already_exists(key)
                }
                (TrellisError::PreconditionFailed { .. }, Precondition::MustExist) => {
                    TrellisError::not_found(key)
                }
                (other, _) => other,
            })?;

        tracing::info!(
            kind = %self.kind,
            key = %key,
            revision,
            "resource written"
        );
        Ok(revision)
    }

    /// Delete a resource. `NotFound` if it is absent from the store.
    pub async fn delete(&self, id: &str) -> TrellisResult<()> {
        self.ensure_writable()?;
        validate_key(id)?;
        let storage_key = self.storage_key(id);
        let revision = self
            .client
            .delete(&storage_key)
            .await
            .map_err(|e| match e {
                TrellisError::NotFound { .. } => TrellisError::not_found(id),
                other => other,
            })?;
        tracing::info!(kind = %self.kind, key = %id, revision, "resource deleted");
        Ok(())
    }

    /// Delete several resources in order, stopping at the first failure.
    pub async fn batch_delete<S: AsRef<str>>(&self, ids: &[S]) -> TrellisResult<()> {
        for id in ids {
            self.delete(id.as_ref()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(id: &str, create_time: i64, update_time: i64) -> Resource {
        let mut r = Resource::from_value(json!({"id": id})).unwrap();
        r.create_time = create_time;
        r.update_time = update_time;
        r
    }

    #[test]
    fn default_order_breaks_ties_by_update_time_then_id() {
        let mut rows = vec![
            resource("b", 10, 20),
            resource("a", 10, 20),
            resource("c", 10, 15),
            resource("d", 5, 50),
        ];
        rows.sort_by(default_order);
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "a", "b"]);
    }
}
