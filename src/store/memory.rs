// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory object store.

use super::{Count, ObjectStore, ScanItem, ScanRange, StoreFuture};
use crate::error::ReplicaError;
use crate::object::{Identity, Object, UpdateType};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

type Namespace = BTreeMap<Vec<u8>, Object>;

/// Ordered in-memory store, one map per namespace.
pub struct MemoryStore {
    identity: Identity,
    data: RwLock<HashMap<String, Namespace>>,
}

impl MemoryStore {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Number of objects (tombstones included) in a namespace.
    pub async fn len(&self, namespace: &str) -> usize {
        self.data.read().await.get(namespace).map_or(0, |ns| ns.len())
    }

    pub async fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace).await == 0
    }

    /// Insert an object as-is, bypassing version checks. Useful for fixtures.
    pub async fn insert(&self, object: Object) {
        let mut data = self.data.write().await;
        data.entry(object.namespace.clone())
            .or_default()
            .insert(object.key.clone(), object);
    }
}

impl ObjectStore for MemoryStore {
    fn get<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let obj = self.object(namespace, key).await?;
            if obj.tombstone {
                return Err(ReplicaError::NotFound(namespace.to_string()));
            }
            Ok(obj.value)
        })
    }

    fn put<'a>(&'a self, namespace: &'a str, key: &'a [u8], value: Vec<u8>) -> StoreFuture<'a, Object> {
        Box::pin(async move {
            let mut data = self.data.write().await;
            let ns = data.entry(namespace.to_string()).or_default();
            let obj = self.identity.stamp(namespace, key, value, ns.get(key), false);
            ns.insert(key.to_vec(), obj.clone());
            Ok(obj)
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Object> {
        Box::pin(async move {
            let mut data = self.data.write().await;
            let ns = data
                .get_mut(namespace)
                .ok_or_else(|| ReplicaError::NotFound(namespace.to_string()))?;

            let prev = match ns.get(key) {
                Some(prev) if !prev.tombstone => prev,
                _ => return Err(ReplicaError::NotFound(namespace.to_string())),
            };

            let obj = self.identity.stamp(namespace, key, Vec::new(), Some(prev), true);
            ns.insert(key.to_vec(), obj.clone());
            Ok(obj)
        })
    }

    fn object<'a>(&'a self, namespace: &'a str, key: &'a [u8]) -> StoreFuture<'a, Object> {
        Box::pin(async move {
            self.data
                .read()
                .await
                .get(namespace)
                .and_then(|ns| ns.get(key))
                .cloned()
                .ok_or_else(|| ReplicaError::NotFound(namespace.to_string()))
        })
    }

    fn update(&self, object: Object) -> StoreFuture<'_, UpdateType> {
        Box::pin(async move {
            let mut data = self.data.write().await;
            let ns = data.entry(object.namespace.clone()).or_default();

            let update = UpdateType::resolve(ns.get(&object.key).map(|o| &o.version), &object.version);
            if update.applied() {
                ns.insert(object.key.clone(), object);
            }
            Ok(update)
        })
    }

    fn scan<'a>(&'a self, namespace: &'a str, range: ScanRange) -> StoreFuture<'a, Vec<ScanItem>> {
        Box::pin(async move {
            let data = self.data.read().await;
            let Some(ns) = data.get(namespace) else {
                return Ok(Vec::new());
            };

            let lower = match &range.start {
                Some(start) if start.as_slice() > range.prefix.as_slice() => start.clone(),
                _ => range.prefix.clone(),
            };

            let limit = if range.limit == 0 { usize::MAX } else { range.limit };
            let objects = ns
                .range(lower..)
                .take_while(|(k, _)| k.starts_with(&range.prefix))
                .filter(|(_, o)| range.tombstones || !o.tombstone)
                .take(limit)
                .map(|(_, o)| Ok(o.clone()))
                .collect();
            Ok(objects)
        })
    }

    fn count<'a>(&'a self, namespace: &'a str, prefix: &'a [u8]) -> StoreFuture<'a, Count> {
        Box::pin(async move {
            let mut count = Count::default();
            if let Some(ns) = self.data.read().await.get(namespace) {
                for (key, obj) in ns.range(prefix.to_vec()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if obj.tombstone {
                        continue;
                    }
                    count.objects += 1;
                    count.key_bytes += key.len() as u64;
                    count.value_bytes += obj.value.len() as u64;
                }
            }
            Ok(count)
        })
    }
}
