//! In-memory implementation of every storage contract.
//!
//! Follows the same write rules as the SQLite store (unchanged rows are not
//! rewritten, deletes are soft and idempotent), which makes it a faithful
//! stand-in for dry runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::catalog::Catalog;
use crate::contract::{CheckpointStore, ObservationRepository, Repository};
use crate::error::StoreError;
use crate::model::{Node, Observation, ObservationKey, TreeKind};

type NodeKey = (TreeKind, Catalog, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: Mutex<BTreeMap<NodeKey, Node>>,
    observations: Mutex<BTreeMap<ObservationKey, Observation>>,
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Every stored node of a tree, deleted ones included.
    pub fn snapshot(&self, kind: TreeKind, catalog: Catalog) -> Vec<Node> {
        lock(&self.nodes)
            .map(|nodes| {
                nodes
                    .values()
                    .filter(|n| n.kind == kind && n.catalog == catalog)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn node(&self, kind: TreeKind, catalog: Catalog, code: &str) -> Option<Node> {
        lock(&self.nodes)
            .ok()?
            .get(&(kind, catalog, code.to_string()))
            .cloned()
    }

    pub fn observations(&self) -> Vec<Observation> {
        lock(&self.observations)
            .map(|obs| obs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn blob(&self, key: &str) -> Option<String> {
        lock(&self.blobs).ok()?.get(key).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Corrupt("in-memory store lock poisoned".into()))
}

#[async_trait]
impl Repository for MemoryStore {
    async fn list_children(
        &self,
        kind: TreeKind,
        catalog: Catalog,
        parent_code: Option<&str>,
    ) -> Result<Vec<Node>, StoreError> {
        let mut children: Vec<Node> = lock(&self.nodes)?
            .values()
            .filter(|n| {
                n.kind == kind
                    && n.catalog == catalog
                    && !n.is_deleted
                    && n.parent_code.as_deref() == parent_code
            })
            .cloned()
            .collect();
        children.sort_by(|a, b| (a.position, &a.code).cmp(&(b.position, &b.code)));
        Ok(children)
    }

    async fn list_tree(&self, kind: TreeKind, catalog: Catalog) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .snapshot(kind, catalog)
            .into_iter()
            .filter(|n| !n.is_deleted)
            .collect())
    }

    async fn upsert(&self, nodes: &[Node]) -> Result<u64, StoreError> {
        let mut stored = lock(&self.nodes)?;
        let mut written = 0;
        for node in nodes {
            let key = (node.kind, node.catalog, node.code.clone());
            let mut fresh = node.clone();
            fresh.is_deleted = false;
            match stored.get(&key) {
                Some(existing) if existing.same_content(&fresh) => {}
                _ => {
                    stored.insert(key, fresh);
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn soft_delete(&self, nodes: &[Node]) -> Result<u64, StoreError> {
        let mut stored = lock(&self.nodes)?;
        let mut deleted = 0;
        for node in nodes {
            if let Some(existing) = stored.get_mut(&(node.kind, node.catalog, node.code.clone())) {
                if !existing.is_deleted {
                    existing.is_deleted = true;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ObservationRepository for MemoryStore {
    async fn list_observations(
        &self,
        catalog: Catalog,
        metric_codes: &[String],
        periods: &[u32],
    ) -> Result<Vec<Observation>, StoreError> {
        Ok(lock(&self.observations)?
            .values()
            .filter(|o| {
                o.catalog == catalog
                    && !o.is_deleted
                    && metric_codes.contains(&o.metric_code)
                    && periods.contains(&o.period)
            })
            .cloned()
            .collect())
    }

    async fn upsert_observations(&self, observations: &[Observation]) -> Result<u64, StoreError> {
        let mut stored = lock(&self.observations)?;
        let mut written = 0;
        for observation in observations {
            let mut fresh = observation.clone();
            fresh.is_deleted = false;
            let unchanged = stored.get(&fresh.key()).is_some_and(|existing| {
                existing.has_value == fresh.has_value
                    && existing.value.to_bits() == fresh.value.to_bits()
                    && !existing.is_deleted
            });
            if !unchanged {
                stored.insert(fresh.key(), fresh);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn soft_delete_observations(
        &self,
        observations: &[Observation],
    ) -> Result<u64, StoreError> {
        let mut stored = lock(&self.observations)?;
        let mut deleted = 0;
        for observation in observations {
            if let Some(existing) = stored.get_mut(&observation.key()) {
                if !existing.is_deleted {
                    existing.is_deleted = true;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.blobs)?.get(key).cloned())
    }

    async fn put(&self, key: &str, blob: &str) -> Result<(), StoreError> {
        lock(&self.blobs)?.insert(key.to_string(), blob.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(code: &str, parent: Option<&str>, position: u32) -> Node {
        let mut node = Node::new(TreeKind::Region, Catalog::Fsnd, code, code).with_parent(parent);
        node.position = position;
        node
    }

    #[tokio::test]
    async fn upsert_skips_unchanged_rows() {
        let store = MemoryStore::new();
        let nodes = vec![region("110000", None, 0), region("120000", None, 1)];
        assert_eq!(store.upsert(&nodes).await.unwrap(), 2);
        assert_eq!(store.upsert(&nodes).await.unwrap(), 0);

        let mut renamed = nodes[0].clone();
        renamed.name = "Beijing".into();
        assert_eq!(store.upsert(&[renamed]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent_and_reversible() {
        let store = MemoryStore::new();
        let node = region("110000", None, 0);
        store.upsert(&[node.clone()]).await.unwrap();

        assert_eq!(store.soft_delete(&[node.clone()]).await.unwrap(), 1);
        assert_eq!(store.soft_delete(&[node.clone()]).await.unwrap(), 0);
        assert!(store
            .list_children(TreeKind::Region, Catalog::Fsnd, None)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.upsert(&[node]).await.unwrap(), 1);
        let restored = store
            .node(TreeKind::Region, Catalog::Fsnd, "110000")
            .unwrap();
        assert!(!restored.is_deleted);
    }

    #[tokio::test]
    async fn children_come_back_in_position_order() {
        let store = MemoryStore::new();
        store
            .upsert(&[
                region("110100", Some("110000"), 1),
                region("110101", Some("110000"), 0),
                region("110000", None, 0),
            ])
            .await
            .unwrap();
        let codes: Vec<_> = store
            .list_children(TreeKind::Region, Catalog::Fsnd, Some("110000"))
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.code)
            .collect();
        assert_eq!(codes, vec!["110101", "110100"]);
    }
}
