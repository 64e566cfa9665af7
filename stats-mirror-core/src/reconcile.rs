//! Diffing a freshly fetched child set against the locally stored one.
//!
//! The result only depends on the two inputs, so running it twice against an
//! unchanged store yields nothing to upsert the second time.

use std::collections::HashMap;
use std::hash::Hash;

use crate::model::{Node, Observation, ObservationKey};

/// Records that can be diffed by key and compared by content.
pub trait Reconcilable: Clone {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
    fn same_content(&self, other: &Self) -> bool;
    fn mark_deleted(&mut self);
}

impl Reconcilable for Node {
    type Key = String;

    fn key(&self) -> String {
        self.code.clone()
    }

    fn same_content(&self, other: &Self) -> bool {
        Node::same_content(self, other)
    }

    fn mark_deleted(&mut self) {
        self.is_deleted = true;
    }
}

impl Reconcilable for Observation {
    type Key = ObservationKey;

    fn key(&self) -> ObservationKey {
        Observation::key(self)
    }

    fn same_content(&self, other: &Self) -> bool {
        self.has_value == other.has_value
            && self.value.to_bits() == other.value.to_bits()
            && self.is_deleted == other.is_deleted
    }

    fn mark_deleted(&mut self) {
        self.is_deleted = true;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffSet<T> {
    pub to_upsert: Vec<T>,
    pub to_delete: Vec<T>,
}

impl<T> DiffSet<T> {
    pub fn is_empty(&self) -> bool {
        self.to_upsert.is_empty() && self.to_delete.is_empty()
    }
}

/// Computes the minimal set of writes that turns `local` into `remote`.
///
/// Each remote record lands in exactly one outcome: unchanged (dropped),
/// changed or new (upserted). Local records the remote no longer lists come
/// back marked deleted, in their local order. A key listed twice remotely
/// counts once.
pub fn reconcile<T: Reconcilable>(remote: &[T], local: Vec<T>) -> DiffSet<T> {
    let index: HashMap<T::Key, usize> = local
        .iter()
        .enumerate()
        .map(|(i, record)| (record.key(), i))
        .collect();
    let mut remaining: Vec<Option<T>> = local.into_iter().map(Some).collect();
    let mut seen = std::collections::HashSet::new();
    let mut to_upsert = Vec::new();

    for record in remote {
        let key = record.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        let known = index.get(&key).and_then(|&i| remaining[i].take());
        match known {
            Some(existing) if existing.same_content(record) => {}
            _ => to_upsert.push(record.clone()),
        }
    }

    let to_delete = remaining
        .into_iter()
        .flatten()
        .map(|mut record| {
            record.mark_deleted();
            record
        })
        .collect();

    DiffSet {
        to_upsert,
        to_delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::model::TreeKind;

    fn node(code: &str, name: &str) -> Node {
        Node::new(TreeKind::Metric, Catalog::Hgyd, code, name)
    }

    fn codes(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.code.as_str()).collect()
    }

    #[test]
    fn changed_new_and_vanished_children() {
        let local = vec![node("A", "v1"), node("B", "v1")];
        let remote = vec![node("A", "v1"), node("C", "v1")];

        let diff = reconcile(&remote, local);

        assert_eq!(codes(&diff.to_upsert), vec!["C"]);
        assert_eq!(codes(&diff.to_delete), vec!["B"]);
        assert!(diff.to_delete.iter().all(|n| n.is_deleted));
    }

    #[test]
    fn content_change_is_an_upsert() {
        let diff = reconcile(&[node("A", "v2")], vec![node("A", "v1")]);
        assert_eq!(codes(&diff.to_upsert), vec!["A"]);
        assert!(diff.to_delete.is_empty());
    }

    #[test]
    fn reapplying_the_remote_set_is_a_no_op() {
        let remote = vec![node("A", "v1"), node("B", "v2")];
        let first = reconcile(&remote, vec![node("A", "v0")]);
        assert_eq!(codes(&first.to_upsert), vec!["A", "B"]);

        let second = reconcile(&remote, remote.clone());
        assert!(second.is_empty());
    }

    #[test]
    fn a_locally_deleted_node_is_restored() {
        let mut stale = node("A", "v1");
        stale.is_deleted = true;
        let diff = reconcile(&[node("A", "v1")], vec![stale]);
        assert_eq!(codes(&diff.to_upsert), vec!["A"]);
    }

    #[test]
    fn duplicate_remote_codes_count_once() {
        let diff = reconcile(&[node("A", "v1"), node("A", "v2")], vec![]);
        assert_eq!(diff.to_upsert.len(), 1);
        assert_eq!(diff.to_upsert[0].name, "v1");
    }

    #[test]
    fn observations_compare_by_value() {
        let obs = |value: f64| Observation {
            catalog: Catalog::Hgnd,
            metric_code: "A0101".into(),
            period: 202312,
            region_code: None,
            value,
            has_value: true,
            is_deleted: false,
        };
        let diff = reconcile(&[obs(1.5)], vec![obs(1.5)]);
        assert!(diff.is_empty());
        let diff = reconcile(&[obs(2.0)], vec![obs(1.5)]);
        assert_eq!(diff.to_upsert, vec![obs(2.0)]);
    }
}
