//! Catalog entries (metric and region nodes), observations, and the arena that
//! resolves parent/child relations by code.
//!
//! Remote and local views use the same [`Node`] type so the reconciler can compare
//! them field by field. A node refers to its parent by code only; children are
//! looked up through [`CatalogTree`] instead of being owned by the parent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::ModelError;

/// Which hierarchy of a catalog a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    Metric,
    Region,
}

impl TreeKind {
    /// Dimension code used by the remote API.
    pub fn wire_code(&self) -> &'static str {
        match self {
            TreeKind::Metric => "zb",
            TreeKind::Region => "reg",
        }
    }

    pub fn checkpoint_key(&self) -> &'static str {
        match self {
            TreeKind::Metric => "metric_code_download",
            TreeKind::Region => "region_code_download",
        }
    }

    /// Extension attributes a node of this kind may carry besides its typed fields.
    pub fn extension_fields(&self) -> &'static [&'static str] {
        match self {
            TreeKind::Metric => &["english_explanation", "english_memo", "english_unit"],
            TreeKind::Region => &["english_explanation"],
        }
    }

    /// Catalogs that carry a tree of this kind.
    pub fn catalogs(&self) -> Vec<Catalog> {
        match self {
            TreeKind::Metric => Catalog::ALL.to_vec(),
            TreeKind::Region => Catalog::regional().collect(),
        }
    }
}

impl fmt::Display for TreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeKind::Metric => f.write_str("metric"),
            TreeKind::Region => f.write_str("region"),
        }
    }
}

/// One metric or region entry.
///
/// Identity is `(catalog, code)`; `==` compares identity only. Use
/// [`Node::same_content`] to compare the observable fields.
#[derive(Debug, Clone)]
pub struct Node {
    pub catalog: Catalog,
    pub kind: TreeKind,
    pub code: String,
    pub parent_code: Option<String>,
    /// Index among its siblings in the order the remote listed them.
    pub position: u32,
    pub name: String,
    pub english_name: Option<String>,
    pub explanation: Option<String>,
    pub memo: Option<String>,
    pub unit: Option<String>,
    extra: BTreeMap<String, serde_json::Value>,
    /// Whether the node is expected to have children worth fetching.
    pub is_parent: bool,
    pub is_deleted: bool,
}

impl Node {
    pub fn new(
        kind: TreeKind,
        catalog: Catalog,
        code: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Node {
            catalog,
            kind,
            code: code.into(),
            parent_code: None,
            position: 0,
            name: name.into(),
            english_name: None,
            explanation: None,
            memo: None,
            unit: None,
            extra: BTreeMap::new(),
            is_parent: false,
            is_deleted: false,
        }
    }

    /// The synthetic node a sweep starts from: either the catalog root (empty code)
    /// or the requested subtree root.
    pub fn scope_root(kind: TreeKind, catalog: Catalog, root_code: Option<&str>) -> Self {
        let mut node = Node::new(kind, catalog, root_code.unwrap_or_default(), "");
        node.is_parent = true;
        node
    }

    pub fn is_catalog_root(&self) -> bool {
        self.code.is_empty()
    }

    /// Parent code that children of this node carry.
    pub fn code_as_parent(&self) -> Option<&str> {
        (!self.is_catalog_root()).then_some(self.code.as_str())
    }

    pub fn with_parent(mut self, parent_code: Option<&str>) -> Self {
        self.parent_code = parent_code.map(str::to_string);
        self
    }

    pub fn extra(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extra
    }

    /// Sets an extension attribute; only fields declared for the node's kind are accepted.
    pub fn set_extra(
        &mut self,
        field: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<(), ModelError> {
        if !self.kind.extension_fields().contains(&field) {
            return Err(ModelError::UndeclaredField {
                kind: self.kind,
                field: field.to_string(),
            });
        }
        self.extra.insert(field.to_string(), value.into());
        Ok(())
    }

    /// Structural equality over everything a reader of the store can observe.
    /// Timestamps live in the store only and never take part.
    pub fn same_content(&self, other: &Node) -> bool {
        self.parent_code == other.parent_code
            && self.position == other.position
            && self.name == other.name
            && self.english_name == other.english_name
            && self.explanation == other.explanation
            && self.memo == other.memo
            && self.unit == other.unit
            && self.extra == other.extra
            && self.is_parent == other.is_parent
            && self.is_deleted == other.is_deleted
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.catalog == other.catalog && self.code == other.code
    }
}

impl Eq for Node {}

/// One data point of a metric for a period, optionally broken down by region.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub catalog: Catalog,
    pub metric_code: String,
    /// `yyyyMM`
    pub period: u32,
    pub region_code: Option<String>,
    pub value: f64,
    pub has_value: bool,
    pub is_deleted: bool,
}

pub type ObservationKey = (Catalog, String, u32, String);

impl Observation {
    pub fn key(&self) -> ObservationKey {
        (
            self.catalog,
            self.metric_code.clone(),
            self.period,
            self.region_code.clone().unwrap_or_default(),
        )
    }
}

/// Arena over the live nodes of one catalog tree.
#[derive(Debug, Default)]
pub struct CatalogTree {
    nodes: HashMap<String, Node>,
    children: HashMap<Option<String>, Vec<String>>,
}

impl CatalogTree {
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut tree = CatalogTree::default();
        for node in nodes.into_iter().filter(|n| !n.is_deleted) {
            tree.nodes.insert(node.code.clone(), node);
        }
        for node in tree.nodes.values() {
            tree.children
                .entry(node.parent_code.clone())
                .or_default()
                .push(node.code.clone());
        }
        let nodes = &tree.nodes;
        for codes in tree.children.values_mut() {
            codes.sort_by_key(|c| (nodes[c].position, c.clone()));
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&Node> {
        self.nodes.get(code)
    }

    pub fn roots(&self) -> Vec<&Node> {
        self.resolve(self.children.get(&None))
    }

    /// `None` when the code is unknown, `Some(empty)` for a known leaf.
    pub fn children(&self, code: &str) -> Option<Vec<&Node>> {
        self.nodes.get(code)?;
        Some(self.resolve(self.children.get(&Some(code.to_string()))))
    }

    pub fn parent(&self, code: &str) -> Option<&Node> {
        let parent = self.nodes.get(code)?.parent_code.as_deref()?;
        self.nodes.get(parent)
    }

    /// Leaves reachable from `code`, in depth-first sibling order. A leaf root
    /// yields itself. Links that loop back are followed once.
    pub fn leaves_under(&self, code: &str) -> Vec<&Node> {
        let mut leaves = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![code];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(children) = self.children(current) else {
                continue;
            };
            if children.is_empty() {
                if let Some(node) = self.nodes.get(current) {
                    leaves.push(node);
                }
                continue;
            }
            stack.extend(children.iter().rev().map(|c| c.code.as_str()));
        }
        leaves
    }

    fn resolve(&self, codes: Option<&Vec<String>>) -> Vec<&Node> {
        codes
            .map(|codes| codes.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(code: &str, parent: Option<&str>, position: u32) -> Node {
        let mut node = Node::new(TreeKind::Metric, Catalog::Hgnd, code, code).with_parent(parent);
        node.position = position;
        node
    }

    #[test]
    fn identity_ignores_content() {
        let a = metric("A01", None, 0);
        let mut b = metric("A01", None, 3);
        b.name = "renamed".into();
        assert_eq!(a, b);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn extension_fields_are_checked_per_kind() {
        let mut m = metric("A01", None, 0);
        assert!(m.set_extra("english_unit", "yuan").is_ok());

        let mut r = Node::new(TreeKind::Region, Catalog::Fsnd, "110000", "Beijing");
        assert_eq!(
            r.set_extra("english_unit", "yuan"),
            Err(ModelError::UndeclaredField {
                kind: TreeKind::Region,
                field: "english_unit".into()
            })
        );
        assert!(r.extra().is_empty());
    }

    #[test]
    fn tree_distinguishes_unknown_from_leaf() {
        let tree = CatalogTree::from_nodes(vec![
            metric("A", None, 0),
            metric("A02", Some("A"), 1),
            metric("A01", Some("A"), 0),
        ]);
        assert!(tree.children("missing").is_none());
        assert_eq!(tree.children("A01").map(|c| c.len()), Some(0));
        let codes: Vec<_> = tree
            .children("A")
            .unwrap_or_default()
            .iter()
            .map(|n| n.code.as_str())
            .collect();
        assert_eq!(codes, vec!["A01", "A02"]);
        assert_eq!(tree.parent("A02").map(|n| n.code.as_str()), Some("A"));
    }

    #[test]
    fn deleted_nodes_are_not_part_of_the_tree() {
        let mut gone = metric("A02", Some("A"), 1);
        gone.is_deleted = true;
        let tree = CatalogTree::from_nodes(vec![metric("A", None, 0), gone]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.children("A").map(|c| c.len()), Some(0));
    }

    #[test]
    fn leaves_are_collected_depth_first() {
        let tree = CatalogTree::from_nodes(vec![
            metric("A", None, 0),
            metric("A01", Some("A"), 0),
            metric("A0101", Some("A01"), 0),
            metric("A0102", Some("A01"), 1),
            metric("A02", Some("A"), 1),
        ]);
        let leaves: Vec<_> = tree.leaves_under("A").iter().map(|n| n.code.clone()).collect();
        assert_eq!(leaves, vec!["A0101", "A0102", "A02"]);
        assert_eq!(tree.leaves_under("A02").len(), 1);
        assert!(tree.leaves_under("nope").is_empty());
    }
}
