//! SQLite store integration tests.
//!
//! Runs the store against in-memory and file-backed databases and checks the
//! write semantics the synchronisers rely on: written/deleted counts, soft
//! deletes, revival, checkpoint blobs, and a full sweep run twice.

use std::collections::HashMap;

use stats_mirror::store::SqliteStore;
use stats_mirror_core::catalog::Catalog;
use stats_mirror_core::config::SyncSettings;
use stats_mirror_core::contract::{
    CheckpointStore, MockRemoteFetcher, ObservationRepository, Repository,
};
use stats_mirror_core::model::{Node, Observation, TreeKind};
use stats_mirror_core::synchronise::{synchronise_tree, CatalogOutcome, TreeSyncRequest};
use tempfile::TempDir;

async fn memory_store() -> SqliteStore {
    SqliteStore::connect("sqlite::memory:")
        .await
        .expect("in-memory database")
}

fn metric(code: &str, parent: Option<&str>, position: u32) -> Node {
    let mut node = Node::new(TreeKind::Metric, Catalog::Hgnd, code, format!("metric {code}"))
        .with_parent(parent);
    node.position = position;
    node.is_parent = code.len() <= 9;
    node
}

fn observation(metric_code: &str, period: u32, region: Option<&str>, value: f64) -> Observation {
    Observation {
        catalog: Catalog::Fsnd,
        metric_code: metric_code.to_string(),
        period,
        region_code: region.map(str::to_string),
        value,
        has_value: true,
        is_deleted: false,
    }
}

#[tokio::test]
async fn upsert_counts_only_real_writes() {
    let store = memory_store().await;
    let nodes = vec![metric("A01", None, 0), metric("A02", None, 1)];

    assert_eq!(store.upsert(&nodes).await.unwrap(), 2);
    assert_eq!(store.upsert(&nodes).await.unwrap(), 0);

    let mut renamed = nodes[1].clone();
    renamed.name = "renamed".into();
    assert_eq!(store.upsert(&[nodes[0].clone(), renamed]).await.unwrap(), 1);

    let top = store
        .list_children(TreeKind::Metric, Catalog::Hgnd, None)
        .await
        .unwrap();
    let names: Vec<_> = top.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["metric A01", "renamed"]);
}

#[tokio::test]
async fn children_are_listed_by_parent_in_position_order() {
    let store = memory_store().await;
    store
        .upsert(&[
            metric("A01", None, 0),
            metric("A0102", Some("A01"), 1),
            metric("A0101", Some("A01"), 0),
            metric("B01", None, 1),
        ])
        .await
        .unwrap();

    let children = store
        .list_children(TreeKind::Metric, Catalog::Hgnd, Some("A01"))
        .await
        .unwrap();
    let codes: Vec<_> = children.iter().map(|n| n.code.as_str()).collect();
    assert_eq!(codes, vec!["A0101", "A0102"]);
    assert_eq!(children[0].parent_code.as_deref(), Some("A01"));

    let other_catalog = store
        .list_tree(TreeKind::Metric, Catalog::Hgyd)
        .await
        .unwrap();
    assert!(other_catalog.is_empty());
    let regions = store
        .list_tree(TreeKind::Region, Catalog::Hgnd)
        .await
        .unwrap();
    assert!(regions.is_empty());
}

#[tokio::test]
async fn soft_delete_hides_and_upsert_revives() {
    let store = memory_store().await;
    let nodes = vec![metric("A01", None, 0), metric("A02", None, 1)];
    store.upsert(&nodes).await.unwrap();

    assert_eq!(store.soft_delete(&nodes[1..]).await.unwrap(), 1);
    assert_eq!(store.soft_delete(&nodes[1..]).await.unwrap(), 0);
    let live = store.list_tree(TreeKind::Metric, Catalog::Hgnd).await.unwrap();
    assert_eq!(live.len(), 1);

    assert_eq!(store.upsert(&nodes[1..]).await.unwrap(), 1);
    let live = store.list_tree(TreeKind::Metric, Catalog::Hgnd).await.unwrap();
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|n| !n.is_deleted));
}

#[tokio::test]
async fn extension_attributes_survive_a_round_trip() {
    let store = memory_store().await;
    let mut node = metric("A01", None, 0);
    node.english_name = Some("Population".into());
    node.unit = Some("10k persons".into());
    node.set_extra("english_unit", "10,000 persons").unwrap();
    store.upsert(&[node.clone()]).await.unwrap();

    let stored = store
        .list_children(TreeKind::Metric, Catalog::Hgnd, None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].same_content(&node));
    assert_eq!(
        stored[0].extra().get("english_unit"),
        Some(&serde_json::json!("10,000 persons"))
    );
}

#[tokio::test]
async fn observations_filter_by_metric_and_period() {
    let store = memory_store().await;
    let rows = vec![
        observation("A01", 202112, Some("110000"), 1.0),
        observation("A01", 202212, Some("110000"), 2.0),
        observation("A02", 202212, None, 3.0),
        observation("A03", 202212, None, 4.0),
    ];
    assert_eq!(store.upsert_observations(&rows).await.unwrap(), 4);
    assert_eq!(store.upsert_observations(&rows).await.unwrap(), 0);

    let listed = store
        .list_observations(
            Catalog::Fsnd,
            &["A01".to_string(), "A02".to_string()],
            &[202212],
        )
        .await
        .unwrap();
    assert_eq!(listed, vec![rows[1].clone(), rows[2].clone()]);

    assert_eq!(store.soft_delete_observations(&rows[2..3]).await.unwrap(), 1);
    let listed = store
        .list_observations(Catalog::Fsnd, &["A02".to_string()], &[202212])
        .await
        .unwrap();
    assert!(listed.is_empty());

    let empty = store
        .list_observations(Catalog::Fsnd, &[], &[202212])
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn checkpoint_blobs_are_overwritten_in_place() {
    let store = memory_store().await;
    assert_eq!(store.get("metric_code_download").await.unwrap(), None);

    store.put("metric_code_download", "{\"a\":1}").await.unwrap();
    store.put("metric_code_download", "{\"a\":2}").await.unwrap();
    store.put("region_code_download", "{}").await.unwrap();

    assert_eq!(
        store.get("metric_code_download").await.unwrap().as_deref(),
        Some("{\"a\":2}")
    );
    assert_eq!(
        store.get("region_code_download").await.unwrap().as_deref(),
        Some("{}")
    );
}

#[tokio::test]
async fn file_backed_store_persists_between_connections() {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("mirror.db").display());

    {
        let store = SqliteStore::connect(&url).await.expect("create database");
        store.upsert(&[metric("A01", None, 0)]).await.unwrap();
        store.put("metric_code_download", "{}").await.unwrap();
    }

    let reopened = SqliteStore::connect(&url).await.expect("reopen database");
    let nodes = reopened
        .list_tree(TreeKind::Metric, Catalog::Hgnd)
        .await
        .unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(
        reopened.get("metric_code_download").await.unwrap().as_deref(),
        Some("{}")
    );
}

fn fetcher_serving(tree: HashMap<&'static str, Vec<Node>>) -> MockRemoteFetcher {
    let mut fetcher = MockRemoteFetcher::new();
    fetcher
        .expect_fetch_children()
        .returning(move |_kind, _catalog, parent: &str| {
            Ok(tree.get(parent).cloned().unwrap_or_default())
        });
    fetcher
}

#[tokio::test]
async fn second_sweep_over_sqlite_writes_nothing() {
    let store = memory_store().await;
    let tree = HashMap::from([
        ("", vec![metric("A01", None, 0), metric("A02", None, 1)]),
        (
            "A01",
            vec![metric("A0101", Some("A01"), 0), metric("A0102", Some("A01"), 1)],
        ),
    ]);
    let request = TreeSyncRequest {
        kind: TreeKind::Metric,
        catalog: Some(Catalog::Hgnd),
        root_code: None,
    };

    let first = synchronise_tree(
        &request,
        &fetcher_serving(tree.clone()),
        &store,
        &store,
        &SyncSettings::immediate(),
    )
    .await
    .expect("first sweep");
    assert!(first.finished);
    assert_eq!(first.upserted(), 4);
    assert_eq!(first.catalogs[0].outcome, CatalogOutcome::Completed);

    let second = synchronise_tree(
        &request,
        &fetcher_serving(tree),
        &store,
        &store,
        &SyncSettings::immediate(),
    )
    .await
    .expect("second sweep");
    assert!(second.finished);
    assert_eq!(second.upserted(), 0);
    assert_eq!(second.deleted(), 0);

    let checkpoint: serde_json::Value = serde_json::from_str(
        &store
            .get("metric_code_download")
            .await
            .unwrap()
            .expect("checkpoint written"),
    )
    .unwrap();
    assert_eq!(checkpoint["status"], "Done");
}
