//! # contract: the seams between the synchronisers and the outside world
//!
//! The synchronisers never talk to HTTP or a database directly. They drive these
//! traits, which are implemented by the HTTP client in [`crate::remote`], the SQLite
//! store in the CLI crate, the in-memory store in [`crate::memory`], and by mocks in
//! tests.
//!
//! ## Interface & Extensibility
//! - All methods are async and `Send + Sync` so a single implementation can be
//!   shared by reference across a whole run.
//! - Not-found is an empty result, never an error. Errors are typed:
//!   [`FetchError`] for remote calls, [`StoreError`] for persistence.
//!
//! ## Mocking & Testing
//! - The remote traits and [`CheckpointStore`] are annotated for `mockall`
//!   (exported with the `test-export-mocks` feature).
//! - Repository behaviour is exercised against [`crate::memory::MemoryStore`],
//!   which honours the same upsert and soft-delete rules as the SQLite store.
//!
//! ## Write semantics every repository must honour
//! - `upsert` inserts new records, rewrites changed ones and clears a previous
//!   soft delete; records with identical content are left alone and not counted.
//! - `soft_delete` flags live records as deleted; records already deleted are
//!   left alone and not counted.
//! - Each call is applied as one batch.

use async_trait::async_trait;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::catalog::Catalog;
use crate::error::{FetchError, StoreError};
use crate::model::{Node, Observation, TreeKind};

/// Source of catalog nodes.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Direct children of `parent_code` in remote order. An empty `parent_code`
    /// asks for the top level of the catalog.
    async fn fetch_children(
        &self,
        kind: TreeKind,
        catalog: Catalog,
        parent_code: &str,
    ) -> Result<Vec<Node>, FetchError>;
}

/// One observation download: a metric (or a metric group) over a set of periods.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationQuery {
    pub catalog: Catalog,
    pub metric_code: String,
    /// `yyyyMM` periods.
    pub periods: Vec<u32>,
    /// Break the metric down by region instead of by sub-metric.
    pub region_rows: bool,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObservationFetcher: Send + Sync {
    async fn fetch_observations(
        &self,
        query: &ObservationQuery,
    ) -> Result<Vec<Observation>, FetchError>;
}

/// Local persistence of catalog nodes, keyed by `(kind, catalog, code)`.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Live children of `parent_code` (top level when `None`), ordered by position.
    async fn list_children(
        &self,
        kind: TreeKind,
        catalog: Catalog,
        parent_code: Option<&str>,
    ) -> Result<Vec<Node>, StoreError>;

    /// Every live node of one catalog tree.
    async fn list_tree(&self, kind: TreeKind, catalog: Catalog) -> Result<Vec<Node>, StoreError>;

    /// Returns the number of records written.
    async fn upsert(&self, nodes: &[Node]) -> Result<u64, StoreError>;

    /// Returns the number of records newly flagged as deleted.
    async fn soft_delete(&self, nodes: &[Node]) -> Result<u64, StoreError>;
}

/// Local persistence of observations, keyed by `(catalog, metric, period, region)`.
#[async_trait]
pub trait ObservationRepository: Send + Sync {
    /// Live observations of the given metrics within the given periods.
    async fn list_observations(
        &self,
        catalog: Catalog,
        metric_codes: &[String],
        periods: &[u32],
    ) -> Result<Vec<Observation>, StoreError>;

    async fn upsert_observations(&self, observations: &[Observation]) -> Result<u64, StoreError>;

    async fn soft_delete_observations(
        &self,
        observations: &[Observation],
    ) -> Result<u64, StoreError>;
}

/// Opaque, keyed blob storage for checkpoints.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, blob: &str) -> Result<(), StoreError>;
}
