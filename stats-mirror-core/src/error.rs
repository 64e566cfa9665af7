//! Typed errors shared by every stage of a synchronisation run.
//!
//! The taxonomy follows how each failure is handled:
//! - [`FetchError`]: transient, retried, then aborts the current catalog only.
//! - [`StoreError`]: persistence failure, never retried, aborts the sweep.
//! - [`CatalogError`] / [`ModelError`]: bad parameters, surfaced before any fetch.
//! - [`SyncError`]: what the synchronisers return, wrapping the above.

use thiserror::Error;

use crate::catalog::Catalog;

/// A remote call failed. Every variant is considered transient.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote answered {status} for {url}")]
    Status { status: u16, url: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// The local store failed to read or write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("stored record is invalid: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(e))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown catalog code `{0}`")]
    UnknownCatalog(String),

    #[error("catalog {catalog} has no region tree")]
    NoRegionTree { catalog: Catalog },

    #[error("period `{value}` is not valid for catalog {catalog}")]
    MalformedPeriod { catalog: Catalog, value: String },

    #[error("year range {from}..={to} is invalid")]
    YearRange { from: i32, to: i32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("`{field}` is not a declared extension field for {kind} nodes")]
    UndeclaredField { kind: crate::model::TreeKind, field: String },
}

/// Errors returned by the tree and observation synchronisers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching children of `{code}` in {catalog} failed: {source}")]
    Fetch {
        catalog: Catalog,
        code: String,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("node `{code}` in {catalog} lists itself or one of its ancestors as a child")]
    CyclicLink { catalog: Catalog, code: String },

    #[error("node `{code}` in {catalog} is deeper than the configured limit of {max_depth}")]
    DepthExceeded {
        catalog: Catalog,
        code: String,
        max_depth: usize,
    },
}

impl SyncError {
    /// Structural errors will recur on every attempt; resuming into them is pointless.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::CyclicLink { .. } | SyncError::DepthExceeded { .. }
        )
    }
}
