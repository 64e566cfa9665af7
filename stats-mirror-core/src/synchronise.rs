//! Tree sweep: mirrors one remote catalog tree into the local repository.
//!
//! A sweep walks every catalog in scope depth-first, one node at a time:
//!   - fetches the node's direct children from the [`RemoteFetcher`]
//!   - lists the children the [`Repository`] already knows
//!   - reconciles the two and persists the diff (upserts, then soft deletes)
//!   - records the node's path in the [`Checkpoint`] and persists it
//!   - recurses into every child flagged as a parent, in remote order
//!
//! # Resuming
//! The checkpoint names the last node whose diff was written. A new run skips
//! the catalogs and subtrees before it, walks down to it through the
//! repository (no remote calls for levels already reconciled), and continues
//! with the first node after it. If the stored position cannot be found the
//! catalog is swept again from its root.
//!
//! # Error Handling
//! - A fetch that still fails after retries aborts that catalog. Later catalogs
//!   still run, but checkpoint writes stop so the next run resumes at the
//!   failed catalog.
//! - A repository or checkpoint store error aborts the sweep immediately.
//! - A node listing itself or an ancestor, or a path deeper than
//!   `max_depth`, aborts the sweep and marks the checkpoint failed.
//!
//! # Navigation
//! - Main entrypoint: [`synchronise_tree`]
//! - Supporting types: [`TreeSyncRequest`], [`SweepReport`], [`CatalogReport`].

use std::collections::HashSet;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::checkpoint::{Checkpoint, PathPosition};
use crate::config::SyncSettings;
use crate::contract::{CheckpointStore, RemoteFetcher, Repository};
use crate::error::{CatalogError, StoreError, SyncError};
use crate::model::{Node, TreeKind};
use crate::reconcile::reconcile;
use crate::retry::with_retry;

/// What to sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSyncRequest {
    pub kind: TreeKind,
    /// Restrict the sweep to one catalog.
    pub catalog: Option<Catalog>,
    /// Restrict the sweep to the subtree under this code.
    pub root_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOutcome {
    Completed,
    /// Finished by an earlier run.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogReport {
    pub catalog: Catalog,
    pub outcome: CatalogOutcome,
    /// Nodes whose children were fetched and reconciled.
    pub visited: usize,
    /// Nodes walked through from the repository while resuming.
    pub replayed: usize,
    pub upserted: u64,
    pub deleted: u64,
}

impl CatalogReport {
    fn new(catalog: Catalog, outcome: CatalogOutcome) -> Self {
        CatalogReport {
            catalog,
            outcome,
            visited: 0,
            replayed: 0,
            upserted: 0,
            deleted: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, CatalogOutcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub run_id: Uuid,
    pub kind: TreeKind,
    pub catalogs: Vec<CatalogReport>,
    /// Every catalog in scope completed and the checkpoint was closed.
    pub finished: bool,
}

impl SweepReport {
    pub fn failed(&self) -> impl Iterator<Item = &CatalogReport> {
        self.catalogs.iter().filter(|c| c.is_failed())
    }

    pub fn upserted(&self) -> u64 {
        self.catalogs.iter().map(|c| c.upserted).sum()
    }

    pub fn deleted(&self) -> u64 {
        self.catalogs.iter().map(|c| c.deleted).sum()
    }
}

/// Catalogs a sweep of `kind` covers, narrowed by `filter`.
pub fn scope_catalogs(kind: TreeKind, filter: Option<Catalog>) -> Result<Vec<Catalog>, CatalogError> {
    match filter {
        Some(catalog) if kind == TreeKind::Region && !catalog.is_regional() => {
            Err(CatalogError::NoRegionTree { catalog })
        }
        Some(catalog) => Ok(vec![catalog]),
        None => Ok(kind.catalogs()),
    }
}

/// Runs one sweep over the requested scope, resuming from the stored checkpoint
/// when the previous sweep over the same scope did not finish.
pub async fn synchronise_tree<F, R, C>(
    request: &TreeSyncRequest,
    fetcher: &F,
    repository: &R,
    checkpoints: &C,
    settings: &SyncSettings,
) -> Result<SweepReport, SyncError>
where
    F: RemoteFetcher,
    R: Repository,
    C: CheckpointStore,
{
    let run_id = Uuid::new_v4();
    let span = info_span!("tree_sync", %run_id, kind = %request.kind);
    run_sweep(run_id, request, fetcher, repository, checkpoints, settings)
        .instrument(span)
        .await
}

async fn run_sweep<F, R, C>(
    run_id: Uuid,
    request: &TreeSyncRequest,
    fetcher: &F,
    repository: &R,
    checkpoints: &C,
    settings: &SyncSettings,
) -> Result<SweepReport, SyncError>
where
    F: RemoteFetcher,
    R: Repository,
    C: CheckpointStore,
{
    let catalogs = scope_catalogs(request.kind, request.catalog)?;
    let root_code = request.root_code.as_deref().filter(|r| !r.is_empty());

    let stored = checkpoints.get(request.kind.checkpoint_key()).await?;
    let mut checkpoint = Checkpoint::from_blob(stored.as_deref());
    checkpoint.reset_if_parameters_changed(request.catalog, root_code);
    checkpoint.retain_catalog_cursor_in(&catalogs);
    info!(
        catalogs = catalogs.len(),
        root_code = root_code.unwrap_or_default(),
        catalog_cursor = ?checkpoint.catalog_cursor,
        path_cursor = ?checkpoint.path_cursor,
        "[TREE] Starting sweep"
    );

    let mut sweep = Sweep {
        kind: request.kind,
        fetcher,
        repository,
        checkpoints,
        settings,
        checkpoint,
        frozen: false,
        stats: None,
    };
    let mut reports = Vec::with_capacity(catalogs.len());

    for catalog in catalogs {
        if sweep.checkpoint.need_skip_catalog(catalog) {
            debug!(%catalog, "[TREE] Catalog finished by an earlier run, skipping");
            reports.push(CatalogReport::new(catalog, CatalogOutcome::Skipped));
            continue;
        }
        sweep.persist().await?;

        match sweep.sweep_catalog(catalog, root_code).await {
            Ok(report) => {
                info!(
                    %catalog,
                    visited = report.visited,
                    replayed = report.replayed,
                    upserted = report.upserted,
                    deleted = report.deleted,
                    "[TREE] Catalog complete"
                );
                reports.push(report);
            }
            Err(e @ SyncError::Fetch { .. }) => {
                error!(%catalog, error = %e, "[TREE][ERROR] Catalog aborted, continuing with the next one");
                sweep.frozen = true;
                let mut report = sweep.take_stats(catalog);
                report.outcome = CatalogOutcome::Failed(e.to_string());
                reports.push(report);
            }
            Err(e) if e.is_structural() => {
                error!(%catalog, error = %e, "[TREE][ERROR] Catalog tree is malformed, aborting sweep");
                sweep.checkpoint.fail();
                sweep.persist().await?;
                return Err(e);
            }
            Err(e) => {
                error!(%catalog, error = %e, "[TREE][ERROR] Persistence failed, aborting sweep");
                return Err(e);
            }
        }
    }

    let finished = !reports.iter().any(CatalogReport::is_failed);
    if finished {
        sweep.checkpoint.finish();
        sweep.persist().await?;
        info!("[TREE] Sweep finished, checkpoint closed");
    } else {
        warn!("[TREE] Sweep incomplete, rerun to resume from the first failed catalog");
    }

    Ok(SweepReport {
        run_id,
        kind: request.kind,
        catalogs: reports,
        finished,
    })
}

struct Sweep<'a, F, R, C> {
    kind: TreeKind,
    fetcher: &'a F,
    repository: &'a R,
    checkpoints: &'a C,
    settings: &'a SyncSettings,
    checkpoint: Checkpoint,
    /// Set after a catalog failed; the stored checkpoint must keep pointing at it.
    frozen: bool,
    stats: Option<CatalogReport>,
}

impl<'a, F, R, C> Sweep<'a, F, R, C>
where
    F: RemoteFetcher,
    R: Repository,
    C: CheckpointStore,
{
    async fn sweep_catalog(
        &mut self,
        catalog: Catalog,
        root_code: Option<&str>,
    ) -> Result<CatalogReport, SyncError> {
        self.stats = Some(CatalogReport::new(catalog, CatalogOutcome::Completed));
        let root = Node::scope_root(self.kind, catalog, root_code);
        let path = vec![root.code.clone()];

        self.visit(root.clone(), path.clone()).await?;
        if !self.checkpoint.path_located() {
            warn!(
                %catalog,
                path_cursor = ?self.checkpoint.path_cursor,
                "[TREE] Resume point no longer exists, sweeping catalog from its root"
            );
            self.checkpoint.restart_catalog();
            self.visit(root, path).await?;
        }
        Ok(self.take_stats(catalog))
    }

    fn visit(&mut self, node: Node, path: Vec<String>) -> BoxFuture<'_, Result<(), SyncError>> {
        async move {
            let children = match self.checkpoint.locate(&path) {
                PathPosition::Completed => {
                    debug!(catalog = %node.catalog, code = %node.code, "[TREE] Subtree done earlier, skipping");
                    return Ok(());
                }
                position if position.is_replay() => self.replay(&node).await?,
                _ => self.reconcile_level(&node, &path).await?,
            };

            for child in children.into_iter().filter(|c| c.is_parent) {
                let mut child_path = path.clone();
                child_path.push(child.code.clone());
                self.visit(child, child_path).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Fetches, reconciles and persists the children of `node`, then advances the checkpoint.
    async fn reconcile_level(&mut self, node: &Node, path: &[String]) -> Result<Vec<Node>, SyncError> {
        let catalog = node.catalog;
        if path.len() > self.settings.max_depth {
            return Err(SyncError::DepthExceeded {
                catalog,
                code: node.code.clone(),
                max_depth: self.settings.max_depth,
            });
        }

        tokio::time::sleep(self.settings.request_delay()).await;
        let fetcher = self.fetcher;
        let kind = self.kind;
        let code = node.code.as_str();
        let mut remote = with_retry(self.settings.retry_policy(), "fetch_children", || {
            fetcher.fetch_children(kind, catalog, code)
        })
        .await
        .map_err(|source| SyncError::Fetch {
            catalog,
            code: node.code.clone(),
            source,
        })?;

        let fetched = remote.len();
        let mut seen = HashSet::new();
        remote.retain(|child| seen.insert(child.code.clone()));
        if remote.len() < fetched {
            warn!(
                %catalog,
                code = %node.code,
                duplicates = fetched - remote.len(),
                "[TREE] Remote listed a child more than once, keeping the first"
            );
        }

        let parent_code = node.code_as_parent();
        for (index, child) in remote.iter_mut().enumerate() {
            if child.code == node.code || path.contains(&child.code) {
                return Err(SyncError::CyclicLink {
                    catalog,
                    code: child.code.clone(),
                });
            }
            child.kind = kind;
            child.catalog = catalog;
            child.parent_code = parent_code.map(str::to_string);
            child.position = index as u32;
        }

        let local = self.repository.list_children(kind, catalog, parent_code).await?;
        let diff = reconcile(&remote, local);
        let upserted = if diff.to_upsert.is_empty() {
            0
        } else {
            self.repository.upsert(&diff.to_upsert).await?
        };
        let deleted = if diff.to_delete.is_empty() {
            0
        } else {
            self.repository.soft_delete(&diff.to_delete).await?
        };

        self.checkpoint.advance(path);
        self.persist().await?;

        if let Some(stats) = self.stats.as_mut() {
            stats.visited += 1;
            stats.upserted += upserted;
            stats.deleted += deleted;
        }
        debug!(
            %catalog,
            code = %node.code,
            depth = path.len(),
            children = remote.len(),
            upserted,
            deleted,
            "[TREE] Reconciled children"
        );
        Ok(remote)
    }

    /// Children of a node reconciled by an interrupted run, read back from the repository.
    async fn replay(&mut self, node: &Node) -> Result<Vec<Node>, SyncError> {
        let children = self
            .repository
            .list_children(self.kind, node.catalog, node.code_as_parent())
            .await?;
        if let Some(stats) = self.stats.as_mut() {
            stats.replayed += 1;
        }
        debug!(
            catalog = %node.catalog,
            code = %node.code,
            children = children.len(),
            "[TREE] Walking through reconciled node without fetching"
        );
        Ok(children)
    }

    async fn persist(&self) -> Result<(), SyncError> {
        if self.frozen {
            return Ok(());
        }
        let blob = self.checkpoint.to_blob().map_err(StoreError::backend)?;
        self.checkpoints
            .put(self.kind.checkpoint_key(), &blob)
            .await?;
        Ok(())
    }

    fn take_stats(&mut self, catalog: Catalog) -> CatalogReport {
        self.stats
            .take()
            .unwrap_or_else(|| CatalogReport::new(catalog, CatalogOutcome::Completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_sweeps_reject_macro_catalogs() {
        assert_eq!(
            scope_catalogs(TreeKind::Region, Some(Catalog::Hgnd)),
            Err(CatalogError::NoRegionTree {
                catalog: Catalog::Hgnd
            })
        );
        assert_eq!(scope_catalogs(TreeKind::Region, None).map(|c| c.len()), Ok(11));
        assert_eq!(scope_catalogs(TreeKind::Metric, None).map(|c| c.len()), Ok(14));
    }
}
