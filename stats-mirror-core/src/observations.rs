//! Observation download: mirrors metric values for a year range into the
//! observation repository.
//!
//! Which remote calls are made is planned from the locally mirrored metric tree
//! (run a metric sweep first):
//! - regional catalogs are queried per leaf metric, with regions as rows;
//! - other catalogs are queried per parent of leaves, which returns every
//!   sibling leaf in one call. A top-level metric without children is queried
//!   on its own.
//!
//! Each call's result is reconciled against the stored observations for the
//! metrics and periods it covers, with the same upsert/soft-delete rules as
//! the tree sweep. There is no checkpoint: a rerun simply finds nothing to write
//! for the targets already done.

use std::collections::HashSet;

use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{validate_year_range, Catalog};
use crate::config::SyncSettings;
use crate::contract::{ObservationFetcher, ObservationQuery, ObservationRepository, Repository};
use crate::error::SyncError;
use crate::model::{CatalogTree, Observation, TreeKind};
use crate::reconcile::reconcile;
use crate::retry::with_retry;
use crate::synchronise::CatalogOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationSyncRequest {
    pub catalog: Option<Catalog>,
    /// Restrict the download to the subtrees under these metric codes.
    pub metric_codes: Vec<String>,
    pub from_year: i32,
    pub to_year: i32,
}

/// One remote call and the metric codes whose stored rows it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub metric_code: String,
    pub covered_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationCatalogReport {
    pub catalog: Catalog,
    pub outcome: CatalogOutcome,
    pub targets: usize,
    pub fetched: usize,
    pub upserted: u64,
    pub deleted: u64,
}

#[derive(Debug, Clone)]
pub struct ObservationReport {
    pub run_id: Uuid,
    pub catalogs: Vec<ObservationCatalogReport>,
}

impl ObservationReport {
    pub fn failed(&self) -> impl Iterator<Item = &ObservationCatalogReport> {
        self.catalogs
            .iter()
            .filter(|c| matches!(c.outcome, CatalogOutcome::Failed(_)))
    }
}

/// Plans the remote calls for one catalog from its mirrored metric tree.
/// Requested codes missing from the tree are logged and ignored.
pub fn plan_targets(catalog: Catalog, tree: &CatalogTree, metric_codes: &[String]) -> Vec<DownloadTarget> {
    let roots = if metric_codes.is_empty() {
        tree.roots()
    } else {
        metric_codes
            .iter()
            .filter_map(|code| {
                let node = tree.get(code);
                if node.is_none() {
                    warn!(%catalog, code = %code, "[DATA] Requested metric is not mirrored, ignoring");
                }
                node
            })
            .collect()
    };

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for root in roots {
        for leaf in tree.leaves_under(&root.code) {
            let target = if catalog.is_regional() || leaf.code == root.code {
                leaf
            } else {
                tree.parent(&leaf.code).unwrap_or(leaf)
            };
            if !seen.insert(target.code.clone()) {
                continue;
            }
            let covered_codes = match tree.children(&target.code) {
                Some(children) if !children.is_empty() && !catalog.is_regional() => {
                    children.iter().map(|c| c.code.clone()).collect()
                }
                _ => vec![target.code.clone()],
            };
            targets.push(DownloadTarget {
                metric_code: target.code.clone(),
                covered_codes,
            });
        }
    }
    targets
}

pub async fn synchronise_observations<F, N, O>(
    request: &ObservationSyncRequest,
    fetcher: &F,
    nodes: &N,
    observations: &O,
    settings: &SyncSettings,
) -> Result<ObservationReport, SyncError>
where
    F: ObservationFetcher,
    N: Repository,
    O: ObservationRepository,
{
    validate_year_range(request.from_year, request.to_year)?;
    let run_id = Uuid::new_v4();
    let span = info_span!("observation_sync", %run_id);

    async move {
        let catalogs = match request.catalog {
            Some(catalog) => vec![catalog],
            None => Catalog::ALL.to_vec(),
        };
        info!(
            catalogs = catalogs.len(),
            from_year = request.from_year,
            to_year = request.to_year,
            "[DATA] Starting observation download"
        );

        let mut reports = Vec::with_capacity(catalogs.len());
        for catalog in catalogs {
            let mut report = ObservationCatalogReport {
                catalog,
                outcome: CatalogOutcome::Completed,
                targets: 0,
                fetched: 0,
                upserted: 0,
                deleted: 0,
            };
            match sync_catalog(catalog, request, fetcher, nodes, observations, settings, &mut report).await {
                Ok(()) => info!(
                    %catalog,
                    targets = report.targets,
                    upserted = report.upserted,
                    deleted = report.deleted,
                    "[DATA] Catalog complete"
                ),
                Err(e @ SyncError::Fetch { .. }) => {
                    error!(%catalog, error = %e, "[DATA][ERROR] Catalog aborted, continuing with the next one");
                    report.outcome = CatalogOutcome::Failed(e.to_string());
                }
                Err(e) => {
                    error!(%catalog, error = %e, "[DATA][ERROR] Aborting observation download");
                    return Err(e);
                }
            }
            reports.push(report);
        }

        Ok(ObservationReport {
            run_id,
            catalogs: reports,
        })
    }
    .instrument(span)
    .await
}

async fn sync_catalog<F, N, O>(
    catalog: Catalog,
    request: &ObservationSyncRequest,
    fetcher: &F,
    nodes: &N,
    observations: &O,
    settings: &SyncSettings,
    report: &mut ObservationCatalogReport,
) -> Result<(), SyncError>
where
    F: ObservationFetcher,
    N: Repository,
    O: ObservationRepository,
{
    let periods = catalog.periods_for_years(request.from_year, request.to_year)?;
    let tree = CatalogTree::from_nodes(nodes.list_tree(TreeKind::Metric, catalog).await?);
    if tree.is_empty() {
        warn!(%catalog, "[DATA] No mirrored metrics for catalog, run a metric sweep first");
        return Ok(());
    }
    let targets = plan_targets(catalog, &tree, &request.metric_codes);
    report.targets = targets.len();

    for target in targets {
        tokio::time::sleep(settings.request_delay()).await;
        let query = ObservationQuery {
            catalog,
            metric_code: target.metric_code.clone(),
            periods: periods.clone(),
            region_rows: catalog.is_regional(),
        };
        let fetched = with_retry(settings.retry_policy(), "fetch_observations", || {
            fetcher.fetch_observations(&query)
        })
        .await
        .map_err(|source| SyncError::Fetch {
            catalog,
            code: target.metric_code.clone(),
            source,
        })?;

        let total = fetched.len();
        let remote: Vec<Observation> = fetched
            .into_iter()
            .filter(|o| target.covered_codes.contains(&o.metric_code) && periods.contains(&o.period))
            .map(|mut o| {
                o.catalog = catalog;
                o
            })
            .collect();
        if remote.len() < total {
            debug!(
                %catalog,
                metric_code = %target.metric_code,
                dropped = total - remote.len(),
                "[DATA] Dropped rows outside the mirrored metrics or requested periods"
            );
        }

        let local = observations
            .list_observations(catalog, &target.covered_codes, &periods)
            .await?;
        let diff = reconcile(&remote, local);
        if !diff.to_upsert.is_empty() {
            report.upserted += observations.upsert_observations(&diff.to_upsert).await?;
        }
        if !diff.to_delete.is_empty() {
            report.deleted += observations.soft_delete_observations(&diff.to_delete).await?;
        }
        report.fetched += remote.len();
        debug!(
            %catalog,
            metric_code = %target.metric_code,
            rows = remote.len(),
            "[DATA] Reconciled observations"
        );
    }
    Ok(())
}
