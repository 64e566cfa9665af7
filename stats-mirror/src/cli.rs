///
/// This module implements the CLI interface for stats-mirror: command parsing,
/// argument validation, and wiring the SQLite store and API client into the
/// synchronisers of [`stats-mirror-core`].
///
/// All synchronisation logic lives in the core crate. This module is strictly
/// for CLI glue and user-visible reporting.
///
/// ## Commands
/// - `metric-codes`: mirror the metric tree of one or all catalogs
/// - `region-codes`: mirror the region tree of one or all regional catalogs
/// - `metric-data`: download observations for a year range
///
/// Tree commands resume an interrupted run automatically when invoked with the
/// same `--catalog` / `--code`.
///
/// ## How To Use
/// - For command-line users: use the installed `stats-mirror` binary with `--help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// [`stats-mirror-core`]: ../../stats_mirror_core/
use crate::load_config::load_config;
use crate::store::SqliteStore;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stats_mirror_core::catalog::{validate_year_range, Catalog};
use stats_mirror_core::model::TreeKind;
use stats_mirror_core::observations::{synchronise_observations, ObservationSyncRequest};
use stats_mirror_core::remote::StatsApiClient;
use stats_mirror_core::synchronise::{scope_catalogs, synchronise_tree, TreeSyncRequest};
use std::path::PathBuf;
use uuid::Uuid;

/// CLI for stats-mirror: keep a local copy of the national statistics catalog.
#[derive(Parser)]
#[clap(
    name = "stats-mirror",
    version,
    about = "Mirror the national statistics catalog (metrics, regions, observations) into SQLite"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mirror the metric tree
    MetricCodes {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Only this catalog (e.g. hgnd)
        #[clap(long)]
        catalog: Option<Catalog>,
        /// Only the subtree under this metric code
        #[clap(long)]
        code: Option<String>,
    },
    /// Mirror the region tree of regional catalogs
    RegionCodes {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Only this catalog (e.g. fsnd)
        #[clap(long)]
        catalog: Option<Catalog>,
        /// Only the subtree under this region code
        #[clap(long)]
        code: Option<String>,
    },
    /// Download observations of mirrored metrics
    MetricData {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Only this catalog (e.g. hgyd)
        #[clap(long)]
        catalog: Option<Catalog>,
        /// Only the subtrees under these metric codes (repeatable)
        #[clap(long = "code")]
        codes: Vec<String>,
        /// First year, inclusive
        #[clap(long)]
        from_year: i32,
        /// Last year, inclusive
        #[clap(long)]
        to_year: i32,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::MetricCodes {
            config,
            catalog,
            code,
        } => sync_tree(TreeKind::Metric, config, catalog, code).await,
        Commands::RegionCodes {
            config,
            catalog,
            code,
        } => sync_tree(TreeKind::Region, config, catalog, code).await,
        Commands::MetricData {
            config,
            catalog,
            codes,
            from_year,
            to_year,
        } => sync_data(config, catalog, codes, from_year, to_year).await,
    }
}

async fn sync_tree(
    kind: TreeKind,
    config: PathBuf,
    catalog: Option<Catalog>,
    code: Option<String>,
) -> Result<()> {
    let invocation = Uuid::new_v4();
    scope_catalogs(kind, catalog)?;
    let config = load_config(config)?;
    config.sync.trace_loaded();

    let store = SqliteStore::connect(&config.database.url)
        .await
        .with_context(|| format!("opening database {}", config.database.url))?;
    let client = StatsApiClient::new(&config.remote).context("building the API client")?;
    tracing::info!(%invocation, %kind, ?catalog, ?code, "[CLI] Starting tree sweep");

    let request = TreeSyncRequest {
        kind,
        catalog,
        root_code: code,
    };
    let report = match synchronise_tree(&request, &client, &store, &store, &config.sync).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(%invocation, error = %e, "[CLI] Tree sweep failed");
            return Err(anyhow::Error::new(e).context(format!("{kind} sweep failed")));
        }
    };

    tracing::info!(
        %invocation,
        run_id = %report.run_id,
        upserted = report.upserted(),
        deleted = report.deleted(),
        finished = report.finished,
        "[CLI] Tree sweep complete"
    );
    let failed: Vec<String> = report.failed().map(|c| c.catalog.to_string()).collect();
    if !failed.is_empty() {
        bail!(
            "{kind} sweep incomplete, failed catalogs: {}; rerun to resume",
            failed.join(", ")
        );
    }
    Ok(())
}

async fn sync_data(
    config: PathBuf,
    catalog: Option<Catalog>,
    codes: Vec<String>,
    from_year: i32,
    to_year: i32,
) -> Result<()> {
    let invocation = Uuid::new_v4();
    validate_year_range(from_year, to_year)?;
    let config = load_config(config)?;
    config.sync.trace_loaded();

    let store = SqliteStore::connect(&config.database.url)
        .await
        .with_context(|| format!("opening database {}", config.database.url))?;
    let client = StatsApiClient::new(&config.remote).context("building the API client")?;
    tracing::info!(%invocation, ?catalog, from_year, to_year, "[CLI] Starting observation download");

    let request = ObservationSyncRequest {
        catalog,
        metric_codes: codes,
        from_year,
        to_year,
    };
    let report = synchronise_observations(&request, &client, &store, &store, &config.sync)
        .await
        .context("observation download failed")?;

    let failed: Vec<String> = report.failed().map(|c| c.catalog.to_string()).collect();
    tracing::info!(
        %invocation,
        run_id = %report.run_id,
        catalogs = report.catalogs.len(),
        failed = failed.len(),
        "[CLI] Observation download complete"
    );
    if !failed.is_empty() {
        bail!("observation download failed for: {}", failed.join(", "));
    }
    Ok(())
}
