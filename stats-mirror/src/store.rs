#![doc = "SQLite storage for the CLI: implements the core repository and checkpoint contracts on top of sqlx."]
//
//! # SQLite Store (CLI <-> Core)
//!
//! [`SqliteStore`] backs every storage trait of [`stats_mirror_core::contract`]
//! with one SQLite database:
//!
//! - `catalog_nodes`: metric and region nodes, keyed by `(tree_kind, catalog, code)`
//! - `observations`: metric values, keyed by `(catalog, metric_code, period, region_code)`
//! - `process_data`: checkpoint blobs, keyed by process id
//!
//! Tables are created on [`SqliteStore::connect`]. Upserts only touch a row when
//! an observable column differs or the row was soft-deleted, so `rows_affected`
//! doubles as the "written" count the synchronisers report. Every batch runs in
//! one transaction.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{info, warn};

use stats_mirror_core::catalog::Catalog;
use stats_mirror_core::contract::{CheckpointStore, ObservationRepository, Repository};
use stats_mirror_core::error::StoreError;
use stats_mirror_core::model::{Node, Observation, TreeKind};

const SCHEMA: [&str; 4] = [
    r"
    CREATE TABLE IF NOT EXISTS catalog_nodes (
        tree_kind         TEXT    NOT NULL,
        catalog           TEXT    NOT NULL,
        code              TEXT    NOT NULL,
        parent_code       TEXT,
        position          INTEGER NOT NULL DEFAULT 0,
        name              TEXT    NOT NULL,
        english_name      TEXT,
        explanation       TEXT,
        memo              TEXT,
        unit              TEXT,
        extra_attributes  TEXT    NOT NULL DEFAULT '{}',
        is_parent         INTEGER NOT NULL DEFAULT 0,
        is_deleted        INTEGER NOT NULL DEFAULT 0,
        created_time      TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_updated_time TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (tree_kind, catalog, code)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS catalog_nodes_by_parent
        ON catalog_nodes (tree_kind, catalog, parent_code)
    ",
    r"
    CREATE TABLE IF NOT EXISTS observations (
        catalog           TEXT    NOT NULL,
        metric_code       TEXT    NOT NULL,
        period            INTEGER NOT NULL,
        region_code       TEXT    NOT NULL DEFAULT '',
        value             REAL    NOT NULL,
        has_value         INTEGER NOT NULL,
        is_deleted        INTEGER NOT NULL DEFAULT 0,
        created_time      TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_updated_time TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (catalog, metric_code, period, region_code)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS process_data (
        process_id        TEXT PRIMARY KEY,
        data              TEXT NOT NULL,
        created_time      TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_updated_time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    ",
];

const UPSERT_NODE: &str = r"
    INSERT INTO catalog_nodes
        (tree_kind, catalog, code, parent_code, position, name, english_name,
         explanation, memo, unit, extra_attributes, is_parent, is_deleted)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
    ON CONFLICT (tree_kind, catalog, code) DO UPDATE SET
        parent_code = excluded.parent_code,
        position = excluded.position,
        name = excluded.name,
        english_name = excluded.english_name,
        explanation = excluded.explanation,
        memo = excluded.memo,
        unit = excluded.unit,
        extra_attributes = excluded.extra_attributes,
        is_parent = excluded.is_parent,
        is_deleted = 0,
        last_updated_time = CURRENT_TIMESTAMP
    WHERE catalog_nodes.parent_code IS NOT excluded.parent_code
       OR catalog_nodes.position IS NOT excluded.position
       OR catalog_nodes.name IS NOT excluded.name
       OR catalog_nodes.english_name IS NOT excluded.english_name
       OR catalog_nodes.explanation IS NOT excluded.explanation
       OR catalog_nodes.memo IS NOT excluded.memo
       OR catalog_nodes.unit IS NOT excluded.unit
       OR catalog_nodes.extra_attributes IS NOT excluded.extra_attributes
       OR catalog_nodes.is_parent IS NOT excluded.is_parent
       OR catalog_nodes.is_deleted = 1
";

const SOFT_DELETE_NODE: &str = r"
    UPDATE catalog_nodes
    SET is_deleted = 1, last_updated_time = CURRENT_TIMESTAMP
    WHERE tree_kind = ? AND catalog = ? AND code = ? AND is_deleted = 0
";

const NODE_COLUMNS: &str = "code, parent_code, position, name, english_name, explanation, \
     memo, unit, extra_attributes, is_parent, is_deleted";

const UPSERT_OBSERVATION: &str = r"
    INSERT INTO observations
        (catalog, metric_code, period, region_code, value, has_value, is_deleted)
    VALUES (?, ?, ?, ?, ?, ?, 0)
    ON CONFLICT (catalog, metric_code, period, region_code) DO UPDATE SET
        value = excluded.value,
        has_value = excluded.has_value,
        is_deleted = 0,
        last_updated_time = CURRENT_TIMESTAMP
    WHERE observations.value IS NOT excluded.value
       OR observations.has_value IS NOT excluded.has_value
       OR observations.is_deleted = 1
";

const SOFT_DELETE_OBSERVATION: &str = r"
    UPDATE observations
    SET is_deleted = 1, last_updated_time = CURRENT_TIMESTAMP
    WHERE catalog = ? AND metric_code = ? AND period = ? AND region_code = ? AND is_deleted = 0
";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and ensures the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::backend)?
            .create_if_missing(true);
        // One connection: the synchronisers are sequential, and `sqlite::memory:`
        // is private to its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;
        let store = SqliteStore { pool };
        store.migrate().await?;
        info!(url, "[STORE] SQLite store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }
        Ok(())
    }

    async fn query_nodes(
        &self,
        kind: TreeKind,
        catalog: Catalog,
        parent_code: Option<Option<&str>>,
    ) -> Result<Vec<Node>, StoreError> {
        let mut sql = format!(
            "SELECT {NODE_COLUMNS} FROM catalog_nodes \
             WHERE tree_kind = ? AND catalog = ? AND is_deleted = 0"
        );
        if parent_code.is_some() {
            sql.push_str(" AND parent_code IS ?");
        }
        sql.push_str(" ORDER BY position, code");

        let mut query = sqlx::query(&sql)
            .bind(kind.to_string())
            .bind(catalog.code());
        if let Some(parent_code) = parent_code {
            query = query.bind(parent_code);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(|row| node_from_row(kind, catalog, row))
            .collect()
    }
}

fn node_from_row(kind: TreeKind, catalog: Catalog, row: &SqliteRow) -> Result<Node, StoreError> {
    let code: String = row.try_get("code").map_err(StoreError::backend)?;
    let name: String = row.try_get("name").map_err(StoreError::backend)?;
    let mut node = Node::new(kind, catalog, code, name);
    node.parent_code = row.try_get("parent_code").map_err(StoreError::backend)?;
    let position: i64 = row.try_get("position").map_err(StoreError::backend)?;
    node.position = u32::try_from(position)
        .map_err(|_| StoreError::Corrupt(format!("negative position for {}", node.code)))?;
    node.english_name = row.try_get("english_name").map_err(StoreError::backend)?;
    node.explanation = row.try_get("explanation").map_err(StoreError::backend)?;
    node.memo = row.try_get("memo").map_err(StoreError::backend)?;
    node.unit = row.try_get("unit").map_err(StoreError::backend)?;
    node.is_parent = row.try_get("is_parent").map_err(StoreError::backend)?;
    node.is_deleted = row.try_get("is_deleted").map_err(StoreError::backend)?;

    let extra: String = row.try_get("extra_attributes").map_err(StoreError::backend)?;
    let extra: BTreeMap<String, serde_json::Value> = serde_json::from_str(&extra)
        .map_err(|e| StoreError::Corrupt(format!("extra attributes of {}: {e}", node.code)))?;
    for (field, value) in extra {
        if let Err(e) = node.set_extra(&field, value) {
            warn!(code = %node.code, error = %e, "[STORE] Dropping undeclared extension field");
        }
    }
    Ok(node)
}

fn observation_from_row(catalog: Catalog, row: &SqliteRow) -> Result<Observation, StoreError> {
    let period: i64 = row.try_get("period").map_err(StoreError::backend)?;
    let region_code: String = row.try_get("region_code").map_err(StoreError::backend)?;
    Ok(Observation {
        catalog,
        metric_code: row.try_get("metric_code").map_err(StoreError::backend)?,
        period: u32::try_from(period)
            .map_err(|_| StoreError::Corrupt(format!("invalid period {period}")))?,
        region_code: (!region_code.is_empty()).then_some(region_code),
        value: row.try_get("value").map_err(StoreError::backend)?,
        has_value: row.try_get("has_value").map_err(StoreError::backend)?,
        is_deleted: row.try_get("is_deleted").map_err(StoreError::backend)?,
    })
}

#[async_trait]
impl Repository for SqliteStore {
    async fn list_children(
        &self,
        kind: TreeKind,
        catalog: Catalog,
        parent_code: Option<&str>,
    ) -> Result<Vec<Node>, StoreError> {
        self.query_nodes(kind, catalog, Some(parent_code)).await
    }

    async fn list_tree(&self, kind: TreeKind, catalog: Catalog) -> Result<Vec<Node>, StoreError> {
        self.query_nodes(kind, catalog, None).await
    }

    async fn upsert(&self, nodes: &[Node]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        let mut written = 0;
        for node in nodes {
            let extra = serde_json::to_string(node.extra()).map_err(StoreError::backend)?;
            let result = sqlx::query(UPSERT_NODE)
                .bind(node.kind.to_string())
                .bind(node.catalog.code())
                .bind(&node.code)
                .bind(node.parent_code.as_deref())
                .bind(i64::from(node.position))
                .bind(&node.name)
                .bind(node.english_name.as_deref())
                .bind(node.explanation.as_deref())
                .bind(node.memo.as_deref())
                .bind(node.unit.as_deref())
                .bind(extra)
                .bind(node.is_parent)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(written)
    }

    async fn soft_delete(&self, nodes: &[Node]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        let mut deleted = 0;
        for node in nodes {
            let result = sqlx::query(SOFT_DELETE_NODE)
                .bind(node.kind.to_string())
                .bind(node.catalog.code())
                .bind(&node.code)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
            deleted += result.rows_affected();
        }
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(deleted)
    }
}

#[async_trait]
impl ObservationRepository for SqliteStore {
    async fn list_observations(
        &self,
        catalog: Catalog,
        metric_codes: &[String],
        periods: &[u32],
    ) -> Result<Vec<Observation>, StoreError> {
        if metric_codes.is_empty() || periods.is_empty() {
            return Ok(vec![]);
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT metric_code, period, region_code, value, has_value, is_deleted \
             FROM observations WHERE is_deleted = 0 AND catalog = ",
        );
        builder.push_bind(catalog.code());
        builder.push(" AND metric_code IN (");
        let mut codes = builder.separated(", ");
        for code in metric_codes {
            codes.push_bind(code.clone());
        }
        codes.push_unseparated(") AND period IN (");
        let mut in_periods = builder.separated(", ");
        for period in periods {
            in_periods.push_bind(i64::from(*period));
        }
        in_periods.push_unseparated(") ORDER BY metric_code, period, region_code");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter()
            .map(|row| observation_from_row(catalog, row))
            .collect()
    }

    async fn upsert_observations(&self, observations: &[Observation]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        let mut written = 0;
        for observation in observations {
            let result = sqlx::query(UPSERT_OBSERVATION)
                .bind(observation.catalog.code())
                .bind(&observation.metric_code)
                .bind(i64::from(observation.period))
                .bind(observation.region_code.as_deref().unwrap_or_default())
                .bind(observation.value)
                .bind(observation.has_value)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(written)
    }

    async fn soft_delete_observations(
        &self,
        observations: &[Observation],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        let mut deleted = 0;
        for observation in observations {
            let result = sqlx::query(SOFT_DELETE_OBSERVATION)
                .bind(observation.catalog.code())
                .bind(&observation.metric_code)
                .bind(i64::from(observation.period))
                .bind(observation.region_code.as_deref().unwrap_or_default())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
            deleted += result.rows_affected();
        }
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(deleted)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT data FROM process_data WHERE process_id = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(|row| row.try_get("data").map_err(StoreError::backend))
            .transpose()
    }

    async fn put(&self, key: &str, blob: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO process_data (process_id, data) VALUES (?, ?)
            ON CONFLICT (process_id) DO UPDATE SET
                data = excluded.data,
                last_updated_time = CURRENT_TIMESTAMP
            ",
        )
        .bind(key)
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }
}
