//! HTTP client for the public statistics API.
//!
//! Two endpoints are used:
//! - `adv.htm?m=findZbXl`: direct children of a metric or region node
//!   (`treeId` is the parent code, or `zb` / `reg` for the top level).
//! - `easyquery.htm?m=QueryData`: values of one metric over a list of periods,
//!   broken down by sub-metric (`rowcode=zb`) or by region (`rowcode=reg`).
//!
//! The `isParent` flag the API returns is unreliable: for metrics it is ignored
//! in favour of a code-length rule, for regions it comes back inverted. The
//! client normalises it before handing nodes to the synchroniser.
//!
//! One `fetch_children` call is one logical fetch: the synchroniser paces and
//! retries it as a whole. When the English edition is enabled the client sends
//! a second request inside that fetch, after `edition_delay_ms`.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::contract::{ObservationFetcher, ObservationQuery, RemoteFetcher};
use crate::error::FetchError;
use crate::model::{Node, Observation, TreeKind};

/// Metric codes longer than this never have children.
pub const METRIC_PARENT_MAX_CODE_LEN: usize = 9;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/99.0.4844.51 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiClientConfig {
    pub base_url: String,
    /// Also fetch the English edition and merge its texts into each node.
    pub include_english: bool,
    /// The public endpoint has served broken certificate chains before.
    pub accept_invalid_certs: bool,
    pub timeout_secs: u64,
    /// Pause between the Chinese and the English request of one fetch.
    pub edition_delay_ms: u64,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        ApiClientConfig {
            base_url: "https://data.stats.gov.cn".to_string(),
            include_english: true,
            accept_invalid_certs: true,
            timeout_secs: 30,
            edition_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edition {
    Chinese,
    English,
}

pub struct StatsApiClient {
    http: reqwest::Client,
    base_url: String,
    include_english: bool,
    edition_delay: Duration,
}

impl StatsApiClient {
    pub fn new(config: &ApiClientConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        info!(
            base_url = %config.base_url,
            include_english = config.include_english,
            "[REMOTE] API client ready"
        );
        Ok(StatsApiClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            include_english: config.include_english,
            edition_delay: Duration::from_millis(config.edition_delay_ms),
        })
    }

    fn url(&self, edition: Edition, page: &str) -> String {
        match edition {
            Edition::Chinese => format!("{}/{page}", self.base_url),
            Edition::English => format!("{}/english/{page}", self.base_url),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        debug!(url, ?query, "[REMOTE] GET");
        let response = self
            .http
            .get(url)
            .query(query)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("Referer", format!("{}/easyquery.htm", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Malformed(format!("{url}: {e}")))
    }

    async fn tree_entries(
        &self,
        edition: Edition,
        kind: TreeKind,
        catalog: Catalog,
        parent_code: &str,
    ) -> Result<Vec<TreeEntry>, FetchError> {
        let tree_id = if parent_code.is_empty() {
            kind.wire_code()
        } else {
            parent_code
        };
        let query = [
            ("m", "findZbXl".to_string()),
            ("db", catalog.code().to_string()),
            ("wd", kind.wire_code().to_string()),
            ("treeId", tree_id.to_string()),
        ];
        self.get_json(&self.url(edition, "adv.htm"), &query).await
    }
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    id: String,
    name: String,
    #[serde(rename = "isParent", default)]
    is_parent: bool,
    #[serde(default)]
    exp: Option<String>,
    #[serde(default)]
    memo: Option<String>,
    #[serde(default)]
    unit: Option<String>,
}

/// Normalised "has children worth fetching" flag.
pub fn expands(kind: TreeKind, code: &str, remote_flag: bool) -> bool {
    match kind {
        TreeKind::Metric => code.len() <= METRIC_PARENT_MAX_CODE_LEN,
        TreeKind::Region => !remote_flag,
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

fn to_node(kind: TreeKind, catalog: Catalog, entry: TreeEntry) -> Node {
    let mut node = Node::new(kind, catalog, entry.id, entry.name);
    node.is_parent = expands(kind, &node.code, entry.is_parent);
    node.explanation = non_empty(entry.exp);
    node.memo = non_empty(entry.memo);
    node.unit = non_empty(entry.unit);
    node
}

/// Copies the English texts onto the matching Chinese nodes.
fn merge_english(nodes: &mut [Node], english: Vec<TreeEntry>) {
    let by_code: HashMap<String, TreeEntry> =
        english.into_iter().map(|e| (e.id.clone(), e)).collect();
    for node in nodes.iter_mut() {
        let Some(entry) = by_code.get(&node.code) else {
            continue;
        };
        node.english_name = non_empty(Some(entry.name.clone()));
        let texts = [
            ("english_explanation", &entry.exp),
            ("english_memo", &entry.memo),
            ("english_unit", &entry.unit),
        ];
        for (field, text) in texts {
            let Some(text) = non_empty(text.clone()) else {
                continue;
            };
            if let Err(e) = node.set_extra(field, text) {
                debug!(code = %node.code, error = %e, "[REMOTE] English text has no field for this kind");
            }
        }
    }
}

#[async_trait]
impl RemoteFetcher for StatsApiClient {
    async fn fetch_children(
        &self,
        kind: TreeKind,
        catalog: Catalog,
        parent_code: &str,
    ) -> Result<Vec<Node>, FetchError> {
        let entries = self
            .tree_entries(Edition::Chinese, kind, catalog, parent_code)
            .await?;
        let mut nodes: Vec<Node> = entries
            .into_iter()
            .map(|e| to_node(kind, catalog, e))
            .collect();

        if self.include_english && !nodes.is_empty() {
            tokio::time::sleep(self.edition_delay).await;
            let english = self
                .tree_entries(Edition::English, kind, catalog, parent_code)
                .await?;
            merge_english(&mut nodes, english);
        }
        debug!(
            %kind,
            %catalog,
            parent_code,
            children = nodes.len(),
            "[REMOTE] Fetched children"
        );
        Ok(nodes)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    returndata: ReturnData,
}

#[derive(Debug, Deserialize)]
struct ReturnData {
    #[serde(default)]
    datanodes: Vec<DataNode>,
}

#[derive(Debug, Deserialize)]
struct DataNode {
    data: DataValue,
    wds: Vec<Dimension>,
}

#[derive(Debug, Deserialize)]
struct DataValue {
    #[serde(default)]
    data: f64,
    #[serde(default)]
    hasdata: bool,
}

#[derive(Debug, Deserialize)]
struct Dimension {
    wdcode: String,
    valuecode: String,
}

fn to_observations(
    catalog: Catalog,
    response: QueryResponse,
) -> Result<Vec<Observation>, FetchError> {
    response
        .returndata
        .datanodes
        .into_iter()
        .map(|node| {
            let mut metric_code = None;
            let mut period = None;
            let mut region_code = None;
            for wd in node.wds {
                match wd.wdcode.as_str() {
                    "zb" => metric_code = Some(wd.valuecode),
                    "sj" => period = Some(wd.valuecode),
                    "reg" => region_code = Some(wd.valuecode),
                    _ => {}
                }
            }
            let metric_code = metric_code
                .ok_or_else(|| FetchError::Malformed("data node without metric code".into()))?;
            let period = period
                .ok_or_else(|| FetchError::Malformed("data node without period".into()))?;
            let period = catalog
                .period_number(&period)
                .map_err(|e| FetchError::Malformed(e.to_string()))?;
            Ok(Observation {
                catalog,
                metric_code,
                period,
                region_code,
                value: node.data.data,
                has_value: node.data.hasdata,
                is_deleted: false,
            })
        })
        .collect()
}

fn millis_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[async_trait]
impl ObservationFetcher for StatsApiClient {
    async fn fetch_observations(
        &self,
        query: &ObservationQuery,
    ) -> Result<Vec<Observation>, FetchError> {
        let periods = query
            .periods
            .iter()
            .map(|p| query.catalog.period_code(*p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        let dfwds = serde_json::json!([
            { "wdcode": "zb", "valuecode": query.metric_code },
            { "wdcode": "sj", "valuecode": periods.join(",") },
        ]);
        let row_code = if query.region_rows {
            TreeKind::Region.wire_code()
        } else {
            TreeKind::Metric.wire_code()
        };
        let params = [
            ("m", "QueryData".to_string()),
            ("dbcode", query.catalog.code().to_string()),
            ("rowcode", row_code.to_string()),
            ("colcode", "sj".to_string()),
            ("wds", "[]".to_string()),
            ("dfwds", dfwds.to_string()),
            ("k1", millis_now().to_string()),
        ];
        let response: QueryResponse = self
            .get_json(&self.url(Edition::Chinese, "easyquery.htm"), &params)
            .await?;
        let observations = to_observations(query.catalog, response)?;
        debug!(
            catalog = %query.catalog,
            metric_code = %query.metric_code,
            rows = observations.len(),
            "[REMOTE] Fetched observations"
        );
        Ok(observations)
    }
}
