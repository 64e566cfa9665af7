//! Durable traversal cursor for a tree sweep.
//!
//! A sweep records the catalog it is in and the root-first code path of the last
//! node whose children were durably reconciled. On the next run both cursors are
//! replayed: earlier catalogs and completed subtrees are skipped, the nodes on
//! the way down to the cursor are walked without fetching, and normal work
//! resumes right after it.
//!
//! The "located" flags live in memory only. They flip once the sweep has
//! reached the stored position; from then on every catalog and path is adopted
//! as the new cursor.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::Catalog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

/// Where a node sits relative to the stored path cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPosition {
    /// Finished in an earlier run.
    Completed,
    /// Strict ancestor of the cursor: reconciled already, descendants partly done.
    OnResumePath,
    /// The cursor itself: reconciled already, children not yet visited.
    ResumePoint,
    /// Not reached yet. Visit normally.
    Pending,
}

impl PathPosition {
    pub fn is_replay(&self) -> bool {
        matches!(self, PathPosition::OnResumePath | PathPosition::ResumePoint)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default)]
    pub requested_catalog: Option<String>,
    #[serde(default)]
    pub requested_root: Option<String>,
    #[serde(default)]
    pub catalog_cursor: Option<String>,
    #[serde(default)]
    pub path_cursor: Option<Vec<String>>,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(skip)]
    catalog_located: bool,
    #[serde(skip)]
    path_located: bool,
}

impl Checkpoint {
    /// Parses a stored blob. Anything unreadable counts as no checkpoint.
    pub fn from_blob(blob: Option<&str>) -> Checkpoint {
        let Some(blob) = blob else {
            return Checkpoint::default();
        };
        match serde_json::from_str(blob) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(error = %e, "[CHECKPOINT] Stored checkpoint is unreadable, starting over");
                Checkpoint::default()
            }
        }
    }

    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Starts over unless this is a continuation of a running sweep over the same scope.
    pub fn reset_if_parameters_changed(&mut self, catalog: Option<Catalog>, root: Option<&str>) {
        let catalog = catalog.map(|c| c.code().to_string());
        let root = root.filter(|r| !r.is_empty()).map(str::to_string);
        let same_scope = normalise(&self.requested_catalog) == normalise(&catalog)
            && normalise(&self.requested_root) == normalise(&root);

        if self.status != SyncStatus::Running || !same_scope {
            *self = Checkpoint {
                requested_catalog: catalog,
                requested_root: root,
                ..Checkpoint::default()
            };
        }
        self.status = SyncStatus::Running;
    }

    pub fn need_skip_catalog(&mut self, catalog: Catalog) -> bool {
        let code = catalog.code();
        if self.catalog_cursor.is_none() || self.catalog_located {
            if self.catalog_cursor.as_deref() != Some(code) {
                self.catalog_cursor = Some(code.to_string());
                self.path_cursor = None;
                self.path_located = false;
            }
            self.catalog_located = true;
            return false;
        }
        if self.catalog_cursor.as_deref() == Some(code) {
            self.catalog_located = true;
            return false;
        }
        true
    }

    /// Drops a catalog cursor that points outside the catalogs about to be swept,
    /// so the sweep does not skip everything looking for it.
    pub fn retain_catalog_cursor_in(&mut self, catalogs: &[Catalog]) {
        let known = self
            .catalog_cursor
            .as_deref()
            .map_or(true, |cursor| catalogs.iter().any(|c| c.code() == cursor));
        if !known {
            warn!(
                catalog_cursor = ?self.catalog_cursor,
                "[CHECKPOINT] Catalog cursor is outside the sweep scope, starting over"
            );
            self.catalog_cursor = None;
            self.path_cursor = None;
        }
    }

    pub fn need_skip_path(&mut self, path: &[String]) -> bool {
        self.locate(path) == PathPosition::Completed
    }

    /// Classifies `path` against the cursor, adopting it when the resume point
    /// has been reached.
    pub fn locate(&mut self, path: &[String]) -> PathPosition {
        let resuming =
            matches!(&self.path_cursor, Some(c) if !c.is_empty()) && !self.path_located;
        if !resuming {
            return self.adopt(path);
        }
        let cursor = self.path_cursor.as_deref().unwrap_or_default();

        if cursor.len() < path.len() {
            if path.starts_with(cursor) {
                return self.adopt(path);
            }
            return PathPosition::Completed;
        }
        if cursor[..path.len()] == *path {
            if cursor.len() == path.len() {
                self.path_located = true;
                return PathPosition::ResumePoint;
            }
            return PathPosition::OnResumePath;
        }
        PathPosition::Completed
    }

    /// Records `path` as the last durably reconciled node.
    pub fn advance(&mut self, path: &[String]) {
        self.path_cursor = Some(path.to_vec());
        self.path_located = true;
    }

    pub fn path_located(&self) -> bool {
        self.path_located
    }

    /// Forgets the path cursor of the current catalog so it is swept from its root.
    pub fn restart_catalog(&mut self) {
        self.path_cursor = None;
        self.path_located = false;
    }

    pub fn finish(&mut self) {
        self.catalog_cursor = None;
        self.path_cursor = None;
        self.catalog_located = false;
        self.path_located = false;
        self.status = SyncStatus::Done;
    }

    pub fn fail(&mut self) {
        self.status = SyncStatus::Failed;
    }

    fn adopt(&mut self, path: &[String]) -> PathPosition {
        self.path_cursor = Some(path.to_vec());
        self.path_located = true;
        PathPosition::Pending
    }
}

fn normalise(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    fn resumed_at(catalog: Catalog, cursor: &[&str]) -> Checkpoint {
        let mut cp = Checkpoint::default();
        cp.reset_if_parameters_changed(None, None);
        cp.catalog_cursor = Some(catalog.code().to_string());
        cp.path_cursor = Some(path(cursor));
        let blob = cp.to_blob().unwrap();
        Checkpoint::from_blob(Some(&blob))
    }

    #[test]
    fn same_running_scope_is_kept() {
        let mut cp = resumed_at(Catalog::Hgnd, &["", "A"]);
        cp.reset_if_parameters_changed(None, Some(""));
        assert_eq!(cp.path_cursor, Some(path(&["", "A"])));
        assert_eq!(cp.status, SyncStatus::Running);
    }

    #[test]
    fn changed_scope_resets_cursors() {
        let mut cp = resumed_at(Catalog::Hgnd, &["", "A"]);
        cp.reset_if_parameters_changed(Some(Catalog::Hgnd), None);
        assert_eq!(cp.path_cursor, None);
        assert_eq!(cp.catalog_cursor, None);
        assert_eq!(cp.requested_catalog.as_deref(), Some("hgnd"));
        assert_eq!(cp.status, SyncStatus::Running);
    }

    #[test]
    fn finished_checkpoint_is_not_resumed() {
        let mut cp = resumed_at(Catalog::Hgnd, &["", "A"]);
        cp.finish();
        cp.catalog_cursor = Some("hgnd".into());
        cp.reset_if_parameters_changed(None, None);
        assert_eq!(cp.catalog_cursor, None);
    }

    #[test]
    fn catalogs_before_the_cursor_are_skipped() {
        let mut cp = resumed_at(Catalog::Fsnd, &[""]);
        assert!(cp.need_skip_catalog(Catalog::Hgnd));
        assert!(!cp.need_skip_catalog(Catalog::Fsnd));
        assert_eq!(cp.path_cursor, Some(path(&[""])));

        assert!(!cp.need_skip_catalog(Catalog::Csnd));
        assert_eq!(cp.catalog_cursor.as_deref(), Some("csnd"));
        assert_eq!(cp.path_cursor, None);
    }

    #[test]
    fn shorter_cursor_skips_unrelated_deeper_paths() {
        let mut cp = resumed_at(Catalog::Hgnd, &["", "A"]);
        assert!(cp.need_skip_path(&path(&["", "B", "B1"])));
        assert!(!cp.path_located());
    }

    #[test]
    fn descendant_of_the_cursor_is_not_skipped() {
        let mut cp = resumed_at(Catalog::Hgnd, &["", "A"]);
        assert!(!cp.need_skip_path(&path(&["", "A", "A1"])));
        assert!(cp.path_located());
        assert_eq!(cp.path_cursor, Some(path(&["", "A", "A1"])));
    }

    #[test]
    fn walking_down_to_the_cursor() {
        let mut cp = resumed_at(Catalog::Hgnd, &["", "A", "A2"]);
        assert_eq!(cp.locate(&path(&[""])), PathPosition::OnResumePath);
        assert_eq!(cp.locate(&path(&["", "A"])), PathPosition::OnResumePath);
        assert_eq!(cp.locate(&path(&["", "A", "A1"])), PathPosition::Completed);
        assert_eq!(cp.locate(&path(&["", "A", "A2"])), PathPosition::ResumePoint);
        assert!(cp.path_located());
        assert_eq!(cp.locate(&path(&["", "A", "A3"])), PathPosition::Pending);
        assert_eq!(cp.path_cursor, Some(path(&["", "A", "A3"])));
    }

    #[test]
    fn empty_cursor_adopts_the_first_path() {
        let mut cp = Checkpoint::default();
        assert_eq!(cp.locate(&path(&["A01"])), PathPosition::Pending);
        assert_eq!(cp.path_cursor, Some(path(&["A01"])));
    }

    #[test]
    fn corrupt_blob_is_no_checkpoint() {
        assert_eq!(Checkpoint::from_blob(Some("{not json")), Checkpoint::default());
        assert_eq!(Checkpoint::from_blob(None), Checkpoint::default());
    }

    #[test]
    fn serialised_field_names() {
        let mut cp = Checkpoint::default();
        cp.reset_if_parameters_changed(Some(Catalog::Fsyd), None);
        cp.need_skip_catalog(Catalog::Fsyd);
        cp.advance(&path(&["", "A01"]));
        let json: serde_json::Value = serde_json::from_str(&cp.to_blob().unwrap()).unwrap();
        assert_eq!(json["catalogCursor"], "fsyd");
        assert_eq!(json["pathCursor"], serde_json::json!(["", "A01"]));
        assert_eq!(json["status"], "Running");
        assert!(json.get("pathLocated").is_none());
    }

    #[test]
    fn retains_only_cursors_in_scope() {
        let mut cp = resumed_at(Catalog::Hgnd, &["", "A"]);
        cp.retain_catalog_cursor_in(&[Catalog::Fsnd]);
        assert_eq!(cp.catalog_cursor, None);
        assert!(!cp.need_skip_catalog(Catalog::Fsnd));
    }
}
