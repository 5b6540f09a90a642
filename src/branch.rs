//! Branch and merge management.
//!
//! A branch is a pointer: a named fork of a document at a base version whose
//! content is derived by replaying its recorded operations on top of that
//! version. Branches move `created → active → merged` and never back; a
//! merged branch is immutable.

use crate::conflict::{Conflict, ConflictKind};
use crate::error::{CollabError, Result};
use crate::op::{Operation, OperationId, paths_overlap};
use crate::rebase;
use crate::store::DocumentState;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

pub type BranchId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Valid only when the document has not advanced past the fork point.
    FastForward,
    /// Base + both divergent sides; shared paths become conflicts instead of
    /// silent overwrites.
    ThreeWay,
    /// Every touched path defers to a human decision.
    Manual,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub document_id: String,
    pub name: String,
    pub base_version: u64,
    pub author: String,
    pub is_active: bool,
    ops: Vec<Operation>,
}

impl Branch {
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }
}

/// What a merge did: operations applied to the mainline, conflicts left for
/// resolution, and branch operations that failed to apply. A failed
/// operation never aborts the merge; the rest of the branch still lands.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub applied: Vec<OperationId>,
    pub conflicts: Vec<Conflict>,
    pub failed: Vec<(OperationId, CollabError)>,
}

#[derive(Debug, Default)]
pub struct BranchManager {
    branches: HashMap<BranchId, Branch>,
}

impl BranchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fork point. The branch copies no content.
    pub fn create_branch(
        &mut self,
        document: &DocumentState,
        name: &str,
        base_version: u64,
        author: &str,
    ) -> Result<BranchId> {
        if base_version > document.version() {
            return Err(CollabError::Merge(format!(
                "base version {base_version} is ahead of document version {}",
                document.version()
            )));
        }
        let branch = Branch {
            id: Uuid::new_v4(),
            document_id: document.id.clone(),
            name: name.to_string(),
            base_version,
            author: author.to_string(),
            is_active: true,
            ops: Vec::new(),
        };
        let id = branch.id;
        self.branches.insert(id, branch);
        Ok(id)
    }

    pub fn get(&self, branch_id: BranchId) -> Result<&Branch> {
        self.branches
            .get(&branch_id)
            .ok_or(CollabError::BranchNotFound(branch_id))
    }

    pub fn branches_for(&self, document_id: &str) -> Vec<&Branch> {
        let mut branches: Vec<&Branch> = self
            .branches
            .values()
            .filter(|branch| branch.document_id == document_id)
            .collect();
        branches.sort_by_key(|branch| branch.id);
        branches
    }

    /// Appends an operation to an active branch's log.
    pub fn record_op(&mut self, branch_id: BranchId, op: Operation) -> Result<()> {
        let branch = self
            .branches
            .get_mut(&branch_id)
            .ok_or(CollabError::BranchNotFound(branch_id))?;
        if !branch.is_active {
            return Err(CollabError::Merge(format!(
                "branch {branch_id} is already merged"
            )));
        }
        branch.ops.push(op);
        Ok(())
    }

    /// Reconciles a branch back into its document. On success the branch is
    /// immutable (`is_active = false`) and the document's version has
    /// advanced by the operations applied.
    pub fn merge(
        &mut self,
        document: &mut DocumentState,
        branch_id: BranchId,
        strategy: MergeStrategy,
        now: i64,
    ) -> Result<MergeReport> {
        let branch = self
            .branches
            .get_mut(&branch_id)
            .ok_or(CollabError::BranchNotFound(branch_id))?;
        if branch.document_id != document.id {
            return Err(CollabError::Merge(format!(
                "branch {branch_id} does not belong to document {}",
                document.id
            )));
        }
        if !branch.is_active {
            return Err(CollabError::Merge(format!(
                "branch {branch_id} is already merged"
            )));
        }

        let report = match strategy {
            MergeStrategy::FastForward => {
                if document.version() != branch.base_version {
                    return Err(CollabError::Merge(format!(
                        "document advanced past version {}; fast-forward is invalid",
                        branch.base_version
                    )));
                }
                let mut report = MergeReport::default();
                for op in &branch.ops {
                    match document.apply_operation(op) {
                        Ok(outcome) => {
                            if outcome.applied {
                                report.applied.push(op.id);
                            }
                            report.conflicts.extend(outcome.conflicts);
                        }
                        Err(err) => {
                            warn!(branch = %branch_id, op = %op.id, error = %err, "branch op failed");
                            report.failed.push((op.id, err));
                        }
                    }
                }
                report
            }
            MergeStrategy::ThreeWay => {
                let mainline: Vec<Operation> = document.ops_since(branch.base_version).to_vec();
                let mut report = MergeReport::default();
                for op in &branch.ops {
                    let contested: Vec<&Operation> = mainline
                        .iter()
                        .filter(|main_op| paths_overlap(&op.path, &main_op.path))
                        .collect();
                    if contested.is_empty() {
                        match rebase::transform(op, &mainline)
                            .and_then(|transformed| document.apply_operation(&transformed))
                        {
                            Ok(outcome) => {
                                if outcome.applied {
                                    report.applied.push(op.id);
                                }
                                report.conflicts.extend(outcome.conflicts);
                            }
                            Err(err) => {
                                warn!(branch = %branch_id, op = %op.id, error = %err, "branch op failed");
                                report.failed.push((op.id, err));
                            }
                        }
                    } else {
                        let mut operations = vec![op.clone()];
                        operations.extend(contested.into_iter().cloned());
                        report
                            .conflicts
                            .push(Conflict::new(ConflictKind::ConcurrentEdit, operations));
                    }
                }
                report
            }
            MergeStrategy::Manual => {
                let mainline: Vec<Operation> = document.ops_since(branch.base_version).to_vec();
                let mut report = MergeReport::default();
                for op in &branch.ops {
                    let mut operations = vec![op.clone()];
                    operations.extend(
                        mainline
                            .iter()
                            .filter(|main_op| paths_overlap(&op.path, &main_op.path))
                            .cloned(),
                    );
                    report
                        .conflicts
                        .push(Conflict::new(ConflictKind::ManualMerge, operations));
                }
                report
            }
        };

        branch.is_active = false;
        document.last_modified = document.last_modified.max(now);
        debug!(
            branch = %branch_id,
            strategy = ?strategy,
            applied = report.applied.len(),
            conflicts = report.conflicts.len(),
            "merged"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_branch_validates_base_version() {
        let doc = DocumentState::new("d", "owner", json!({}), 0).unwrap();
        let mut manager = BranchManager::new();
        let err = manager
            .create_branch(&doc, "feature", 3, "alice")
            .unwrap_err();
        assert!(matches!(err, CollabError::Merge(_)));
    }

    #[test]
    fn test_merged_branch_rejects_new_ops() {
        let mut doc = DocumentState::new("d", "owner", json!({}), 0).unwrap();
        let mut manager = BranchManager::new();
        let id = manager.create_branch(&doc, "feature", 0, "alice").unwrap();
        manager
            .merge(&mut doc, id, MergeStrategy::FastForward, 10)
            .unwrap();

        let op = Operation {
            id: Uuid::new_v4(),
            kind: crate::op::OperationKind::Update,
            path: vec!["x".to_string()],
            value: Some(json!(1)),
            old_value: None,
            timestamp: 1,
            user_id: "alice".to_string(),
            version: 0,
            dependencies: vec![],
        };
        assert!(matches!(
            manager.record_op(id, op),
            Err(CollabError::Merge(_))
        ));
    }
}
