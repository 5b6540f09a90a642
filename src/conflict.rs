//! Conflict records and resolution dispatch.
//!
//! A conflict is raised when two operations touch the same structured
//! location and neither causally follows the other, in a way the CRDT merge
//! rule cannot settle deterministically on its own (the canonical case is a
//! delete racing an update). Conflicts stay attached to their document until
//! explicitly resolved.

use crate::error::{CollabError, Result};
use crate::op::{Operation, OperationId, OperationKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

pub type ConflictId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// A delete and an update raced on the same path.
    DeleteUpdate,
    /// Divergent branch and mainline edits touched the same path.
    ConcurrentEdit,
    /// Produced by a manual-strategy merge; every touched path defers to a
    /// human decision.
    ManualMerge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    Merge,
    Override,
    Manual,
}

/// The chosen outcome for a conflict. Immutable once applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub merged_value: Option<Value>,
    pub selected_operation: Option<OperationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub kind: ConflictKind,
    pub operations: Vec<Operation>,
    pub resolved: bool,
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    pub fn new(kind: ConflictKind, operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            operations,
            resolved: false,
            resolution: None,
        }
    }

    /// The contested path. All participating operations overlap on it; the
    /// first operation's path is the canonical one.
    pub fn path(&self) -> &[String] {
        self.operations
            .first()
            .map(|op| op.path.as_slice())
            .unwrap_or(&[])
    }
}

/// What a resolution settled on: the value to write at the contested path,
/// or `None` to uphold a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub path: Vec<String>,
    pub value: Option<Value>,
}

/// Records unresolved conflicts per document and dispatches resolutions.
#[derive(Debug, Default)]
pub struct ConflictTracker {
    conflicts: HashMap<String, Vec<Conflict>>,
}

impl ConflictTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, document_id: &str, conflict: Conflict) {
        self.conflicts
            .entry(document_id.to_string())
            .or_default()
            .push(conflict);
    }

    pub fn record_all(&mut self, document_id: &str, conflicts: Vec<Conflict>) {
        if conflicts.is_empty() {
            return;
        }
        self.conflicts
            .entry(document_id.to_string())
            .or_default()
            .extend(conflicts);
    }

    /// Unresolved conflicts attached to a document.
    pub fn conflicts(&self, document_id: &str) -> &[Conflict] {
        self.conflicts
            .get(document_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolves a conflict, removing it from the document. Returns the
    /// resolved record and the outcome to apply at the contested path.
    pub fn resolve(
        &mut self,
        document_id: &str,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> Result<(Conflict, ResolutionOutcome)> {
        let list = self
            .conflicts
            .get_mut(document_id)
            .ok_or_else(|| CollabError::ConflictNotFound(conflict_id))?;
        let position = list
            .iter()
            .position(|conflict| conflict.id == conflict_id)
            .ok_or_else(|| CollabError::ConflictNotFound(conflict_id))?;

        // Validate the resolution before detaching: a rejected resolution
        // must leave the conflict in place.
        let outcome = resolve_outcome(&list[position], &resolution)?;
        let mut conflict = list.remove(position);
        conflict.resolved = true;
        conflict.resolution = Some(resolution);
        Ok((conflict, outcome))
    }

    pub fn clear_document(&mut self, document_id: &str) {
        self.conflicts.remove(document_id);
    }
}

fn resolve_outcome(
    conflict: &Conflict,
    resolution: &ConflictResolution,
) -> Result<ResolutionOutcome> {
    let path = conflict.path().to_vec();
    match resolution.strategy {
        ResolutionStrategy::Merge => Ok(ResolutionOutcome {
            path,
            value: Some(merge_operation_values(&conflict.operations)),
        }),
        ResolutionStrategy::Override => {
            let selected = resolution.selected_operation.ok_or_else(|| {
                CollabError::Apply("override resolution requires a selected operation".to_string())
            })?;
            let op = conflict
                .operations
                .iter()
                .find(|op| op.id == selected)
                .ok_or_else(|| {
                    CollabError::Apply(format!(
                        "selected operation {selected} is not part of the conflict"
                    ))
                })?;
            let value = match op.kind {
                OperationKind::Delete => None,
                _ => op.value.clone(),
            };
            Ok(ResolutionOutcome { path, value })
        }
        ResolutionStrategy::Manual => {
            let value = resolution.merged_value.clone().ok_or_else(|| {
                CollabError::Apply("manual resolution requires a merged value".to_string())
            })?;
            Ok(ResolutionOutcome {
                path,
                value: Some(value),
            })
        }
    }
}

/// Key-wise merge of the conflicting operations' values, later stamps
/// overriding earlier ones at scalar keys. Delete operations contribute
/// nothing, so merge resolution favors surviving content.
fn merge_operation_values(operations: &[Operation]) -> Value {
    let mut ordered: Vec<&Operation> = operations
        .iter()
        .filter(|op| op.kind != OperationKind::Delete)
        .collect();
    ordered.sort_by(|a, b| {
        (a.timestamp, a.user_id.as_str()).cmp(&(b.timestamp, b.user_id.as_str()))
    });

    let mut merged = Value::Null;
    for op in ordered {
        if let Some(value) = &op.value {
            merged = merge_values(merged, value.clone());
        }
    }
    merged
}

fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                let merged = match a.remove(&key) {
                    Some(prior) => merge_values(prior, value),
                    None => value,
                };
                a.insert(key, merged);
            }
            Value::Object(a)
        }
        (_, overlay) => overlay,
    }
}
