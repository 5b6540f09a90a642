//! Operation model: immutable, versioned description of a single document
//! mutation, plus the JSON wire format shared with existing peers.
//!
//! The wire shape is bit-exact across transports: field names and types must
//! not change, or interop with deployed peers breaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type OperationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Delete,
    Update,
    Move,
}

/// A single mutation request. Immutable once created; retained in the
/// per-document log so concurrency can be judged against its dependencies.
///
/// Serialized form:
/// `{id, type, path, value, oldValue, timestamp, userId, version, dependencies}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub path: Vec<String>,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub timestamp: i64,
    pub user_id: String,
    pub version: u64,
    pub dependencies: Vec<OperationId>,
}

impl Operation {
    /// The destination path of a `Move` operation, carried in `value` as an
    /// array of path components.
    pub fn move_target(&self) -> Option<Vec<String>> {
        if self.kind != OperationKind::Move {
            return None;
        }
        let items = self.value.as_ref()?.as_array()?;
        items
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect()
    }
}

/// Two paths overlap when one is a prefix of the other (including equality).
/// Disjoint-path operations commute at the CRDT layer.
pub fn paths_overlap(a: &[String], b: &[String]) -> bool {
    let shorter = a.len().min(b.len());
    a[..shorter] == b[..shorter]
}
