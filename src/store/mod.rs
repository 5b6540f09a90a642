//! CRDT document store: per-document replicated state with deterministic,
//! commutative merge rules.
//!
//! The content tree is made of stamped nodes. Every node carries an LWW stamp
//! `(timestamp, author)`; a delete lays a stamped cover over its node instead
//! of removing it, and the node's children stay underneath so concurrent
//! descendant writes can still be ordered against the cover. Comparisons use
//! a total order: timestamp first, covers outrank content at equal
//! timestamps, then the lexicographically greater author. Replicas converge
//! on any delivery order; re-delivery of an already-applied operation id is a
//! no-op.

use crate::conflict::{Conflict, ConflictKind};
use crate::error::{CollabError, Result};
use crate::op::{Operation, OperationId, OperationKind, paths_overlap};
use crate::session::Role;
use serde_json::{Map as JsonMap, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Last-writer-wins stamp. Derived ordering compares timestamps, then breaks
/// exact ties by the lexicographically greater author, which makes the order
/// total across users.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub timestamp: i64,
    pub author: String,
}

impl Stamp {
    pub fn of(op: &Operation) -> Self {
        Self {
            timestamp: op.timestamp,
            author: op.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeKind {
    Map(BTreeMap<String, Node>),
    Leaf(Value),
}

/// Deletion cover: a stamped tombstone laid over a node. The node's children
/// stay underneath, so concurrent descendant writes are retained on every
/// replica; the cover masks the ones it outranks at render time.
#[derive(Debug, Clone, PartialEq)]
struct Cover {
    stamp: Stamp,
    op: OperationId,
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    kind: NodeKind,
    stamp: Stamp,
    cleared: Option<Cover>,
    version: u64,
    /// The operation that last wrote this node. `None` for seeded initial
    /// content, which predates the log.
    last_op: Option<OperationId>,
}

impl Node {
    fn map(stamp: Stamp, version: u64, last_op: Option<OperationId>) -> Self {
        Self {
            kind: NodeKind::Map(BTreeMap::new()),
            stamp,
            cleared: None,
            version,
            last_op,
        }
    }

    /// Placeholder for a delete at a key with no content yet: an empty map
    /// under a cover with the same stamp (the cover wins the tie).
    fn covered_stub(stamp: Stamp, version: u64, op: OperationId) -> Self {
        Self {
            kind: NodeKind::Map(BTreeMap::new()),
            stamp: stamp.clone(),
            cleared: Some(Cover { stamp, op }),
            version,
            last_op: Some(op),
        }
    }

    fn is_map(&self) -> bool {
        matches!(self.kind, NodeKind::Map(_))
    }

    /// The node's own cover currently outranks its content.
    fn shadowed(&self) -> bool {
        self.cleared
            .as_ref()
            .is_some_and(|cover| cover_beats(cover, &self.stamp))
    }
}

/// A cover beats content stamped strictly earlier, and content stamped at the
/// exact same instant — a delete is never resurrected by an equal-timestamp
/// write, regardless of author.
fn cover_beats(cover: &Cover, content: &Stamp) -> bool {
    (cover.stamp.timestamp, 1, cover.stamp.author.as_str())
        > (content.timestamp, 0, content.author.as_str())
}

fn stronger_cover(a: Option<Cover>, b: Option<Cover>) -> Option<Cover> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.stamp > a.stamp { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

/// The cover in force at a node: the stronger of the inherited one and the
/// node's own.
fn effective<'a>(inherited: Option<&'a Cover>, own: Option<&'a Cover>) -> Option<&'a Cover> {
    match (inherited, own) {
        (Some(a), Some(b)) => Some(if b.stamp > a.stamp { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

fn node_from_value(
    value: &Value,
    stamp: &Stamp,
    version: u64,
    last_op: Option<OperationId>,
) -> Node {
    match value {
        Value::Object(map) => {
            let children = map
                .iter()
                .map(|(key, child)| (key.clone(), node_from_value(child, stamp, version, last_op)))
                .collect();
            Node {
                kind: NodeKind::Map(children),
                stamp: stamp.clone(),
                cleared: None,
                version,
                last_op,
            }
        }
        other => Node {
            kind: NodeKind::Leaf(other.clone()),
            stamp: stamp.clone(),
            cleared: None,
            version,
            last_op,
        },
    }
}

/// Convergent node merge: map-with-map merges key-wise (union of keys,
/// recursive merge on shared keys); anything else resolves to the higher
/// content stamp. Deletion covers max-merge independently of the content, so
/// a losing delete still masks the children it outranks. The rule is
/// commutative, associative, and idempotent.
fn merge_nodes(existing: Node, incoming: Node) -> Node {
    let incoming_wins = incoming.stamp > existing.stamp;
    let cleared = stronger_cover(existing.cleared, incoming.cleared);
    match (existing.kind, incoming.kind) {
        (NodeKind::Map(mut base), NodeKind::Map(overlay)) => {
            for (key, child) in overlay {
                let merged = match base.remove(&key) {
                    Some(prior) => merge_nodes(prior, child),
                    None => child,
                };
                base.insert(key, merged);
            }
            let (stamp, last_op) = if incoming_wins {
                (incoming.stamp, incoming.last_op)
            } else {
                (existing.stamp, existing.last_op)
            };
            Node {
                kind: NodeKind::Map(base),
                stamp,
                cleared,
                version: existing.version.max(incoming.version),
                last_op,
            }
        }
        (existing_kind, incoming_kind) => {
            if incoming_wins {
                Node {
                    kind: incoming_kind,
                    stamp: incoming.stamp,
                    cleared,
                    version: incoming.version,
                    last_op: incoming.last_op,
                }
            } else {
                Node {
                    kind: existing_kind,
                    stamp: existing.stamp,
                    cleared,
                    version: existing.version,
                    last_op: existing.last_op,
                }
            }
        }
    }
}

/// A node is erased when the cover in force outranks its content and, for
/// maps, every child is erased under that cover too.
fn is_erased(node: &Node, inherited: Option<&Cover>) -> bool {
    let Some(cover) = effective(inherited, node.cleared.as_ref()) else {
        return false;
    };
    if !cover_beats(cover, &node.stamp) {
        return false;
    }
    match &node.kind {
        NodeKind::Leaf(_) => true,
        NodeKind::Map(children) => children.values().all(|child| is_erased(child, Some(cover))),
    }
}

fn tombstone_json(cover: &Cover) -> Value {
    json!({
        "deleted": true,
        "deletedBy": cover.stamp.author,
        "deletedAt": cover.stamp.timestamp,
    })
}

fn render(node: &Node, inherited: Option<&Cover>) -> Value {
    let cover = effective(inherited, node.cleared.as_ref());
    if is_erased(node, inherited)
        && let Some(cover) = cover
    {
        return tombstone_json(cover);
    }
    match &node.kind {
        NodeKind::Map(children) => {
            let mut out = JsonMap::new();
            for (key, child) in children {
                out.insert(key.clone(), render(child, cover));
            }
            Value::Object(out)
        }
        NodeKind::Leaf(value) => json!({
            "value": value,
            "_timestamp": node.stamp.timestamp,
            "_author": node.stamp.author,
            "_version": node.version,
        }),
    }
}

/// Plain (metadata-free) view. Erased subtrees are omitted.
fn plain(node: &Node, inherited: Option<&Cover>) -> Option<Value> {
    if is_erased(node, inherited) {
        return None;
    }
    let cover = effective(inherited, node.cleared.as_ref());
    match &node.kind {
        NodeKind::Map(children) => {
            let mut out = JsonMap::new();
            for (key, child) in children {
                if let Some(value) = plain(child, cover) {
                    out.insert(key.clone(), value);
                }
            }
            Some(Value::Object(out))
        }
        NodeKind::Leaf(value) => Some(value.clone()),
    }
}

fn split_path(path: &[String]) -> Result<(&String, &[String])> {
    path.split_last()
        .ok_or_else(|| CollabError::Apply("operation path is empty".to_string()))
}

/// Walks down to the parent map of a path, creating intermediate maps as
/// needed. A leaf on the way is replaced when the incoming stamp wins and
/// left alone (the operation loses, with no effect) otherwise. Deletion
/// covers on the way are kept, not consulted: the write lands regardless and
/// the cover masks it at render time if it outranks it.
fn descend_create<'a>(
    root: &'a mut BTreeMap<String, Node>,
    ancestors: &[String],
    stamp: &Stamp,
    version: u64,
    op_id: OperationId,
) -> Option<&'a mut BTreeMap<String, Node>> {
    let mut current = root;
    for component in ancestors {
        let node = current
            .entry(component.clone())
            .or_insert_with(|| Node::map(stamp.clone(), version, Some(op_id)));
        if !node.is_map() {
            if *stamp <= node.stamp {
                return None;
            }
            let cleared = node.cleared.take();
            *node = Node::map(stamp.clone(), version, Some(op_id));
            node.cleared = cleared;
        }
        // Max-merge the traversed map's stamp. The stamp must not depend on
        // which operation happened to create the map first, or a later
        // delete of the whole map would win on one replica and lose on
        // another.
        if *stamp > node.stamp {
            node.stamp = stamp.clone();
            node.version = version;
            node.last_op = Some(op_id);
        }
        let NodeKind::Map(children) = &mut node.kind else {
            return None;
        };
        current = children;
    }
    Some(current)
}

/// Walks down to the parent map of a path without creating anything.
fn descend_existing<'a>(
    root: &'a mut BTreeMap<String, Node>,
    ancestors: &[String],
) -> Option<&'a mut BTreeMap<String, Node>> {
    let mut current = root;
    for component in ancestors {
        let node = current.get_mut(component)?;
        let NodeKind::Map(children) = &mut node.kind else {
            return None;
        };
        current = children;
    }
    Some(current)
}

fn closure_contains(
    log: &[Operation],
    index: &HashMap<OperationId, usize>,
    roots: &[OperationId],
    target: OperationId,
) -> bool {
    let mut seen: HashSet<OperationId> = HashSet::new();
    let mut queue: Vec<OperationId> = roots.to_vec();
    while let Some(id) = queue.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(&position) = index.get(&id) {
            queue.extend(log[position].dependencies.iter().copied());
        }
    }
    false
}

/// Two operations are concurrent when neither lies in the other's dependency
/// closure.
fn is_concurrent(
    log: &[Operation],
    index: &HashMap<OperationId, usize>,
    incoming: &Operation,
    stored: OperationId,
) -> bool {
    if incoming.id == stored {
        return false;
    }
    if closure_contains(log, index, &incoming.dependencies, stored) {
        return false;
    }
    let stored_dependencies = index
        .get(&stored)
        .map(|&position| log[position].dependencies.clone())
        .unwrap_or_default();
    !closure_contains(log, index, &stored_dependencies, incoming.id)
}

fn stored_operation<'a>(
    log: &'a [Operation],
    index: &HashMap<OperationId, usize>,
    id: OperationId,
) -> Option<&'a Operation> {
    index.get(&id).map(|&position| &log[position])
}

/// Result of one apply. `applied` is false only for re-delivered operation
/// ids, which are a no-op. Conflicts are reported for the caller to record;
/// the store itself keeps the deterministic LWW winner as provisional state.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub applied: bool,
    pub conflicts: Vec<Conflict>,
}

impl ApplyOutcome {
    fn duplicate() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Synced,
    /// Local operations are queued and awaiting broadcast.
    Pending,
    /// A transport failure occurred; local editing continues offline.
    OutOfSync,
}

/// Replicated per-document state plus collaboration metadata.
///
/// `version` is private and advances by exactly one per accepted operation;
/// the full operation log is retained for rebase lookups and branch replay.
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub id: String,
    pub owner: String,
    pub collaborators: BTreeMap<String, Role>,
    pub sync_state: SyncState,
    pub last_modified: i64,
    version: u64,
    content: BTreeMap<String, Node>,
    log: Vec<Operation>,
    log_index: HashMap<OperationId, usize>,
    applied: HashSet<OperationId>,
    frontier: BTreeSet<OperationId>,
}

impl DocumentState {
    pub fn new(id: &str, owner: &str, initial_content: Value, now: i64) -> Result<Self> {
        let seed = Stamp {
            timestamp: now,
            author: owner.to_string(),
        };
        let content = match initial_content {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), node_from_value(value, &seed, 0, None)))
                .collect(),
            Value::Null => BTreeMap::new(),
            other => {
                return Err(CollabError::Apply(format!(
                    "initial content must be an object, got {other}"
                )));
            }
        };
        Ok(Self {
            id: id.to_string(),
            owner: owner.to_string(),
            collaborators: BTreeMap::new(),
            sync_state: SyncState::Synced,
            last_modified: now,
            version: 0,
            content,
            log: Vec::new(),
            log_index: HashMap::new(),
            applied: HashSet::new(),
            frontier: BTreeSet::new(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn role_of(&self, user_id: &str) -> Role {
        if user_id == self.owner {
            return Role::Owner;
        }
        self.collaborators
            .get(user_id)
            .copied()
            .unwrap_or(Role::Guest)
    }

    pub fn add_collaborator(&mut self, user_id: &str, role: Role) {
        self.collaborators.insert(user_id.to_string(), role);
    }

    /// Applies one operation. Idempotent per operation id; a failure leaves
    /// the document untouched for every other operation.
    pub fn apply_operation(&mut self, op: &Operation) -> Result<ApplyOutcome> {
        if self.applied.contains(&op.id) {
            debug!(op = %op.id, "duplicate delivery ignored");
            return Ok(ApplyOutcome::duplicate());
        }
        if op.path.is_empty() {
            return Err(CollabError::Apply("operation path is empty".to_string()));
        }

        let stamp = Stamp::of(op);
        // Node metadata records the *creator's* document version, which is
        // fixed in the operation itself; using a local counter here would
        // diverge across replicas that apply in different orders.
        let node_version = op.version;
        let mut conflicts = Vec::new();
        {
            let Self {
                content,
                log,
                log_index,
                ..
            } = self;
            match op.kind {
                OperationKind::Insert => apply_insert(content, op, &stamp, node_version)?,
                OperationKind::Update => {
                    apply_update(content, op, &stamp, node_version, log, log_index, &mut conflicts)?
                }
                OperationKind::Delete => {
                    apply_delete(content, op, &stamp, node_version, log, log_index, &mut conflicts)?
                }
                OperationKind::Move => apply_move(content, op, &stamp, node_version)?,
            }
        }

        self.version += 1;
        self.last_modified = self.last_modified.max(op.timestamp);
        self.applied.insert(op.id);
        for dependency in &op.dependencies {
            self.frontier.remove(dependency);
        }
        self.frontier.insert(op.id);
        self.log_index.insert(op.id, self.log.len());
        self.log.push(op.clone());

        debug!(op = %op.id, kind = ?op.kind, version = self.version, "applied");
        Ok(ApplyOutcome {
            applied: true,
            conflicts,
        })
    }

    /// Full content tree with merge metadata (`_timestamp`, `_author`,
    /// `_version` on leaves; erased subtrees rendered as tombstones).
    pub fn get_state(&self) -> Value {
        let mut out = JsonMap::new();
        for (key, node) in &self.content {
            out.insert(key.clone(), render(node, None));
        }
        Value::Object(out)
    }

    /// Metadata-free content view; erased subtrees are absent.
    pub fn value(&self) -> Value {
        let mut out = JsonMap::new();
        for (key, node) in &self.content {
            if let Some(value) = plain(node, None) {
                out.insert(key.clone(), value);
            }
        }
        Value::Object(out)
    }

    /// Plain value at a path, if present and not deleted. Covers on ancestor
    /// nodes apply to the subtree they sit over.
    pub fn value_at(&self, path: &[String]) -> Option<Value> {
        if path.is_empty() {
            return Some(self.value());
        }
        let mut current = &self.content;
        let mut cover: Option<&Cover> = None;
        for component in &path[..path.len() - 1] {
            let node = current.get(component)?;
            cover = effective(cover, node.cleared.as_ref());
            match &node.kind {
                NodeKind::Map(children) => current = children,
                _ => return None,
            }
        }
        plain(current.get(&path[path.len() - 1])?, cover)
    }

    pub fn is_applied(&self, id: OperationId) -> bool {
        self.applied.contains(&id)
    }

    pub fn operation(&self, id: OperationId) -> Option<&Operation> {
        stored_operation(&self.log, &self.log_index, id)
    }

    /// Operations applied after the given version, in application order.
    /// Version `n` corresponds to the first `n` log entries.
    pub fn ops_since(&self, base_version: u64) -> &[Operation] {
        let start = (base_version as usize).min(self.log.len());
        &self.log[start..]
    }

    /// Current causal frontier: applied operations no later operation depends
    /// on. New local operations list these as their dependencies.
    pub fn frontier(&self) -> Vec<OperationId> {
        self.frontier.iter().copied().collect()
    }
}

fn apply_insert(
    root: &mut BTreeMap<String, Node>,
    op: &Operation,
    stamp: &Stamp,
    version: u64,
) -> Result<()> {
    let value = op
        .value
        .as_ref()
        .ok_or_else(|| CollabError::Apply("insert requires a value".to_string()))?;
    let (key, ancestors) = split_path(&op.path)?;
    let Some(parent) = descend_create(root, ancestors, stamp, version, op.id) else {
        return Ok(());
    };
    let incoming = node_from_value(value, stamp, version, Some(op.id));
    let merged = match parent.remove(key) {
        Some(existing) => merge_nodes(existing, incoming),
        None => incoming,
    };
    parent.insert(key.clone(), merged);
    Ok(())
}

fn apply_update(
    root: &mut BTreeMap<String, Node>,
    op: &Operation,
    stamp: &Stamp,
    version: u64,
    log: &[Operation],
    index: &HashMap<OperationId, usize>,
    conflicts: &mut Vec<Conflict>,
) -> Result<()> {
    let value = op
        .value
        .as_ref()
        .ok_or_else(|| CollabError::Apply("update requires a value".to_string()))?;
    let (key, ancestors) = split_path(&op.path)?;
    let Some(parent) = descend_create(root, ancestors, stamp, version, op.id) else {
        return Ok(());
    };
    let incoming = node_from_value(value, stamp, version, Some(op.id));
    match parent.remove(key) {
        None => {
            parent.insert(key.clone(), incoming);
        }
        Some(node) => {
            // An update meeting a shadowing cover written by a concurrent
            // delete is ambiguous: keep the LWW winner, but surface the race.
            if node.shadowed()
                && let Some(cover) = &node.cleared
                && is_concurrent(log, index, op, cover.op)
                && let Some(stored_op) = stored_operation(log, index, cover.op)
            {
                conflicts.push(Conflict::new(
                    ConflictKind::DeleteUpdate,
                    vec![stored_op.clone(), op.clone()],
                ));
            }
            // Merging (rather than replacing) keeps concurrent children of a
            // map alive no matter which side arrives first.
            parent.insert(key.clone(), merge_nodes(node, incoming));
        }
    }
    Ok(())
}

fn apply_delete(
    root: &mut BTreeMap<String, Node>,
    op: &Operation,
    stamp: &Stamp,
    version: u64,
    log: &[Operation],
    index: &HashMap<OperationId, usize>,
    conflicts: &mut Vec<Conflict>,
) -> Result<()> {
    let (key, ancestors) = split_path(&op.path)?;
    let Some(parent) = descend_create(root, ancestors, stamp, version, op.id) else {
        return Ok(());
    };
    match parent.get_mut(key) {
        None => {
            // Cover even an absent key, so later updates at the path still
            // order against this delete.
            parent.insert(key.clone(), Node::covered_stub(stamp.clone(), version, op.id));
        }
        Some(node) => {
            if !node.shadowed()
                && let Some(stored) = node.last_op
                && let Some(stored_op) = stored_operation(log, index, stored)
                && stored_op.kind == OperationKind::Update
                && is_concurrent(log, index, op, stored)
            {
                conflicts.push(Conflict::new(
                    ConflictKind::DeleteUpdate,
                    vec![stored_op.clone(), op.clone()],
                ));
            }
            // The node and its children stay in place; the cover masks
            // whatever it outranks, so a concurrent descendant write survives
            // on every replica regardless of delivery order.
            node.cleared = stronger_cover(
                node.cleared.take(),
                Some(Cover {
                    stamp: stamp.clone(),
                    op: op.id,
                }),
            );
        }
    }
    Ok(())
}

fn apply_move(
    root: &mut BTreeMap<String, Node>,
    op: &Operation,
    stamp: &Stamp,
    version: u64,
) -> Result<()> {
    let target = op
        .move_target()
        .ok_or_else(|| CollabError::Apply("move requires a target path in value".to_string()))?;
    if target.is_empty() {
        return Err(CollabError::Apply("move target path is empty".to_string()));
    }
    if paths_overlap(&op.path, &target) {
        return Err(CollabError::Apply(
            "move target overlaps the source subtree".to_string(),
        ));
    }

    let (source_key, source_ancestors) = split_path(&op.path)?;
    let subtree = {
        let Some(parent) = descend_existing(root, source_ancestors) else {
            return Err(CollabError::Apply("move source is missing".to_string()));
        };
        let Some(node) = parent.remove(source_key) else {
            return Err(CollabError::Apply("move source is missing".to_string()));
        };
        if is_erased(&node, None) {
            parent.insert(source_key.clone(), node);
            return Err(CollabError::Apply("move source is deleted".to_string()));
        }
        parent.insert(
            source_key.clone(),
            Node::covered_stub(stamp.clone(), version, op.id),
        );
        node
    };

    // Graft at the destination with the subtree's own stamps preserved, so
    // concurrent edits inside the moved subtree still merge by their
    // original order.
    let (target_key, target_ancestors) = split_path(&target)?;
    let Some(parent) = descend_create(root, target_ancestors, stamp, version, op.id) else {
        // A stronger node shadows the destination; the source tombstone
        // stands and replicas observing the same ranks agree.
        return Ok(());
    };
    let merged = match parent.remove(target_key) {
        Some(existing) => merge_nodes(existing, subtree),
        None => subtree,
    };
    parent.insert(target_key.clone(), merged);
    Ok(())
}
