//! Collaboration orchestrator: composes the store, rebaser, conflict
//! tracker, branch manager, and session manager with the external transport
//! collaborators.
//!
//! Local edits flow out: build operation → transform against the pending
//! queue → apply → broadcast. Remote edits flow in through the single
//! `deliver_*` ingress per document, which keeps every CRDT apply an atomic,
//! serialized step. Transport failures flip the document to
//! [`SyncState::OutOfSync`] instead of failing the local edit, so editing
//! keeps working offline.

use crate::branch::{BranchId, BranchManager, MergeReport, MergeStrategy};
use crate::conflict::{Conflict, ConflictId, ConflictResolution, ConflictTracker};
use crate::error::{CollabError, Result};
use crate::op::{Operation, OperationId, OperationKind};
use crate::rebase;
use crate::session::{Cursor, Permission, SessionId, SessionManager};
use crate::store::{ApplyOutcome, DocumentState, SyncState};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// Peer-to-peer channel (e.g. a data channel). Delivery is ordered per
/// channel but not globally ordered; the engine tolerates reordering.
pub trait PeerChannel {
    fn join_room(&mut self, room_id: &str) -> Result<()>;
    fn leave_room(&mut self, room_id: &str) -> Result<()>;
    fn broadcast_operation(&mut self, document_id: &str, op: &Operation) -> Result<()>;
    fn broadcast_resolution(
        &mut self,
        document_id: &str,
        conflict_id: ConflictId,
        resolution: &ConflictResolution,
    ) -> Result<()>;
}

/// Durable server-backed sync (e.g. a websocket to a relay).
pub trait DurableSync {
    fn sync_document(&mut self, document_id: &str) -> Result<bool>;
    fn send_operation(&mut self, document_id: &str, op: &Operation) -> Result<bool>;
}

pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Ingress resource limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_path_depth: usize,
    pub max_pending_ops: usize,
    pub max_value_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_path_depth: 64,
            max_pending_ops: 10_000,
            max_value_bytes: 1024 * 1024,
        }
    }
}

/// Validate an operation against configured limits before it reaches the
/// store.
pub fn validate_operation(op: &Operation, config: &EngineConfig) -> Result<()> {
    if op.path.is_empty() {
        return Err(CollabError::Apply("operation path is empty".to_string()));
    }
    if op.path.len() > config.max_path_depth {
        return Err(CollabError::LimitExceeded {
            what: "path depth",
            limit: config.max_path_depth,
            actual: op.path.len(),
        });
    }
    if let Some(value) = &op.value {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| CollabError::Apply(format!("unserializable value: {err}")))?
            .len();
        if bytes > config.max_value_bytes {
            return Err(CollabError::LimitExceeded {
                what: "value bytes",
                limit: config.max_value_bytes,
                actual: bytes,
            });
        }
    }
    Ok(())
}

/// Owns document lifecycle. Injected into the engine so tests can seed it
/// with fakes instead of relying on process-wide state.
#[derive(Debug, Default)]
pub struct DocumentRepository {
    documents: HashMap<String, DocumentState>,
}

impl DocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, id: &str, owner: &str, initial_content: Value, now: i64) -> Result<()> {
        if self.documents.contains_key(id) {
            return Err(CollabError::Apply(format!("document {id} already exists")));
        }
        let document = DocumentState::new(id, owner, initial_content, now)?;
        self.documents.insert(id.to_string(), document);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&DocumentState> {
        self.documents
            .get(id)
            .ok_or_else(|| CollabError::DocumentNotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut DocumentState> {
        self.documents
            .get_mut(id)
            .ok_or_else(|| CollabError::DocumentNotFound(id.to_string()))
    }

    pub fn destroy(&mut self, id: &str) -> Result<DocumentState> {
        self.documents
            .remove(id)
            .ok_or_else(|| CollabError::DocumentNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }
}

/// Top-level façade routing local edits out and remote edits in.
pub struct CollabEngine {
    repo: DocumentRepository,
    branches: BranchManager,
    sessions: SessionManager,
    tracker: ConflictTracker,
    peers: Box<dyn PeerChannel>,
    durable: Box<dyn DurableSync>,
    clock: Box<dyn Clock>,
    config: EngineConfig,
    /// Locally-issued operations not yet confirmed, per document. Remote
    /// deliveries are transformed against these.
    pending: HashMap<String, VecDeque<Operation>>,
    /// Subset of pending that has been broadcast but not confirmed.
    sent: HashMap<String, BTreeSet<OperationId>>,
    /// Remote operations delivered before their dependencies, held back
    /// until the missing operations arrive.
    held: HashMap<String, Vec<Operation>>,
}

impl CollabEngine {
    pub fn new(
        repo: DocumentRepository,
        peers: Box<dyn PeerChannel>,
        durable: Box<dyn DurableSync>,
        clock: Box<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            branches: BranchManager::new(),
            sessions: SessionManager::new(),
            tracker: ConflictTracker::new(),
            peers,
            durable,
            clock,
            config,
            pending: HashMap::new(),
            sent: HashMap::new(),
            held: HashMap::new(),
        }
    }

    pub fn create_document(&mut self, id: &str, owner: &str, initial_content: Value) -> Result<()> {
        let now = self.clock.now_ms();
        self.repo.create(id, owner, initial_content, now)
    }

    pub fn destroy_document(&mut self, document_id: &str) -> Result<()> {
        let stale: Vec<SessionId> = self
            .sessions
            .sessions_for(document_id)
            .iter()
            .map(|session| session.id)
            .collect();
        for session_id in stale {
            self.sessions.leave(session_id)?;
        }
        self.repo.destroy(document_id)?;
        self.tracker.clear_document(document_id);
        self.pending.remove(document_id);
        self.sent.remove(document_id);
        self.held.remove(document_id);
        Ok(())
    }

    /// Attaches a user to a document. A transport failure while joining the
    /// room leaves the session usable offline.
    pub fn join_document(&mut self, document_id: &str, user_id: &str) -> Result<SessionId> {
        let role = self.repo.get(document_id)?.role_of(user_id);
        let now = self.clock.now_ms();
        let session_id = self.sessions.join(document_id, user_id, role, now);
        if let Err(err) = self.peers.join_room(document_id) {
            warn!(document = document_id, error = %err, "join room failed; editing offline");
            self.repo.get_mut(document_id)?.sync_state = SyncState::OutOfSync;
        }
        Ok(session_id)
    }

    /// Detaches a session. Cancels the document's queued broadcasts but never
    /// undoes operations that were already applied.
    pub fn leave_document(&mut self, session_id: SessionId) -> Result<()> {
        let session = self.sessions.leave(session_id)?;
        let document_id = session.document_id;
        self.pending.remove(&document_id);
        self.sent.remove(&document_id);
        if let Err(err) = self.peers.leave_room(&document_id) {
            warn!(document = %document_id, error = %err, "leave room failed");
        }
        Ok(())
    }

    /// Builds, transforms, applies, and broadcasts a local edit. The edit
    /// succeeds even when broadcasting fails; the document just goes
    /// out-of-sync until the transport recovers.
    pub fn local_edit(
        &mut self,
        session_id: SessionId,
        kind: OperationKind,
        path: Vec<String>,
        value: Option<Value>,
        old_value: Option<Value>,
    ) -> Result<OperationId> {
        let (document_id, user_id, can_edit) = {
            let session = self.sessions.get(session_id)?;
            (
                session.document_id.clone(),
                session.user_id.clone(),
                session.can(Permission::Edit),
            )
        };
        if !can_edit {
            return Err(CollabError::PermissionDenied(format!(
                "user {user_id} cannot edit {document_id}"
            )));
        }

        let queued = self
            .pending
            .get(&document_id)
            .map(VecDeque::len)
            .unwrap_or(0);
        if queued >= self.config.max_pending_ops {
            return Err(CollabError::LimitExceeded {
                what: "pending operations",
                limit: self.config.max_pending_ops,
                actual: queued,
            });
        }

        let now = self.clock.now_ms();
        let op = {
            let document = self.repo.get(&document_id)?;
            Operation {
                id: Uuid::new_v4(),
                kind,
                path,
                value,
                old_value,
                timestamp: now,
                user_id,
                version: document.version(),
                dependencies: document.frontier(),
            }
        };
        validate_operation(&op, &self.config)?;

        let concurrent = self.pending_ops(&document_id);
        let transformed = rebase::transform(&op, &concurrent)?;

        let document = self.repo.get_mut(&document_id)?;
        let outcome = document.apply_operation(&transformed)?;
        if document.sync_state == SyncState::Synced {
            document.sync_state = SyncState::Pending;
        }
        self.tracker.record_all(&document_id, outcome.conflicts);

        let id = transformed.id;
        self.pending
            .entry(document_id.clone())
            .or_default()
            .push_back(transformed);
        self.flush(&document_id);
        Ok(id)
    }

    /// Single ingress for remote operations on a document. Duplicate
    /// deliveries are a no-op. An operation arriving before its dependencies
    /// (a move before the op that created its source, say) is held back and
    /// applied once they land, so reordered delivery still converges.
    pub fn deliver_operation(&mut self, document_id: &str, op: Operation) -> Result<ApplyOutcome> {
        validate_operation(&op, &self.config)?;
        let dependencies_met = {
            let document = self.repo.get(document_id)?;
            op.dependencies.iter().all(|dep| document.is_applied(*dep))
        };
        if !dependencies_met {
            let held = self.held.entry(document_id.to_string()).or_default();
            if held.len() >= self.config.max_pending_ops {
                return Err(CollabError::LimitExceeded {
                    what: "held operations",
                    limit: self.config.max_pending_ops,
                    actual: held.len(),
                });
            }
            debug!(document = document_id, op = %op.id, "held until dependencies arrive");
            held.push(op);
            return Ok(ApplyOutcome::default());
        }
        let outcome = self.apply_remote(document_id, &op)?;
        self.drain_held(document_id);
        Ok(outcome)
    }

    fn apply_remote(&mut self, document_id: &str, op: &Operation) -> Result<ApplyOutcome> {
        let concurrent = self.pending_ops(document_id);
        let transformed = rebase::transform(op, &concurrent)?;
        let document = self.repo.get_mut(document_id)?;
        let outcome = document.apply_operation(&transformed)?;
        self.tracker
            .record_all(document_id, outcome.conflicts.clone());
        Ok(outcome)
    }

    /// Applies held-back operations whose dependencies are now satisfied,
    /// repeating until no more become ready. A held operation that still
    /// fails to apply is dropped with a warning; the failure is isolated.
    fn drain_held(&mut self, document_id: &str) {
        loop {
            let ready: Vec<Operation> = {
                let Some(held) = self.held.get_mut(document_id) else {
                    return;
                };
                let Ok(document) = self.repo.get(document_id) else {
                    return;
                };
                let mut ready = Vec::new();
                let mut still_waiting = Vec::new();
                for op in held.drain(..) {
                    if op.dependencies.iter().all(|dep| document.is_applied(*dep)) {
                        ready.push(op);
                    } else {
                        still_waiting.push(op);
                    }
                }
                *held = still_waiting;
                ready
            };
            if ready.is_empty() {
                return;
            }
            for op in ready {
                if let Err(err) = self.apply_remote(document_id, &op) {
                    warn!(document = document_id, op = %op.id, error = %err, "held operation failed");
                }
            }
        }
    }

    /// Best-effort presence ingress. Unknown users are attached with their
    /// document role so their cursor becomes visible.
    pub fn deliver_presence(
        &mut self,
        document_id: &str,
        user_id: &str,
        cursor: Cursor,
        selection: Vec<String>,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let session_id = match self.sessions.find(document_id, user_id) {
            Some(session) => session.id,
            None => {
                let role = self.repo.get(document_id)?.role_of(user_id);
                self.sessions.join(document_id, user_id, role, now)
            }
        };
        self.sessions
            .update_presence(session_id, cursor, selection, now)
    }

    /// A peer resolved a conflict: clear the local record. The content
    /// change arrives separately as a regular operation, so replicas stay
    /// convergent.
    pub fn deliver_resolution(
        &mut self,
        document_id: &str,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> Result<()> {
        self.tracker.resolve(document_id, conflict_id, resolution)?;
        let now = self.clock.now_ms();
        let document = self.repo.get_mut(document_id)?;
        document.last_modified = document.last_modified.max(now);
        Ok(())
    }

    /// Resolves a conflict locally: applies the chosen outcome as a fresh
    /// stamped operation (which outranks the losing side), broadcasts the
    /// operation and the resolution, and removes the conflict.
    pub fn resolve_conflict(
        &mut self,
        session_id: SessionId,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> Result<OperationId> {
        let (document_id, user_id) = {
            let session = self.sessions.get(session_id)?;
            (session.document_id.clone(), session.user_id.clone())
        };
        let (_, outcome) = self
            .tracker
            .resolve(&document_id, conflict_id, resolution.clone())?;

        let now = self.clock.now_ms();
        let document = self.repo.get_mut(&document_id)?;
        let op = Operation {
            id: Uuid::new_v4(),
            kind: if outcome.value.is_some() {
                OperationKind::Update
            } else {
                OperationKind::Delete
            },
            path: outcome.path,
            value: outcome.value,
            old_value: None,
            timestamp: now,
            user_id,
            version: document.version(),
            dependencies: document.frontier(),
        };
        document.apply_operation(&op)?;

        let id = op.id;
        self.pending
            .entry(document_id.clone())
            .or_default()
            .push_back(op);
        self.flush(&document_id);
        if let Err(err) = self
            .peers
            .broadcast_resolution(&document_id, conflict_id, &resolution)
        {
            warn!(document = %document_id, error = %err, "resolution broadcast failed");
            if let Ok(document) = self.repo.get_mut(&document_id) {
                document.sync_state = SyncState::OutOfSync;
            }
        }
        Ok(id)
    }

    /// Forks the document at its current version.
    pub fn create_branch(
        &mut self,
        document_id: &str,
        name: &str,
        author: &str,
    ) -> Result<BranchId> {
        let document = self.repo.get(document_id)?;
        self.branches
            .create_branch(document, name, document.version(), author)
    }

    /// Records an edit on an active branch without touching the mainline.
    pub fn branch_edit(
        &mut self,
        session_id: SessionId,
        branch_id: BranchId,
        kind: OperationKind,
        path: Vec<String>,
        value: Option<Value>,
        old_value: Option<Value>,
    ) -> Result<OperationId> {
        let (user_id, can_edit) = {
            let session = self.sessions.get(session_id)?;
            (session.user_id.clone(), session.can(Permission::Edit))
        };
        if !can_edit {
            return Err(CollabError::PermissionDenied(format!(
                "user {user_id} cannot edit branch {branch_id}"
            )));
        }
        let branch = self.branches.get(branch_id)?;
        let op = Operation {
            id: Uuid::new_v4(),
            kind,
            path,
            value,
            old_value,
            timestamp: self.clock.now_ms(),
            user_id,
            version: branch.base_version + branch.ops().len() as u64,
            dependencies: branch.ops().last().map(|op| vec![op.id]).unwrap_or_default(),
        };
        validate_operation(&op, &self.config)?;
        let id = op.id;
        self.branches.record_op(branch_id, op)?;
        Ok(id)
    }

    /// Merges a branch back into its document and broadcasts the applied
    /// operations. Conflicts land in the tracker for later resolution.
    pub fn merge_branch(
        &mut self,
        document_id: &str,
        branch_id: BranchId,
        strategy: MergeStrategy,
    ) -> Result<MergeReport> {
        let now = self.clock.now_ms();
        let document = self.repo.get_mut(document_id)?;
        let report = self.branches.merge(document, branch_id, strategy, now)?;
        self.tracker
            .record_all(document_id, report.conflicts.clone());

        let applied: Vec<Operation> = {
            let document = self.repo.get(document_id)?;
            report
                .applied
                .iter()
                .filter_map(|id| document.operation(*id).cloned())
                .collect()
        };
        if !applied.is_empty() {
            let queue = self.pending.entry(document_id.to_string()).or_default();
            queue.extend(applied);
            self.flush(document_id);
        }
        Ok(report)
    }

    /// Reconciles with the durable sync backend. A transport failure is
    /// reported as `Ok(false)` with the document flagged out-of-sync, never
    /// as a hard error.
    pub fn sync_document(&mut self, document_id: &str) -> Result<bool> {
        self.repo.get(document_id)?;
        match self.durable.sync_document(document_id) {
            Ok(synced) => {
                if synced {
                    self.flush(document_id);
                }
                Ok(synced)
            }
            Err(err) => {
                warn!(document = document_id, error = %err, "durable sync failed");
                self.repo.get_mut(document_id)?.sync_state = SyncState::OutOfSync;
                Ok(false)
            }
        }
    }

    /// Retires confirmed operations from the pending queue.
    pub fn mark_confirmed(&mut self, document_id: &str, op_ids: &[OperationId]) {
        if let Some(queue) = self.pending.get_mut(document_id) {
            queue.retain(|op| !op_ids.contains(&op.id));
        }
        if let Some(sent) = self.sent.get_mut(document_id) {
            for id in op_ids {
                sent.remove(id);
            }
        }
    }

    pub fn document_state(&self, document_id: &str) -> Result<Value> {
        Ok(self.repo.get(document_id)?.get_state())
    }

    pub fn document_value(&self, document_id: &str) -> Result<Value> {
        Ok(self.repo.get(document_id)?.value())
    }

    pub fn document_version(&self, document_id: &str) -> Result<u64> {
        Ok(self.repo.get(document_id)?.version())
    }

    pub fn sync_state(&self, document_id: &str) -> Result<SyncState> {
        Ok(self.repo.get(document_id)?.sync_state)
    }

    /// Unresolved conflicts stay visible until explicitly resolved.
    pub fn conflicts(&self, document_id: &str) -> &[Conflict] {
        self.tracker.conflicts(document_id)
    }

    pub fn branch(&self, branch_id: BranchId) -> Result<&crate::branch::Branch> {
        self.branches.get(branch_id)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn repository(&self) -> &DocumentRepository {
        &self.repo
    }

    pub fn pending_count(&self, document_id: &str) -> usize {
        self.pending
            .get(document_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn pending_ops(&self, document_id: &str) -> Vec<Operation> {
        self.pending
            .get(document_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Broadcasts queued operations in order. Stops at the first transport
    /// failure, leaving the rest queued for a later flush.
    fn flush(&mut self, document_id: &str) {
        let sent = self.sent.entry(document_id.to_string()).or_default();
        let unsent: Vec<Operation> = self
            .pending
            .get(document_id)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|op| !sent.contains(&op.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut failed = false;
        for op in unsent {
            match self.peers.broadcast_operation(document_id, &op) {
                Ok(()) => {
                    if let Err(err) = self.durable.send_operation(document_id, &op) {
                        warn!(document = document_id, op = %op.id, error = %err, "durable send failed");
                        failed = true;
                    }
                    self.sent
                        .entry(document_id.to_string())
                        .or_default()
                        .insert(op.id);
                    debug!(document = document_id, op = %op.id, "broadcast");
                }
                Err(err) => {
                    warn!(document = document_id, op = %op.id, error = %err, "broadcast failed");
                    failed = true;
                    break;
                }
            }
        }

        if let Ok(document) = self.repo.get_mut(document_id) {
            document.sync_state = if failed {
                SyncState::OutOfSync
            } else {
                SyncState::Synced
            };
        }
    }
}
