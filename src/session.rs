//! Session and presence tracking.
//!
//! Sessions are a user's active attachment to one document; presence is the
//! ephemeral live state (cursor, selection, last-seen) regenerated
//! continuously and never persisted. Presence loss is a staleness issue, not
//! a correctness bug.

use crate::error::{CollabError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Editor,
    Viewer,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Owner,
    Edit,
    Delete,
    Invite,
    Manage,
    Comment,
}

/// Permission grant per role: the owner gets the full set, everyone else can
/// edit and comment.
pub fn permissions_for(role: Role) -> BTreeSet<Permission> {
    match role {
        Role::Owner => BTreeSet::from([
            Permission::Owner,
            Permission::Edit,
            Permission::Delete,
            Permission::Invite,
            Permission::Manage,
        ]),
        _ => BTreeSet::from([Permission::Edit, Permission::Comment]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f32,
    pub y: f32,
}

impl Cursor {
    pub const ORIGIN: Cursor = Cursor { x: 0.0, y: 0.0 };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub cursor: Cursor,
    pub selection: Vec<String>,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub document_id: String,
    pub user_id: String,
    pub permissions: BTreeSet<Permission>,
    pub presence: Presence,
}

impl Session {
    pub fn can(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Tracks which users are attached to which documents.
///
/// At most one session exists per (user, document) pair; re-joining replaces
/// the earlier session.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    by_pair: HashMap<(String, String), SessionId>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, document_id: &str, user_id: &str, role: Role, now: i64) -> SessionId {
        let pair = (document_id.to_string(), user_id.to_string());
        if let Some(stale) = self.by_pair.remove(&pair) {
            self.sessions.remove(&stale);
        }

        let session = Session {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            permissions: permissions_for(role),
            presence: Presence {
                cursor: Cursor::ORIGIN,
                selection: Vec::new(),
                last_seen: now,
            },
        };
        let id = session.id;
        self.by_pair.insert(pair, id);
        self.sessions.insert(id, session);
        id
    }

    pub fn leave(&mut self, session_id: SessionId) -> Result<Session> {
        let session = self
            .sessions
            .remove(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))?;
        self.by_pair
            .remove(&(session.document_id.clone(), session.user_id.clone()));
        Ok(session)
    }

    pub fn get(&self, session_id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))
    }

    pub fn find(&self, document_id: &str, user_id: &str) -> Option<&Session> {
        self.by_pair
            .get(&(document_id.to_string(), user_id.to_string()))
            .and_then(|id| self.sessions.get(id))
    }

    pub fn update_presence(
        &mut self,
        session_id: SessionId,
        cursor: Cursor,
        selection: Vec<String>,
        now: i64,
    ) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CollabError::SessionNotFound(session_id))?;
        session.presence = Presence {
            cursor,
            selection,
            last_seen: now,
        };
        Ok(())
    }

    pub fn sessions_for(&self, document_id: &str) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self
            .sessions
            .values()
            .filter(|session| session.document_id == document_id)
            .collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }
}

/// Stable RGBA cursor color derived from the session id, so every replica
/// renders a collaborator with the same hue.
pub fn presence_color(session_id: SessionId) -> [f32; 4] {
    let hue = (session_id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    [r, g, b, 1.0]
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = h * 6.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r1, g1, b1) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    (r1 + m, g1 + m, b1 + m)
}
