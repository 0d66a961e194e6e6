//! Row and view types for the six logical records this crate persists.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque JSON object: string key to raw JSON value.
pub type StateMap = HashMap<String, Value>;

/// `SessionState` row: key `(app, user, session_id)`, at most one active
/// (`deleted_at IS NULL`) row per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStateRow {
    pub id: i64,
    pub app: String,
    pub user: String,
    pub session_id: String,
    pub state: StateMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// `SessionEvent` row: append-only, no uniqueness constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: i64,
    pub app: String,
    pub user: String,
    pub session_id: String,
    /// Opaque event payload (e.g. `{"content": ..., "filter_key": ...}`).
    pub payload: Value,
    /// Scoping tag used by the Summary Engine's cascade rule; `""` if unset.
    pub filter_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Caller-supplied event, prior to transactional persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub payload: Value,
    pub filter_key: String,
    /// Delta to merge into the session's state, applied unconditionally
    /// even when the event itself is partial.
    pub state_delta: StateMap,
    /// A partial event carries state deltas but no persistable content.
    pub partial: bool,
}

impl NewEvent {
    /// Whether this event should produce a row in the event log.
    pub fn has_valid_content(&self) -> bool {
        !self.partial && !self.payload.is_null()
    }
}

/// Caller-supplied track event, prior to transactional persistence. Unlike
/// `NewEvent`, track events carry no state delta and are never subject to
/// retention trimming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrackEvent {
    pub track: String,
    pub payload: Value,
}

/// `SessionTrackEvent` row: same shape as `SessionEvent` plus a `track` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTrackEvent {
    pub id: i64,
    pub app: String,
    pub user: String,
    pub session_id: String,
    pub track: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// `SessionSummary` row: key `(app, user, session_id, filter_key)`; `filter_key=""`
/// denotes the full-session summary. No `created_at`: a summary is
/// replaced in place, never versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub app: String,
    pub user: String,
    pub session_id: String,
    pub filter_key: String,
    pub summary: String,
    pub topics: Vec<String>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// `AppState` row: key `(app, key_name)`; value is free-form text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStateRow {
    pub app: String,
    pub key_name: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// `UserState` row: key `(app, user, key_name)`; value is free-form text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStateRow {
    pub app: String,
    pub user: String,
    pub key_name: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Assembled read-side view of a session: state merge + events + summaries.
/// `summaries` is the in-memory cache consulted first by
/// `GetSessionSummaryText` before the database read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub app: String,
    pub user: String,
    pub session_id: String,
    /// Session's own keys as-is, plus `app:`/`user:` merged namespaces.
    pub state: StateMap,
    pub events: Vec<SessionEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub summaries: std::sync::Arc<parking_lot::RwLock<HashMap<String, SessionSummary>>>,
}

/// Options accepted by `GetSession`.
#[derive(Debug, Clone, Default)]
pub struct GetSessionOptions {
    /// Return only the most recent N events. `None` = all.
    pub event_num: Option<u32>,
    /// Return only events strictly newer than this timestamp.
    pub event_time: Option<DateTime<Utc>>,
}

/// Options accepted by `GetSessionSummaryText`.
#[derive(Debug, Clone, Default)]
pub struct GetSummaryOptions {
    pub filter_key: String,
}
