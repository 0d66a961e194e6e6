//! Event Log: append-only event insertion, bounded retention, filtered
//! listing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use crate::client::{Client, Engine};
use crate::error::{Result, SessionError};
use crate::keys::{validate_state_delta_keys, SessionKey};
use crate::models::{NewEvent, NewTrackEvent, SessionEvent, SessionTrackEvent, StateMap};
use crate::util::{from_millis, opt_from_millis, to_millis};

pub struct EventLog {
    client: Arc<dyn Client>,
    prefix: String,
    session_event_limit: u32,
    session_ttl: Option<std::time::Duration>,
}

impl EventLog {
    pub fn new(client: Arc<dyn Client>, prefix: String, session_event_limit: u32) -> Self {
        Self {
            client,
            prefix,
            session_event_limit,
            session_ttl: None,
        }
    }

    /// Carries the configured session TTL so step 2 of `append_event` can
    /// refresh `expires_at` alongside `updated_at`.
    pub fn with_session_ttl(mut self, ttl: Option<std::time::Duration>) -> Self {
        self.session_ttl = ttl;
        self
    }

    fn table(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    /// Runs the four-step transactional body: read state, apply the delta
    /// and refresh timestamps, conditionally insert an event row, then
    /// enforce retention. Returns the persisted event row, or `None` if the
    /// event was partial/invalid and produced no event row (state was still
    /// updated).
    #[instrument(skip(self, event))]
    pub async fn append_event(&self, key: &SessionKey, event: NewEvent) -> Result<Option<SessionEvent>> {
        key.validate()?;
        validate_state_delta_keys(event.state_delta.keys())?;
        let states_table = self.table("session_states");
        let events_table = self.table("session_events");

        let mut tx = self.client.pool().begin().await.map_err(SessionError::from)?;

        // Step 1: read the session row.
        let row: Option<(i64, String)> = sqlx::query_as(&format!(
            "SELECT id, state FROM {states_table} WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
        ))
        .bind(&key.app)
        .bind(&key.user)
        .bind(&key.session_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(SessionError::from)?;

        let (session_row_id, state_json) = row.ok_or_else(|| {
            SessionError::not_found(format!(
                "session {}/{}/{} not found", key.app, key.user, key.session_id
            ))
        })?;

        // Step 2: apply the event's state delta, refresh updated_at/expires_at.
        // This happens unconditionally, even for partial events.
        let mut state: StateMap = serde_json::from_str(&state_json)?;
        state.extend(event.state_delta.clone());
        let new_state_json = serde_json::to_string(&state)?;
        let now = Utc::now();
        let expires_at = self
            .session_ttl
            .map(|ttl| to_millis(now + chrono::Duration::from_std(ttl).unwrap_or_default()));

        sqlx::query(&format!(
            "UPDATE {states_table} SET state = ?, updated_at = ?, expires_at = ? WHERE id = ?"
        ))
        .bind(&new_state_json)
        .bind(to_millis(now))
        .bind(expires_at)
        .bind(session_row_id)
        .execute(&mut *tx)
        .await
        .map_err(SessionError::from)?;

        // Step 3: insert the event row, only if not partial and has valid content.
        let persisted = if event.has_valid_content() {
            let payload_json = serde_json::to_string(&event.payload)?;
            let id = insert_event_row(
                &mut tx,
                self.client.engine(),
                &events_table,
                key,
                &event.filter_key,
                &payload_json,
                to_millis(now),
            )
            .await?;

            Some(SessionEvent {
                id,
                app: key.app.clone(),
                user: key.user.clone(),
                session_id: key.session_id.clone(),
                payload: event.payload,
                filter_key: event.filter_key,
                created_at: now,
                updated_at: now,
                expires_at: None,
                deleted_at: None,
            })
        } else {
            None
        };

        // Step 4: enforce retention.
        if persisted.is_some() {
            enforce_retention(&mut tx, &events_table, key, self.session_event_limit).await?;
        }

        tx.commit().await.map_err(SessionError::from)?;
        Ok(persisted)
    }

    /// Returns events strictly newer than `after`, ordered ascending by
    /// `created_at`, limited to the most recent `limit` (default: all).
    #[instrument(skip(self))]
    pub async fn list_events(
        &self,
        key: &SessionKey,
        limit: Option<u32>,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionEvent>> {
        key.validate()?;
        let table = self.table("session_events");
        let now = to_millis(Utc::now());
        let after_ms = after.map(to_millis).unwrap_or(i64::MIN);

        // `limit` means "the most recent N", which a plain SQL `LIMIT` on an
        // ascending order can't express directly (it would return the oldest
        // N instead); fetch the full matching range and trim the head below.
        let sql = format!(
            "SELECT id, app, user_id, session_id, filter_key, payload, created_at, updated_at, expires_at, deleted_at \
             FROM {table} WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL \
             AND (expires_at IS NULL OR expires_at > ?) AND created_at > ? \
             ORDER BY created_at ASC, id ASC"
        );

        let q = sqlx::query(&sql)
            .bind(&key.app)
            .bind(&key.user)
            .bind(&key.session_id)
            .bind(now)
            .bind(after_ms);

        let rows = q.fetch_all(self.client.pool()).await.map_err(SessionError::from)?;
        let mut events = rows.into_iter().map(row_to_event).collect::<Result<Vec<_>>>()?;

        if let Some(n) = limit {
            if events.len() as u32 > n {
                let skip = events.len() - n as usize;
                events = events.split_off(skip);
            }
        }
        Ok(events)
    }

    /// Batch variant: events for many session keys in one query (used by
    /// `ListSessions`), keyed by `session_id`.
    #[instrument(skip(self, keys))]
    pub async fn list_events_batch(
        &self,
        app: &str,
        user: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<SessionEvent>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let table = self.table("session_events");
        let now = to_millis(Utc::now());
        let placeholders = std::iter::repeat("?").take(keys.len()).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT id, app, user_id, session_id, filter_key, payload, created_at, updated_at, expires_at, deleted_at \
             FROM {table} WHERE app = ? AND user_id = ? AND session_id IN ({placeholders}) \
             AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?) \
             ORDER BY created_at ASC, id ASC"
        );
        let mut q = sqlx::query(&sql).bind(app).bind(user);
        for k in keys {
            q = q.bind(k);
        }
        q = q.bind(now);

        let rows = q.fetch_all(self.client.pool()).await.map_err(SessionError::from)?;
        let mut grouped: HashMap<String, Vec<SessionEvent>> = HashMap::new();
        for row in rows {
            let event = row_to_event(row)?;
            grouped.entry(event.session_id.clone()).or_default().push(event);
        }
        Ok(grouped)
    }

    /// Appends a `SessionTrackEvent` row. Unlike `append_event`, this is a
    /// plain insert: track events carry no state delta and are not subject
    /// to retention trimming.
    #[instrument(skip(self, event))]
    pub async fn append_track_event(&self, key: &SessionKey, event: NewTrackEvent) -> Result<SessionTrackEvent> {
        key.validate()?;
        if event.track.is_empty() {
            return Err(SessionError::invalid("track must not be empty"));
        }
        let table = self.table("session_track_events");
        let now = Utc::now();
        let payload_json = serde_json::to_string(&event.payload)?;

        let id = match self.client.engine() {
            Engine::MySql => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (app, user_id, session_id, track, payload, created_at, updated_at, expires_at, deleted_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL)"
                ))
                .bind(&key.app)
                .bind(&key.user)
                .bind(&key.session_id)
                .bind(&event.track)
                .bind(&payload_json)
                .bind(to_millis(now))
                .bind(to_millis(now))
                .execute(self.client.pool())
                .await
                .map_err(SessionError::from)?;

                let id: (i64,) = sqlx::query_as("SELECT LAST_INSERT_ID()")
                    .fetch_one(self.client.pool())
                    .await
                    .map_err(SessionError::from)?;
                id.0
            }
            _ => {
                let id: (i64,) = sqlx::query_as(&format!(
                    "INSERT INTO {table} (app, user_id, session_id, track, payload, created_at, updated_at, expires_at, deleted_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL) RETURNING id"
                ))
                .bind(&key.app)
                .bind(&key.user)
                .bind(&key.session_id)
                .bind(&event.track)
                .bind(&payload_json)
                .bind(to_millis(now))
                .bind(to_millis(now))
                .fetch_one(self.client.pool())
                .await
                .map_err(SessionError::from)?;
                id.0
            }
        };

        Ok(SessionTrackEvent {
            id,
            app: key.app.clone(),
            user: key.user.clone(),
            session_id: key.session_id.clone(),
            track: event.track,
            payload: event.payload,
            created_at: now,
            updated_at: now,
            expires_at: None,
            deleted_at: None,
        })
    }

    /// Lists track events for a session, optionally filtered to one `track`,
    /// ordered by `created_at` ascending.
    #[instrument(skip(self))]
    pub async fn list_track_events(&self, key: &SessionKey, track: Option<&str>) -> Result<Vec<SessionTrackEvent>> {
        key.validate()?;
        let table = self.table("session_track_events");
        let now = to_millis(Utc::now());

        let sql = if track.is_some() {
            format!(
                "SELECT id, app, user_id, session_id, track, payload, created_at, updated_at, expires_at, deleted_at \
                 FROM {table} WHERE app = ? AND user_id = ? AND session_id = ? AND track = ? \
                 AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?) \
                 ORDER BY created_at ASC, id ASC"
            )
        } else {
            format!(
                "SELECT id, app, user_id, session_id, track, payload, created_at, updated_at, expires_at, deleted_at \
                 FROM {table} WHERE app = ? AND user_id = ? AND session_id = ? \
                 AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?) \
                 ORDER BY created_at ASC, id ASC"
            )
        };

        let mut q = sqlx::query(&sql).bind(&key.app).bind(&key.user).bind(&key.session_id);
        if let Some(t) = track {
            q = q.bind(t);
        }
        q = q.bind(now);

        let rows = q.fetch_all(self.client.pool()).await.map_err(SessionError::from)?;
        rows.into_iter().map(row_to_track_event).collect()
    }
}

async fn insert_event_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    engine: Engine,
    table: &str,
    key: &SessionKey,
    filter_key: &str,
    payload_json: &str,
    created_at: i64,
) -> Result<i64> {
    match engine {
        Engine::MySql => {
            sqlx::query(&format!(
                "INSERT INTO {table} (app, user_id, session_id, filter_key, payload, created_at, updated_at, expires_at, deleted_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL)"
            ))
            .bind(&key.app)
            .bind(&key.user)
            .bind(&key.session_id)
            .bind(filter_key)
            .bind(payload_json)
            .bind(created_at)
            .bind(created_at)
            .execute(&mut **tx)
            .await
            .map_err(SessionError::from)?;

            let id: (i64,) = sqlx::query_as("SELECT LAST_INSERT_ID()")
                .fetch_one(&mut **tx)
                .await
                .map_err(SessionError::from)?;
            Ok(id.0)
        }
        _ => {
            let id: (i64,) = sqlx::query_as(&format!(
                "INSERT INTO {table} (app, user_id, session_id, filter_key, payload, created_at, updated_at, expires_at, deleted_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL) RETURNING id"
            ))
            .bind(&key.app)
            .bind(&key.user)
            .bind(&key.session_id)
            .bind(filter_key)
            .bind(payload_json)
            .bind(created_at)
            .bind(created_at)
            .fetch_one(&mut **tx)
            .await
            .map_err(SessionError::from)?;
            Ok(id.0)
        }
    }
}

/// Bounds the per-session event count to `limit` by deleting the oldest
/// surplus rows, ordered by `created_at` with surrogate-id tiebreak.
async fn enforce_retention(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    table: &str,
    key: &SessionKey,
    limit: u32,
) -> Result<()> {
    let count: (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM {table} WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
    ))
    .bind(&key.app)
    .bind(&key.user)
    .bind(&key.session_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(SessionError::from)?;

    let surplus = count.0 - i64::from(limit);
    if surplus <= 0 {
        return Ok(());
    }

    sqlx::query(&format!(
        "DELETE FROM {table} WHERE id IN ( \
            SELECT id FROM {table} WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL \
            ORDER BY created_at ASC, id ASC LIMIT ? \
        )"
    ))
    .bind(&key.app)
    .bind(&key.user)
    .bind(&key.session_id)
    .bind(surplus)
    .execute(&mut **tx)
    .await
    .map_err(SessionError::from)?;
    Ok(())
}

fn row_to_event(row: sqlx::any::AnyRow) -> Result<SessionEvent> {
    let payload_json: String = row.try_get("payload").map_err(SessionError::from)?;
    Ok(SessionEvent {
        id: row.try_get("id").map_err(SessionError::from)?,
        app: row.try_get("app").map_err(SessionError::from)?,
        user: row.try_get("user_id").map_err(SessionError::from)?,
        session_id: row.try_get("session_id").map_err(SessionError::from)?,
        payload: serde_json::from_str(&payload_json)?,
        filter_key: row.try_get("filter_key").map_err(SessionError::from)?,
        created_at: from_millis(row.try_get("created_at").map_err(SessionError::from)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(SessionError::from)?),
        expires_at: opt_from_millis(row.try_get("expires_at").map_err(SessionError::from)?),
        deleted_at: opt_from_millis(row.try_get("deleted_at").map_err(SessionError::from)?),
    })
}

fn row_to_track_event(row: sqlx::any::AnyRow) -> Result<SessionTrackEvent> {
    let payload_json: String = row.try_get("payload").map_err(SessionError::from)?;
    Ok(SessionTrackEvent {
        id: row.try_get("id").map_err(SessionError::from)?,
        app: row.try_get("app").map_err(SessionError::from)?,
        user: row.try_get("user_id").map_err(SessionError::from)?,
        session_id: row.try_get("session_id").map_err(SessionError::from)?,
        track: row.try_get("track").map_err(SessionError::from)?,
        payload: serde_json::from_str(&payload_json)?,
        created_at: from_millis(row.try_get("created_at").map_err(SessionError::from)?),
        updated_at: from_millis(row.try_get("updated_at").map_err(SessionError::from)?),
        expires_at: opt_from_millis(row.try_get("expires_at").map_err(SessionError::from)?),
        deleted_at: opt_from_millis(row.try_get("deleted_at").map_err(SessionError::from)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SqlxClient;
    use crate::schema::init_schema;
    use crate::state_store::StateStore;
    use std::collections::HashMap;

    async fn harness() -> (StateStore, EventLog) {
        let client: Arc<dyn Client> = Arc::new(SqlxClient::connect("sqlite::memory:", 1).await.unwrap());
        init_schema(client.as_ref(), "t").await.unwrap();
        let store = StateStore::new(client.clone(), "t_".to_string(), true, None, None, None);
        let log = EventLog::new(client, "t_".to_string(), 1000);
        (store, log)
    }

    fn event(content: &str) -> NewEvent {
        NewEvent {
            payload: serde_json::json!({ "content": content }),
            filter_key: String::new(),
            state_delta: HashMap::new(),
            partial: false,
        }
    }

    #[tokio::test]
    async fn append_and_list_two_events_in_order() {
        let (store, log) = harness().await;
        let key = SessionKey::new("app", "u", "s1");
        let mut initial = HashMap::new();
        initial.insert("k".to_string(), serde_json::json!("v"));
        store.create_session(&key, initial).await.unwrap();

        log.append_event(&key, event("hi")).await.unwrap();
        log.append_event(&key, event("there")).await.unwrap();

        let events = log.list_events(&key, None, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["content"], "hi");
        assert_eq!(events[1].payload["content"], "there");
    }

    #[tokio::test]
    async fn retention_keeps_only_newest_n() {
        let client: Arc<dyn Client> = Arc::new(SqlxClient::connect("sqlite::memory:", 1).await.unwrap());
        init_schema(client.as_ref(), "t").await.unwrap();
        let store = StateStore::new(client.clone(), "t_".to_string(), true, None, None, None);
        let log = EventLog::new(client, "t_".to_string(), 3);

        let key = SessionKey::new("app", "u", "s1");
        store.create_session(&key, HashMap::new()).await.unwrap();
        for i in 0..5 {
            log.append_event(&key, event(&format!("e{i}"))).await.unwrap();
        }

        let events = log.list_events(&key, None, None).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload["content"], "e2");
        assert_eq!(events[2].payload["content"], "e4");
    }

    #[tokio::test]
    async fn partial_event_updates_state_but_not_log() {
        let (store, log) = harness().await;
        let key = SessionKey::new("app", "u", "s1");
        store.create_session(&key, HashMap::new()).await.unwrap();

        let mut delta = HashMap::new();
        delta.insert("progress".to_string(), serde_json::json!(0.5));
        let partial_event = NewEvent {
            payload: serde_json::Value::Null,
            filter_key: String::new(),
            state_delta: delta,
            partial: true,
        };
        let persisted = log.append_event(&key, partial_event).await.unwrap();
        assert!(persisted.is_none());
        assert_eq!(log.list_events(&key, None, None).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn append_rejects_reserved_prefix_in_state_delta() {
        let (store, log) = harness().await;
        let key = SessionKey::new("app", "u", "s1");
        store.create_session(&key, HashMap::new()).await.unwrap();

        let mut delta = HashMap::new();
        delta.insert("user:locale".to_string(), serde_json::json!("en"));
        let event = NewEvent {
            payload: serde_json::json!({ "content": "hi" }),
            filter_key: String::new(),
            state_delta: delta,
            partial: false,
        };
        let err = log.append_event(&key, event).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn track_events_filter_by_track_and_preserve_order() {
        let (store, log) = harness().await;
        let key = SessionKey::new("app", "u", "s1");
        store.create_session(&key, HashMap::new()).await.unwrap();

        log.append_track_event(&key, NewTrackEvent { track: "llm".to_string(), payload: serde_json::json!("a") })
            .await
            .unwrap();
        log.append_track_event(&key, NewTrackEvent { track: "tool".to_string(), payload: serde_json::json!("b") })
            .await
            .unwrap();
        log.append_track_event(&key, NewTrackEvent { track: "llm".to_string(), payload: serde_json::json!("c") })
            .await
            .unwrap();

        let llm_only = log.list_track_events(&key, Some("llm")).await.unwrap();
        assert_eq!(llm_only.len(), 2);
        assert_eq!(llm_only[0].payload, serde_json::json!("a"));
        assert_eq!(llm_only[1].payload, serde_json::json!("c"));

        let all = log.list_track_events(&key, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
