//! Session Assembler: composes a session view (state merge + events +
//! summaries) for reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use sqlx::Row;
use tracing::{error, instrument};

use crate::client::Client;
use crate::error::Result;
use crate::event_log::EventLog;
use crate::keys::{SessionKey, UserKey, APP_STATE_PREFIX, USER_STATE_PREFIX};
use crate::models::{GetSessionOptions, Session};
use crate::state_store::StateStore;
use crate::summary::SummaryEngine;
use crate::util::{from_millis, to_millis};

pub struct SessionAssembler {
    client: Arc<dyn Client>,
    state_store: Arc<StateStore>,
    event_log: Arc<EventLog>,
    summary_engine: Arc<SummaryEngine>,
    prefix: String,
    session_ttl: Option<Duration>,
}

impl SessionAssembler {
    pub fn new(
        client: Arc<dyn Client>,
        state_store: Arc<StateStore>,
        event_log: Arc<EventLog>,
        summary_engine: Arc<SummaryEngine>,
        prefix: String,
        session_ttl: Option<Duration>,
    ) -> Self {
        Self {
            client,
            state_store,
            event_log,
            summary_engine,
            prefix,
            session_ttl,
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    #[instrument(skip(self))]
    pub async fn get_session(&self, key: &SessionKey, opts: GetSessionOptions) -> Result<Option<Session>> {
        key.validate()?;
        let table = self.table("session_states");
        let now = to_millis(Utc::now());

        let row: Option<(String, i64, i64)> = sqlx::query_as(&format!(
            "SELECT state, created_at, updated_at FROM {table} \
             WHERE app = ? AND user_id = ? AND session_id = ? \
             AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?)"
        ))
        .bind(&key.app)
        .bind(&key.user)
        .bind(&key.session_id)
        .bind(now)
        .fetch_optional(self.client.pool())
        .await
        .map_err(crate::error::SessionError::from)?;

        let Some((state_json, created_at_ms, updated_at_ms)) = row else {
            return Ok(None);
        };

        let mut state: crate::models::StateMap = serde_json::from_str(&state_json)?;

        let app_states = self.state_store.list_app_states(&key.app).await?;
        for s in app_states {
            state.insert(format!("{APP_STATE_PREFIX}{}", s.key_name), serde_json::Value::String(s.value));
        }
        let user_states = self
            .state_store
            .list_user_states(&UserKey::new(key.app.clone(), key.user.clone()))
            .await?;
        for s in user_states {
            state.insert(format!("{USER_STATE_PREFIX}{}", s.key_name), serde_json::Value::String(s.value));
        }

        let events = self
            .event_log
            .list_events(key, opts.event_num, opts.event_time)
            .await?;

        let summaries = Arc::new(RwLock::new(HashMap::new()));
        self.summary_engine.warm_cache(key, from_millis(created_at_ms), &summaries).await?;

        let session = Session {
            app: key.app.clone(),
            user: key.user.clone(),
            session_id: key.session_id.clone(),
            state,
            events,
            created_at: from_millis(created_at_ms),
            updated_at: from_millis(updated_at_ms),
            summaries,
        };

        if let Some(ttl) = self.session_ttl {
            self.spawn_ttl_refresh(key.clone(), ttl);
        }

        Ok(Some(session))
    }

    /// Best-effort, fire-and-forget refresh of `expires_at` on read. Errors
    /// are logged, never surfaced to the caller.
    fn spawn_ttl_refresh(&self, key: SessionKey, ttl: Duration) {
        let client = self.client.clone();
        let table = self.table("session_states");
        tokio::spawn(async move {
            let new_expiry = to_millis(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());
            let result = sqlx::query(&format!(
                "UPDATE {table} SET expires_at = ? WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
            ))
            .bind(new_expiry)
            .bind(&key.app)
            .bind(&key.user)
            .bind(&key.session_id)
            .execute(client.pool())
            .await;
            if let Err(err) = result {
                error!(app = %key.app, user = %key.user, session_id = %key.session_id, error = %err, "TTL refresh failed");
            }
        });
    }

    /// `ListSessions`: loads app/user state once, enumerates active sessions
    /// for the user, then batch-loads events and summaries across all of them.
    #[instrument(skip(self))]
    pub async fn list_sessions(&self, user_key: &UserKey) -> Result<Vec<Session>> {
        user_key.validate()?;
        let table = self.table("session_states");
        let now = to_millis(Utc::now());

        let rows = sqlx::query(&format!(
            "SELECT session_id, state, created_at, updated_at FROM {table} \
             WHERE app = ? AND user_id = ? AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?)"
        ))
        .bind(&user_key.app)
        .bind(&user_key.user)
        .bind(now)
        .fetch_all(self.client.pool())
        .await
        .map_err(crate::error::SessionError::from)?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let app_states = self.state_store.list_app_states(&user_key.app).await?;
        let user_states = self.state_store.list_user_states(user_key).await?;

        let mut session_ids = Vec::with_capacity(rows.len());
        let mut base: HashMap<String, (crate::models::StateMap, i64, i64)> = HashMap::new();
        for row in rows {
            let session_id: String = row.try_get("session_id").map_err(crate::error::SessionError::from)?;
            let state_json: String = row.try_get("state").map_err(crate::error::SessionError::from)?;
            let created_at: i64 = row.try_get("created_at").map_err(crate::error::SessionError::from)?;
            let updated_at: i64 = row.try_get("updated_at").map_err(crate::error::SessionError::from)?;
            let state: crate::models::StateMap = serde_json::from_str(&state_json)?;
            session_ids.push(session_id.clone());
            base.insert(session_id, (state, created_at, updated_at));
        }

        let events_by_session = self
            .event_log
            .list_events_batch(&user_key.app, &user_key.user, &session_ids)
            .await?;

        let mut sessions = Vec::with_capacity(session_ids.len());
        for session_id in session_ids {
            let (mut state, created_at_ms, updated_at_ms) = base.remove(&session_id).unwrap();
            for s in &app_states {
                state.insert(format!("{APP_STATE_PREFIX}{}", s.key_name), serde_json::Value::String(s.value.clone()));
            }
            for s in &user_states {
                state.insert(format!("{USER_STATE_PREFIX}{}", s.key_name), serde_json::Value::String(s.value.clone()));
            }
            let events = events_by_session.get(&session_id).cloned().unwrap_or_default();
            let summaries = Arc::new(RwLock::new(HashMap::new()));
            let key = SessionKey::new(user_key.app.clone(), user_key.user.clone(), session_id.clone());
            self.summary_engine.warm_cache(&key, from_millis(created_at_ms), &summaries).await?;

            sessions.push(Session {
                app: user_key.app.clone(),
                user: user_key.user.clone(),
                session_id,
                state,
                events,
                created_at: from_millis(created_at_ms),
                updated_at: from_millis(updated_at_ms),
                summaries,
            });
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SqlxClient;
    use crate::schema::init_schema;
    use std::collections::HashMap as StdHashMap;

    async fn harness() -> SessionAssembler {
        let client: Arc<dyn Client> = Arc::new(SqlxClient::connect("sqlite::memory:", 1).await.unwrap());
        init_schema(client.as_ref(), "t").await.unwrap();
        let store = Arc::new(StateStore::new(client.clone(), "t_".to_string(), true, None, None, None));
        let log = Arc::new(EventLog::new(client.clone(), "t_".to_string(), 1000));
        let summary = Arc::new(SummaryEngine::new(client.clone(), "t_".to_string(), log.clone(), None));
        SessionAssembler::new(client, store.clone(), log, summary, "t_".to_string(), None)
    }

    #[tokio::test]
    async fn get_session_merges_app_and_user_namespaces() {
        let assembler = harness().await;
        let store = StateStore::new(
            assembler.client.clone(),
            "t_".to_string(),
            true,
            None,
            None,
            None,
        );
        let key = SessionKey::new("app", "u", "s1");
        let mut init = StdHashMap::new();
        init.insert("own".to_string(), serde_json::json!("v"));
        store.create_session(&key, init).await.unwrap();
        store.update_app_state("app", "theme", "dark").await.unwrap();
        store
            .update_user_state(&UserKey::new("app", "u"), "locale", "en")
            .await
            .unwrap();

        let session = assembler.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
        assert_eq!(session.state["own"], "v");
        assert_eq!(session.state["app:theme"], "dark");
        assert_eq!(session.state["user:locale"], "en");
    }
}
