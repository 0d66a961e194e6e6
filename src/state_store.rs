//! CRUD for app/user/session state with TTL and soft-delete.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::client::Client;
use crate::error::{Result, SessionError};
use crate::keys::{validate_state_delta_keys, SessionKey, UserKey};
use crate::models::{AppStateRow, SessionStateRow, StateMap, UserStateRow};
use crate::util::{from_millis, opt_from_millis, to_millis};

pub struct StateStore {
    client: Arc<dyn Client>,
    prefix: String,
    soft_delete: bool,
    session_ttl: Option<Duration>,
    app_state_ttl: Option<Duration>,
    user_state_ttl: Option<Duration>,
}

impl StateStore {
    pub fn new(
        client: Arc<dyn Client>,
        prefix: String,
        soft_delete: bool,
        session_ttl: Option<Duration>,
        app_state_ttl: Option<Duration>,
        user_state_ttl: Option<Duration>,
    ) -> Self {
        Self {
            client,
            prefix,
            soft_delete,
            session_ttl,
            app_state_ttl,
            user_state_ttl,
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    /// A freshly generated opaque session identifier, used when the caller
    /// passes an empty `session_id` to `create_session`.
    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    #[instrument(skip(self, initial_state))]
    pub async fn create_session(
        &self,
        key: &SessionKey,
        initial_state: StateMap,
    ) -> Result<SessionStateRow> {
        let session_id = if key.session_id.is_empty() {
            Self::generate_session_id()
        } else {
            key.session_id.clone()
        };
        let resolved_key = SessionKey::new(key.app.clone(), key.user.clone(), session_id);
        resolved_key.validate()?;

        let table = self.table("session_states");
        let now = Utc::now();

        let existing: Option<(i64, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT id, expires_at FROM {table} WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
        ))
        .bind(&resolved_key.app)
        .bind(&resolved_key.user)
        .bind(&resolved_key.session_id)
        .fetch_optional(self.client.pool())
        .await
        .map_err(SessionError::from)?;

        if let Some((id, expires_at)) = existing {
            let expired = expires_at.is_some_and(|e| from_millis(e) <= now);
            if !expired {
                return Err(SessionError::AlreadyExists(format!(
                    "session {}/{}/{} already exists",
                    resolved_key.app, resolved_key.user, resolved_key.session_id
                )));
            }
            debug!(id, "reviving expired session slot before recreate");
            self.cascade_delete_session(&resolved_key).await?;
        }

        let state_json = serde_json::to_string(&initial_state)?;
        let expires_at = self.session_ttl.map(|ttl| to_millis(now + chrono::Duration::from_std(ttl).unwrap_or_default()));

        let id = self
            .insert_session_row(&table, &resolved_key, &state_json, to_millis(now), expires_at)
            .await?;

        Ok(SessionStateRow {
            id,
            app: resolved_key.app,
            user: resolved_key.user,
            session_id: resolved_key.session_id,
            state: initial_state,
            created_at: now,
            updated_at: now,
            expires_at: opt_from_millis(expires_at),
            deleted_at: None,
        })
    }

    /// Inserts a new `session_states` row and returns its id. Postgres and
    /// recent SQLite support `RETURNING id`; MySQL does not, so that branch
    /// falls back to `LAST_INSERT_ID()` within the same connection.
    async fn insert_session_row(
        &self,
        table: &str,
        key: &SessionKey,
        state_json: &str,
        created_at: i64,
        expires_at: Option<i64>,
    ) -> Result<i64> {
        match self.client.engine() {
            crate::client::Engine::MySql => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (app, user_id, session_id, state, created_at, updated_at, expires_at, deleted_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, NULL)"
                ))
                .bind(&key.app)
                .bind(&key.user)
                .bind(&key.session_id)
                .bind(state_json)
                .bind(created_at)
                .bind(created_at)
                .bind(expires_at)
                .execute(self.client.pool())
                .await
                .map_err(SessionError::from)?;

                let id: (i64,) = sqlx::query_as("SELECT LAST_INSERT_ID()")
                    .fetch_one(self.client.pool())
                    .await
                    .map_err(SessionError::from)?;
                Ok(id.0)
            }
            _ => {
                let id: (i64,) = sqlx::query_as(&format!(
                    "INSERT INTO {table} (app, user_id, session_id, state, created_at, updated_at, expires_at, deleted_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, NULL) RETURNING id"
                ))
                .bind(&key.app)
                .bind(&key.user)
                .bind(&key.session_id)
                .bind(state_json)
                .bind(created_at)
                .bind(created_at)
                .bind(expires_at)
                .fetch_one(self.client.pool())
                .await
                .map_err(SessionError::from)?;
                Ok(id.0)
            }
        }
    }

    #[instrument(skip(self, delta))]
    pub async fn update_session_state(
        &self,
        key: &SessionKey,
        delta: StateMap,
    ) -> Result<SessionStateRow> {
        key.validate()?;
        validate_state_delta_keys(delta.keys())?;

        let table = self.table("session_states");
        let row: Option<(i64, String, i64)> = sqlx::query_as(&format!(
            "SELECT id, state, created_at FROM {table} \
             WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
        ))
        .bind(&key.app)
        .bind(&key.user)
        .bind(&key.session_id)
        .fetch_optional(self.client.pool())
        .await
        .map_err(SessionError::from)?;

        let (id, state_json, created_at_ms) = row.ok_or_else(|| {
            SessionError::not_found(format!(
                "session {}/{}/{} not found",
                key.app, key.user, key.session_id
            ))
        })?;

        let mut state: StateMap = serde_json::from_str(&state_json)?;
        state.extend(delta);

        let now = Utc::now();
        let expires_at = self
            .session_ttl
            .map(|ttl| to_millis(now + chrono::Duration::from_std(ttl).unwrap_or_default()));
        let new_state_json = serde_json::to_string(&state)?;

        sqlx::query(&format!(
            "UPDATE {table} SET state = ?, updated_at = ?, expires_at = ? \
             WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(&new_state_json)
        .bind(to_millis(now))
        .bind(expires_at)
        .bind(id)
        .execute(self.client.pool())
        .await
        .map_err(SessionError::from)?;

        Ok(SessionStateRow {
            id,
            app: key.app.clone(),
            user: key.user.clone(),
            session_id: key.session_id.clone(),
            state,
            created_at: from_millis(created_at_ms),
            updated_at: now,
            expires_at: opt_from_millis(expires_at),
            deleted_at: None,
        })
    }

    #[instrument(skip(self, value))]
    pub async fn update_app_state(&self, app: &str, key_name: &str, value: &str) -> Result<()> {
        if app.is_empty() || key_name.is_empty() {
            return Err(SessionError::invalid("app and key_name must not be empty"));
        }
        let table = self.table("app_states");
        let now = Utc::now();
        let expires_at = self
            .app_state_ttl
            .map(|ttl| to_millis(now + chrono::Duration::from_std(ttl).unwrap_or_default()));

        self.upsert_kv(&table, &[("app", app)], key_name, value, to_millis(now), expires_at)
            .await
    }

    #[instrument(skip(self, value))]
    pub async fn update_user_state(&self, key: &UserKey, key_name: &str, value: &str) -> Result<()> {
        key.validate()?;
        if key_name.is_empty() {
            return Err(SessionError::invalid("key_name must not be empty"));
        }
        let table = self.table("user_states");
        let now = Utc::now();
        let expires_at = self
            .user_state_ttl
            .map(|ttl| to_millis(now + chrono::Duration::from_std(ttl).unwrap_or_default()));

        self.upsert_kv(
            &table,
            &[("app", key.app.as_str()), ("user_id", key.user.as_str())],
            key_name,
            value,
            to_millis(now),
            expires_at,
        )
        .await
    }

    /// Select-then-update-or-insert with revive-on-write: clears
    /// `deleted_at` on update rather than depending on the unique index to
    /// reject a stale tombstone, since `NULL != NULL` would otherwise allow
    /// duplicate "active" rows on engines without partial-index support.
    async fn upsert_kv(
        &self,
        table: &str,
        scope: &[(&str, &str)],
        key_name: &str,
        value: &str,
        updated_at: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let scope_cols: Vec<String> = scope.iter().map(|(c, _)| format!("{c} = ?")).collect();
        let where_clause = scope_cols.join(" AND ");

        let mut update_q = sqlx::query(&format!(
            "UPDATE {table} SET value = ?, updated_at = ?, expires_at = ?, deleted_at = NULL \
             WHERE {where_clause} AND key_name = ?"
        ))
        .bind(value)
        .bind(updated_at)
        .bind(expires_at);
        for (_, v) in scope {
            update_q = update_q.bind(*v);
        }
        update_q = update_q.bind(key_name);

        let affected = update_q.execute(self.client.pool()).await.map_err(SessionError::from)?.rows_affected();
        if affected > 0 {
            return Ok(());
        }

        let scope_names: Vec<&str> = scope.iter().map(|(c, _)| *c).collect();
        let insert_cols = format!("{}, key_name, value, updated_at, expires_at, deleted_at", scope_names.join(", "));
        let placeholders = std::iter::repeat("?")
            .take(scope.len() + 4)
            .collect::<Vec<_>>()
            .join(", ");

        let mut insert_q = sqlx::query(&format!(
            "INSERT INTO {table} ({insert_cols}) VALUES ({placeholders}, NULL)"
        ));
        for (_, v) in scope {
            insert_q = insert_q.bind(*v);
        }
        insert_q = insert_q.bind(key_name).bind(value).bind(updated_at).bind(expires_at);

        match insert_q.execute(self.client.pool()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                // Lost a race with a concurrent insert; the row now exists, retry the update.
                let mut retry_q = sqlx::query(&format!(
                    "UPDATE {table} SET value = ?, updated_at = ?, expires_at = ?, deleted_at = NULL \
                     WHERE {where_clause} AND key_name = ?"
                ))
                .bind(value)
                .bind(updated_at)
                .bind(expires_at);
                for (_, v) in scope {
                    retry_q = retry_q.bind(*v);
                }
                retry_q.bind(key_name).execute(self.client.pool()).await.map_err(SessionError::from)?;
                Ok(())
            }
        }
    }

    pub async fn list_app_states(&self, app: &str) -> Result<Vec<AppStateRow>> {
        let table = self.table("app_states");
        let now = to_millis(Utc::now());
        let rows = sqlx::query(&format!(
            "SELECT app, key_name, value, updated_at, expires_at, deleted_at FROM {table} \
             WHERE app = ? AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?)"
        ))
        .bind(app)
        .bind(now)
        .fetch_all(self.client.pool())
        .await
        .map_err(SessionError::from)?;

        rows.into_iter().map(row_to_app_state).collect()
    }

    pub async fn list_user_states(&self, key: &UserKey) -> Result<Vec<UserStateRow>> {
        key.validate()?;
        let table = self.table("user_states");
        let now = to_millis(Utc::now());
        let rows = sqlx::query(&format!(
            "SELECT app, user_id, key_name, value, updated_at, expires_at, deleted_at FROM {table} \
             WHERE app = ? AND user_id = ? AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?)"
        ))
        .bind(&key.app)
        .bind(&key.user)
        .bind(now)
        .fetch_all(self.client.pool())
        .await
        .map_err(SessionError::from)?;

        rows.into_iter().map(row_to_user_state).collect()
    }

    pub async fn delete_app_state(&self, app: &str, key_name: &str) -> Result<()> {
        let table = self.table("app_states");
        self.delete_row(&table, &[("app", app)], Some(key_name)).await
    }

    pub async fn delete_user_state(&self, key: &UserKey, key_name: &str) -> Result<()> {
        key.validate()?;
        let table = self.table("user_states");
        self.delete_row(&table, &[("app", key.app.as_str()), ("user_id", key.user.as_str())], Some(key_name))
            .await
    }

    async fn delete_row(&self, table: &str, scope: &[(&str, &str)], key_name: Option<&str>) -> Result<()> {
        let mut where_parts: Vec<String> = scope.iter().map(|(c, _)| format!("{c} = ?")).collect();
        if key_name.is_some() {
            where_parts.push("key_name = ?".to_string());
        }
        let where_clause = where_parts.join(" AND ");

        let sql = if self.soft_delete {
            format!("UPDATE {table} SET deleted_at = ? WHERE {where_clause} AND deleted_at IS NULL")
        } else {
            format!("DELETE FROM {table} WHERE {where_clause}")
        };

        let mut q = sqlx::query(&sql);
        if self.soft_delete {
            q = q.bind(to_millis(Utc::now()));
        }
        for (_, v) in scope {
            q = q.bind(*v);
        }
        if let Some(k) = key_name {
            q = q.bind(k);
        }
        q.execute(self.client.pool()).await.map_err(SessionError::from)?;
        Ok(())
    }

    /// Deletes (soft or hard, per config) the session row and cascades to
    /// its events, track events, and summaries in one transaction.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        key.validate()?;
        self.cascade_delete_session(key).await
    }

    async fn cascade_delete_session(&self, key: &SessionKey) -> Result<()> {
        let states = self.table("session_states");
        let events = self.table("session_events");
        let track_events = self.table("session_track_events");
        let summaries = self.table("session_summaries");

        let mut tx = self.client.pool().begin().await.map_err(SessionError::from)?;
        let now = to_millis(Utc::now());

        for (table, extra_cols) in [
            (states.as_str(), ""),
            (events.as_str(), ""),
            (track_events.as_str(), ""),
            (summaries.as_str(), ""),
        ] {
            let _ = extra_cols;
            let sql = if self.soft_delete {
                format!(
                    "UPDATE {table} SET deleted_at = ? WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
                )
            } else {
                format!("DELETE FROM {table} WHERE app = ? AND user_id = ? AND session_id = ?")
            };
            let mut q = sqlx::query(&sql);
            if self.soft_delete {
                q = q.bind(now);
            }
            q.bind(&key.app)
                .bind(&key.user)
                .bind(&key.session_id)
                .execute(&mut *tx)
                .await
                .map_err(SessionError::from)?;
        }

        tx.commit().await.map_err(SessionError::from)?;
        Ok(())
    }
}

fn row_to_app_state(row: sqlx::any::AnyRow) -> Result<AppStateRow> {
    Ok(AppStateRow {
        app: row.try_get("app").map_err(SessionError::from)?,
        key_name: row.try_get("key_name").map_err(SessionError::from)?,
        value: row.try_get("value").map_err(SessionError::from)?,
        updated_at: from_millis(row.try_get("updated_at").map_err(SessionError::from)?),
        expires_at: opt_from_millis(row.try_get("expires_at").map_err(SessionError::from)?),
        deleted_at: opt_from_millis(row.try_get("deleted_at").map_err(SessionError::from)?),
    })
}

fn row_to_user_state(row: sqlx::any::AnyRow) -> Result<UserStateRow> {
    Ok(UserStateRow {
        app: row.try_get("app").map_err(SessionError::from)?,
        user: row.try_get("user_id").map_err(SessionError::from)?,
        key_name: row.try_get("key_name").map_err(SessionError::from)?,
        value: row.try_get("value").map_err(SessionError::from)?,
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
    use std::collections::HashMap;

    async fn test_store() -> StateStore {
        let client = Arc::new(SqlxClient::connect("sqlite::memory:", 1).await.unwrap());
        init_schema(client.as_ref(), "t").await.unwrap();
        StateStore::new(client, "t_".to_string(), true, None, None, None)
    }

    #[tokio::test]
    async fn create_then_duplicate_fails() {
        let store = test_store().await;
        let key = SessionKey::new("app", "u", "s1");
        let mut state = HashMap::new();
        state.insert("k".to_string(), serde_json::json!("v"));
        store.create_session(&key, state.clone()).await.unwrap();

        let err = store.create_session(&key, state).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_rejects_reserved_prefix() {
        let store = test_store().await;
        let key = SessionKey::new("app", "u", "s1");
        store.create_session(&key, HashMap::new()).await.unwrap();

        let mut delta = HashMap::new();
        delta.insert("app:foo".to_string(), serde_json::json!("v"));
        let err = store.update_session_state(&key, delta).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn app_state_upsert_is_idempotent() {
        let store = test_store().await;
        store.update_app_state("app", "flag", "on").await.unwrap();
        store.update_app_state("app", "flag", "on").await.unwrap();
        let states = store.list_app_states("app").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].value, "on");
    }
}
