//! Cleanup Scheduler: a ticker-driven sweep across all six tables, deleting
//! (soft or hard, per config) rows whose `expires_at` has passed. Session
//! expiry cascades to that session's events, track events, and summaries in
//! one transaction, the same cascade `StateStore::delete_session` performs
//! for an explicit delete. Modeled on `agent-core::memory::MemoryPool`'s
//! sweeper: an `interval.tick()` / shutdown-oneshot `tokio::select!` loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::client::Client;
use crate::error::{Result, SessionError};
use crate::util::to_millis;

pub struct CleanupScheduler {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupScheduler {
    /// Spawns the sweep loop. Sweep errors are logged and swallowed;
    /// correctness still rests on the transactional writes in State Store /
    /// Event Log.
    pub fn spawn(client: Arc<dyn Client>, prefix: String, soft_delete: bool, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_once(client.as_ref(), &prefix, soft_delete).await {
                            error!(error = %err, "cleanup sweep failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("cleanup scheduler shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// One sweep pass: expire sessions (cascading to their events/track
/// events/summaries), then sweep app-state and user-state rows independently
/// (they have no session to cascade from).
#[instrument(skip(client))]
pub async fn sweep_once(client: &dyn Client, prefix: &str, soft_delete: bool) -> Result<()> {
    let expired_sessions = expired_session_keys(client, prefix).await?;
    let session_count = expired_sessions.len();
    for (app, user, session_id) in expired_sessions {
        cascade_expire_session(client, prefix, soft_delete, &app, &user, &session_id).await?;
    }

    let app_states = sweep_simple_table(client, prefix, "app_states", soft_delete).await?;
    let user_states = sweep_simple_table(client, prefix, "user_states", soft_delete).await?;

    if session_count > 0 || app_states > 0 || user_states > 0 {
        info!(
            sessions = session_count,
            app_states, user_states, "cleanup sweep expired rows"
        );
    }
    Ok(())
}

async fn expired_session_keys(client: &dyn Client, prefix: &str) -> Result<Vec<(String, String, String)>> {
    let table = format!("{prefix}session_states");
    let now = to_millis(chrono::Utc::now());
    let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
        "SELECT app, user_id, session_id FROM {table} \
         WHERE deleted_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?"
    ))
    .bind(now)
    .fetch_all(client.pool())
    .await
    .map_err(SessionError::from)?;
    Ok(rows)
}

/// Mirrors `StateStore::cascade_delete_session`'s tombstone-or-remove across
/// the four session-scoped tables, but triggered by expiry rather than an
/// explicit `DeleteSession` call.
async fn cascade_expire_session(
    client: &dyn Client,
    prefix: &str,
    soft_delete: bool,
    app: &str,
    user: &str,
    session_id: &str,
) -> Result<()> {
    let tables = [
        format!("{prefix}session_states"),
        format!("{prefix}session_events"),
        format!("{prefix}session_track_events"),
        format!("{prefix}session_summaries"),
    ];

    let mut tx = client.pool().begin().await.map_err(SessionError::from)?;
    let now = to_millis(chrono::Utc::now());

    for table in &tables {
        let sql = if soft_delete {
            format!(
                "UPDATE {table} SET deleted_at = ? WHERE app = ? AND user_id = ? AND session_id = ? AND deleted_at IS NULL"
            )
        } else {
            format!("DELETE FROM {table} WHERE app = ? AND user_id = ? AND session_id = ?")
        };
        let mut q = sqlx::query(&sql);
        if soft_delete {
            q = q.bind(now);
        }
        q.bind(app)
            .bind(user)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(SessionError::from)?;
    }

    tx.commit().await.map_err(SessionError::from)?;
    Ok(())
}

/// Expires rows in a table with no session to cascade to (`app_states`,
/// `user_states`), returning the number of rows affected.
async fn sweep_simple_table(client: &dyn Client, prefix: &str, name: &str, soft_delete: bool) -> Result<u64> {
    let table = format!("{prefix}{name}");
    let now = to_millis(chrono::Utc::now());

    let sql = if soft_delete {
        format!("UPDATE {table} SET deleted_at = ? WHERE deleted_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?")
    } else {
        format!("DELETE FROM {table} WHERE expires_at IS NOT NULL AND expires_at <= ?")
    };

    let mut q = sqlx::query(&sql);
    if soft_delete {
        q = q.bind(now).bind(now);
    } else {
        q = q.bind(now);
    }
    let affected = q.execute(client.pool()).await.map_err(SessionError::from)?.rows_affected();
    Ok(affected)
}
