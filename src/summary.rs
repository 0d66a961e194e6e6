//! Generates, persists, and retrieves session summaries; manages the
//! cascade and filter-key fallback rules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::Row;
use tracing::{error, instrument, warn};

use crate::client::Client;
use crate::error::{Result, SessionError};
use crate::event_log::EventLog;
use crate::keys::SessionKey;
use crate::models::{GetSummaryOptions, SessionEvent, SessionSummary};
use crate::sharded_pool::ShardedPool;
use crate::util::{from_millis, to_millis};

/// The `Summarizer` capability: an LLM-backed summarization provider.
/// Assumed, not implemented, by this crate.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, key: &SessionKey, events: &[SessionEvent]) -> anyhow::Result<String>;
    fn should_summarize(&self, events: &[SessionEvent]) -> bool;
    fn set_prompt(&self, prompt: String);
    fn set_model(&self, model: String);
    fn metadata(&self) -> HashMap<String, String>;
}

struct SummaryJob {
    key: SessionKey,
    filter_key: String,
    force: bool,
}

pub struct SummaryEngine {
    client: Arc<dyn Client>,
    prefix: String,
    summarizer: Option<Arc<dyn Summarizer>>,
    event_log: Arc<EventLog>,
    pool: Option<ShardedPool<SummaryJob>>,
}

impl SummaryEngine {
    pub fn new(
        client: Arc<dyn Client>,
        prefix: String,
        event_log: Arc<EventLog>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        Self {
            client,
            prefix,
            summarizer,
            event_log,
            pool: None,
        }
    }

    /// Enables the async summary queue: N workers, hash-sharded by session,
    /// with an optional per-job timeout.
    pub fn with_async_queue(mut self, worker_count: usize, queue_size: usize, job_timeout: Option<Duration>) -> Self {
        let client = self.client.clone();
        let prefix = self.prefix.clone();
        let summarizer = self.summarizer.clone();
        let event_log_for_worker = self.event_log.clone();

        let handler = Arc::new(move |job: SummaryJob| {
            let client = client.clone();
            let prefix = prefix.clone();
            let summarizer = summarizer.clone();
            let event_log = event_log_for_worker.clone();
            Box::pin(async move {
                let fut = generate_and_persist(&client, &prefix, &event_log, summarizer.as_deref(), &job.key, &job.filter_key, job.force);
                let outcome = match job_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                        SessionError::Internal("summary job timed out".to_string())
                    }).and_then(|inner| inner),
                    None => fut.await,
                };
                if let Err(err) = outcome {
                    error!(
                        app = %job.key.app, user = %job.key.user, session_id = %job.key.session_id,
                        error = %err, "summary job failed"
                    );
                }
            }) as futures::future::BoxFuture<'static, ()>
        });

        self.pool = Some(ShardedPool::new(worker_count, queue_size, handler));
        self
    }

    #[instrument(skip(self))]
    pub async fn create_session_summary(&self, key: &SessionKey, filter_key: &str, force: bool) -> Result<()> {
        generate_and_persist(&self.client, &self.prefix, &self.event_log, self.summarizer.as_deref(), key, filter_key, force).await
    }

    /// Non-blocking enqueue; falls back to synchronous generation (with
    /// cascade) on queue-full or when no async queue is configured.
    #[instrument(skip(self))]
    pub async fn enqueue_summary_job(&self, key: &SessionKey, filter_key: &str, force: bool) -> Result<()> {
        if let Some(pool) = &self.pool {
            let job = SummaryJob {
                key: key.clone(),
                filter_key: filter_key.to_string(),
                force,
            };
            if pool.try_send(&key.shard_key(), job).is_ok() {
                return Ok(());
            }
            warn!(app = %key.app, user = %key.user, session_id = %key.session_id, "summary queue full, falling back to sync");
        }
        self.create_session_summary(key, filter_key, force).await
    }

    /// Populates `cache` with the summaries currently visible for `key`,
    /// applying the same `updated_at >= session_created_at` anti-leak clause
    /// as the read path so a revived session never sees pre-delete summaries.
    pub async fn warm_cache(
        &self,
        key: &SessionKey,
        session_created_at: DateTime<Utc>,
        cache: &Arc<RwLock<HashMap<String, SessionSummary>>>,
    ) -> Result<()> {
        let table = self.table("session_summaries");
        let now = to_millis(Utc::now());
        let created_at_ms = to_millis(session_created_at);
        let rows = sqlx::query(&format!(
            "SELECT filter_key, summary, topics, updated_at, expires_at, deleted_at FROM {table} \
             WHERE app = ? AND user_id = ? AND session_id = ? \
             AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?) AND updated_at >= ?"
        ))
        .bind(&key.app)
        .bind(&key.user)
        .bind(&key.session_id)
        .bind(now)
        .bind(created_at_ms)
        .fetch_all(self.client.pool())
        .await
        .map_err(SessionError::from)?;

        let mut guard = cache.write();
        for row in rows {
            let summary = row_to_summary(row, key)?;
            guard.insert(summary.filter_key.clone(), summary);
        }
        Ok(())
    }

    /// Read path: cache first, then DB filtered by
    /// `updated_at >= session.created_at`, falling back to the full-session
    /// summary when a branch summary is absent.
    #[instrument(skip(self, cache))]
    pub async fn get_session_summary_text(
        &self,
        key: &SessionKey,
        opts: &GetSummaryOptions,
        session_created_at: DateTime<Utc>,
        cache: &Arc<RwLock<HashMap<String, SessionSummary>>>,
    ) -> Result<Option<String>> {
        if let Some(summary) = cache.read().get(&opts.filter_key) {
            if !summary.summary.is_empty() {
                return Ok(Some(summary.summary.clone()));
            }
        }

        if let Some(text) = self.query_summary_text(key, &opts.filter_key, session_created_at).await? {
            return Ok(Some(text));
        }

        if !opts.filter_key.is_empty() {
            return self.query_summary_text(key, "", session_created_at).await;
        }
        Ok(None)
    }

    async fn query_summary_text(
        &self,
        key: &SessionKey,
        filter_key: &str,
        session_created_at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let table = self.table("session_summaries");
        let now = to_millis(Utc::now());
        let created_at_ms = to_millis(session_created_at);

        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT summary FROM {table} WHERE app = ? AND user_id = ? AND session_id = ? AND filter_key = ? \
             AND deleted_at IS NULL AND (expires_at IS NULL OR expires_at > ?) AND updated_at >= ?"
        ))
        .bind(&key.app)
        .bind(&key.user)
        .bind(&key.session_id)
        .bind(filter_key)
        .bind(now)
        .bind(created_at_ms)
        .fetch_optional(self.client.pool())
        .await
        .map_err(SessionError::from)?;

        Ok(row.and_then(|(text,)| if text.is_empty() { None } else { Some(text) }))
    }

    fn table(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    pub async fn shutdown(self) {
        if let Some(pool) = self.pool {
            pool.shutdown().await;
        }
    }
}

/// Generates (if summarizable or forced) and persists a summary, applying
/// the cascade rule when `filter_key != ""`.
async fn generate_and_persist(
    client: &Arc<dyn Client>,
    prefix: &str,
    event_log: &EventLog,
    summarizer: Option<&dyn Summarizer>,
    key: &SessionKey,
    filter_key: &str,
    force: bool,
) -> Result<()> {
    let Some(summarizer) = summarizer else {
        return Ok(());
    };

    let events = event_log.list_events(key, None, None).await?;
    if !force && !summarizer.should_summarize(&events) {
        return Ok(());
    }

    let relevant: Vec<&SessionEvent> = if filter_key.is_empty() {
        events.iter().collect()
    } else {
        events.iter().filter(|e| e.filter_key == filter_key).collect()
    };
    let relevant_owned: Vec<SessionEvent> = relevant.into_iter().cloned().collect();

    let text = summarizer
        .summarize(key, &relevant_owned)
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?;

    upsert_summary(client, prefix, key, filter_key, &text).await?;

    if !filter_key.is_empty() {
        let all_same_filter = !events.is_empty() && events.iter().all(|e| e.filter_key == filter_key);
        if all_same_filter {
            // Single-filter optimization: reuse the branch summary text for the
            // full-session row rather than regenerating it.
            upsert_summary(client, prefix, key, "", &text).await?;
        } else {
            // Cascade: independently (re)generate the full-session summary.
            let full_text = summarizer
                .summarize(key, &events)
                .await
                .map_err(|e| SessionError::Internal(e.to_string()))?;
            upsert_summary(client, prefix, key, "", &full_text).await?;
        }
    }

    Ok(())
}

/// Atomic upsert on `(app, user, session_id, filter_key)`, reviving any
/// tombstoned row.
async fn upsert_summary(client: &Arc<dyn Client>, prefix: &str, key: &SessionKey, filter_key: &str, text: &str) -> Result<()> {
    let table = format!("{prefix}session_summaries");
    let now = to_millis(Utc::now());

    let affected = sqlx::query(&format!(
        "UPDATE {table} SET summary = ?, topics = ?, updated_at = ?, deleted_at = NULL \
         WHERE app = ? AND user_id = ? AND session_id = ? AND filter_key = ?"
    ))
    .bind(text)
    .bind("[]")
    .bind(now)
    .bind(&key.app)
    .bind(&key.user)
    .bind(&key.session_id)
    .bind(filter_key)
    .execute(client.pool())
    .await
    .map_err(SessionError::from)?
    .rows_affected();

    if affected == 0 {
        sqlx::query(&format!(
            "INSERT INTO {table} (app, user_id, session_id, filter_key, summary, topics, updated_at, expires_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL)"
        ))
        .bind(&key.app)
        .bind(&key.user)
        .bind(&key.session_id)
        .bind(filter_key)
        .bind(text)
        .bind("[]")
        .bind(now)
        .execute(client.pool())
        .await
        .map_err(SessionError::from)?;
    }
    Ok(())
}

fn row_to_summary(row: sqlx::any::AnyRow, key: &SessionKey) -> Result<SessionSummary> {
    let topics_json: String = row.try_get("topics").map_err(SessionError::from)?;
    Ok(SessionSummary {
        app: key.app.clone(),
        user: key.user.clone(),
        session_id: key.session_id.clone(),
        filter_key: row.try_get("filter_key").map_err(SessionError::from)?,
        summary: row.try_get("summary").map_err(SessionError::from)?,
        topics: serde_json::from_str(&topics_json).unwrap_or_default(),
        updated_at: from_millis(row.try_get("updated_at").map_err(SessionError::from)?),
        expires_at: crate::util::opt_from_millis(row.try_get("expires_at").map_err(SessionError::from)?),
        deleted_at: crate::util::opt_from_millis(row.try_get("deleted_at").map_err(SessionError::from)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SqlxClient;
    use crate::schema::init_schema;
    use crate::state_store::StateStore;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    struct StubSummarizer {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Summarizer for StubSummarizer {
        async fn summarize(&self, _key: &SessionKey, events: &[SessionEvent]) -> anyhow::Result<String> {
            *self.calls.lock().unwrap() += 1;
            Ok(format!("summary of {} events", events.len()))
        }

        fn should_summarize(&self, events: &[SessionEvent]) -> bool {
            !events.is_empty()
        }

        fn set_prompt(&self, _prompt: String) {}
        fn set_model(&self, _model: String) {}
        fn metadata(&self) -> HashMap<String, String> {
            HashMap::new()
        }
    }

    async fn harness(summarizer: Arc<dyn Summarizer>) -> (Arc<dyn Client>, StateStore, Arc<EventLog>, SummaryEngine) {
        let client: Arc<dyn Client> = Arc::new(SqlxClient::connect("sqlite::memory:", 1).await.unwrap());
        init_schema(client.as_ref(), "t").await.unwrap();
        let store = StateStore::new(client.clone(), "t_".to_string(), true, None, None, None);
        let log = Arc::new(EventLog::new(client.clone(), "t_".to_string(), 1000));
        let engine = SummaryEngine::new(client.clone(), "t_".to_string(), log.clone(), Some(summarizer));
        (client, store, log, engine)
    }

    #[tokio::test]
    async fn cascade_writes_branch_and_full_session_rows() {
        let summarizer = Arc::new(StubSummarizer { calls: Mutex::new(0) });
        let (_client, store, log, engine) = harness(summarizer).await;

        let key = SessionKey::new("app", "u", "s1");
        store.create_session(&key, StdHashMap::new()).await.unwrap();
        for i in 0..2 {
            log.append_event(
                &key,
                crate::models::NewEvent {
                    payload: serde_json::json!({ "content": format!("e{i}") }),
                    filter_key: "tool-use".to_string(),
                    state_delta: StdHashMap::new(),
                    partial: false,
                },
            )
            .await
            .unwrap();
        }

        engine.enqueue_summary_job(&key, "tool-use", false).await.unwrap();

        let table = "t_session_summaries";
        let rows: Vec<(String,)> = sqlx::query_as(&format!("SELECT filter_key FROM {table}"))
            .fetch_all(engine.client.pool())
            .await
            .unwrap();
        let mut filter_keys: Vec<String> = rows.into_iter().map(|(f,)| f).collect();
        filter_keys.sort();
        assert_eq!(filter_keys, vec!["".to_string(), "tool-use".to_string()]);
    }

    #[tokio::test]
    async fn revived_session_does_not_see_old_summary() {
        let summarizer = Arc::new(StubSummarizer { calls: Mutex::new(0) });
        let (_client, store, log, engine) = harness(summarizer).await;

        let key = SessionKey::new("app", "u", "s1");
        let created = store.create_session(&key, StdHashMap::new()).await.unwrap();
        log.append_event(
            &key,
            crate::models::NewEvent {
                payload: serde_json::json!({ "content": "hi" }),
                filter_key: String::new(),
                state_delta: StdHashMap::new(),
                partial: false,
            },
        )
        .await
        .unwrap();
        engine.create_session_summary(&key, "", false).await.unwrap();

        store.delete_session(&key).await.unwrap();
        let revived = store.create_session(&key, StdHashMap::new()).await.unwrap();
        assert!(revived.created_at >= created.created_at);

        let cache = Arc::new(RwLock::new(HashMap::new()));
        let opts = GetSummaryOptions::default();
        let text = engine
            .get_session_summary_text(&key, &opts, revived.created_at, &cache)
            .await
            .unwrap();
        assert!(text.is_none());
    }
}
