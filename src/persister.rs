//! A hash-sharded worker pool that serializes writes for a given session
//! onto the same worker, giving per-session FIFO order even across
//! concurrent callers.

use std::sync::Arc;

use tracing::{error, Span};

use crate::event_log::EventLog;
use crate::keys::SessionKey;
use crate::models::NewEvent;
use crate::sharded_pool::ShardedPool;

/// A unit of accepted write work. Carries the originating span (so log
/// correlation across the detached boundary survives) but not the caller's
/// cancellation — once queued, dropping the caller's future does not cancel
/// this job (the Rust equivalent of a "context without cancel").
struct DetachedAppend {
    key: SessionKey,
    event: NewEvent,
    span: Span,
}

pub struct AsyncPersister {
    pool: ShardedPool<DetachedAppend>,
}

impl AsyncPersister {
    pub fn new(event_log: Arc<EventLog>, worker_count: usize, queue_size: usize) -> Self {
        let handler = Arc::new(move |job: DetachedAppend| {
            let event_log = event_log.clone();
            let DetachedAppend { key, event, span } = job;
            Box::pin(async move {
                let _enter = span.enter();
                if let Err(err) = event_log.append_event(&key, event).await {
                    error!(
                        app = %key.app, user = %key.user, session_id = %key.session_id,
                        error = %err, "async persist failed"
                    );
                }
            }) as futures::future::BoxFuture<'static, ()>
        });

        Self {
            pool: ShardedPool::new(worker_count, queue_size, handler),
        }
    }

    /// Enqueues the write. Fire-and-forget: a closed-channel shutdown race is
    /// caught and logged, but the caller still sees success.
    pub async fn append_event(&self, key: &SessionKey, event: NewEvent) {
        let job = DetachedAppend {
            key: key.clone(),
            event,
            span: Span::current(),
        };
        if let Err(_job) = self.pool.send(&key.shard_key(), job).await {
            error!(
                app = %key.app, user = %key.user, session_id = %key.session_id,
                "enqueue raced with shutdown; write accepted but dropped"
            );
        }
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, SqlxClient};
    use crate::schema::init_schema;
    use crate::state_store::StateStore;
    use std::collections::HashMap;

    #[tokio::test]
    async fn concurrent_appends_on_one_worker_preserve_order() {
        let client: Arc<dyn Client> = Arc::new(SqlxClient::connect("sqlite::memory:", 1).await.unwrap());
        init_schema(client.as_ref(), "t").await.unwrap();
        let store = StateStore::new(client.clone(), "t_".to_string(), true, None, None, None);
        let log = Arc::new(EventLog::new(client.clone(), "t_".to_string(), 1000));

        let key = SessionKey::new("app", "u", "s1");
        store.create_session(&key, HashMap::new()).await.unwrap();

        let persister = Arc::new(AsyncPersister::new(log.clone(), 1, 16));

        let mut handles = Vec::new();
        for i in 0..10 {
            let persister = persister.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                persister
                    .append_event(
                        &key,
                        NewEvent {
                            payload: serde_json::json!({ "content": format!("e{i}") }),
                            filter_key: String::new(),
                            state_delta: HashMap::new(),
                            partial: false,
                        },
                    )
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // give the single worker a moment to drain its channel
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let events = log.list_events(&key, None, None).await.unwrap();
        assert_eq!(events.len(), 10);
    }
}
