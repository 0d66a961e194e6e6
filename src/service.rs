//! The top-level facade: owns the options struct, component wiring, schema
//! init, worker pools, cleanup ticker, and graceful shutdown. Modeled on
//! `shannon-api::database::workflow_store::WorkflowStore`'s CRUD surface
//! shape and `agent-core::memory::MemoryPool`'s sweeper lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::assembler::SessionAssembler;
use crate::client::{Client, SqlxClient};
use crate::error::Result;
use crate::event_log::EventLog;
use crate::hooks::{AppendEventHook, AppendEventNext, GetSessionHook, GetSessionNext};
use crate::keys::{validate_table_prefix, SessionKey, UserKey};
use crate::models::{
    AppStateRow, GetSessionOptions, GetSummaryOptions, NewEvent, Session, SessionEvent, SessionStateRow, StateMap,
    UserStateRow,
};
use crate::options::ServiceOptions;
use crate::persister::AsyncPersister;
use crate::schema::init_schema;
use crate::state_store::StateStore;
use crate::summary::SummaryEngine;

/// Default connection pool size when the caller doesn't need to tune it.
const DEFAULT_POOL_SIZE: u32 = 10;
/// Bounded queue depth per async-persist worker, sized to absorb a burst
/// without unbounded memory growth. Noted as a fixed implementation
/// constant in DESIGN.md.
const PERSIST_QUEUE_SIZE: usize = 256;

/// Durable, multi-tenant session store. The single entry point embedding
/// applications construct; every other component in this crate is reached
/// through it.
pub struct Service {
    client: Arc<dyn Client>,
    state_store: Arc<StateStore>,
    event_log: Arc<EventLog>,
    assembler: Arc<SessionAssembler>,
    summary_engine: Arc<SummaryEngine>,
    persister: Option<Arc<AsyncPersister>>,
    cleanup: Option<crate::cleanup::CleanupScheduler>,
    append_event_hooks: Arc<Vec<Arc<dyn AppendEventHook>>>,
    get_session_hooks: Arc<Vec<Arc<dyn GetSessionHook>>>,
}

impl Service {
    /// Connects, optionally initializes/verifies the schema, and wires every
    /// component from the given options.
    pub async fn new(options: ServiceOptions) -> Result<Self> {
        let prefix = validate_table_prefix(&options.table_prefix)?;
        let client: Arc<dyn Client> = Arc::new(SqlxClient::connect(&options.dsn, DEFAULT_POOL_SIZE).await?);

        if !options.skip_db_init {
            init_schema(client.as_ref(), &prefix).await?;
        } else {
            info!("skip_db_init set, schema initialization skipped");
        }

        let state_store = Arc::new(StateStore::new(
            client.clone(),
            prefix.clone(),
            options.soft_delete,
            options.session_ttl,
            options.app_state_ttl,
            options.user_state_ttl,
        ));

        let event_log = Arc::new(
            EventLog::new(client.clone(), prefix.clone(), options.session_event_limit)
                .with_session_ttl(options.session_ttl),
        );

        let mut summary_engine = SummaryEngine::new(client.clone(), prefix.clone(), event_log.clone(), options.summarizer.clone());
        if options.async_summary_num > 0 {
            summary_engine = summary_engine.with_async_queue(
                options.async_summary_num,
                options.summary_queue_size,
                options.summary_job_timeout,
            );
        }
        let summary_engine = Arc::new(summary_engine);

        let assembler = Arc::new(SessionAssembler::new(
            client.clone(),
            state_store.clone(),
            event_log.clone(),
            summary_engine.clone(),
            prefix.clone(),
            options.session_ttl,
        ));

        let persister = options.enable_async_persist.then(|| {
            Arc::new(AsyncPersister::new(
                event_log.clone(),
                options.async_persister_num,
                PERSIST_QUEUE_SIZE,
            ))
        });

        let any_ttl = options.session_ttl.is_some() || options.app_state_ttl.is_some() || options.user_state_ttl.is_some();
        let cleanup = any_ttl.then(|| {
            crate::cleanup::CleanupScheduler::spawn(
                client.clone(),
                prefix.clone(),
                options.soft_delete,
                options.cleanup_interval,
            )
        });

        Ok(Self {
            client,
            state_store,
            event_log,
            assembler,
            summary_engine,
            persister,
            cleanup,
            append_event_hooks: Arc::new(options.append_event_hooks),
            get_session_hooks: Arc::new(options.get_session_hooks),
        })
    }

    // ---- State Store surface --------------------------------------------

    pub async fn create_session(&self, key: &SessionKey, initial_state: StateMap) -> Result<SessionStateRow> {
        self.state_store.create_session(key, initial_state).await
    }

    pub async fn update_session_state(&self, key: &SessionKey, delta: StateMap) -> Result<SessionStateRow> {
        self.state_store.update_session_state(key, delta).await
    }

    pub async fn update_app_state(&self, app: &str, key_name: &str, value: &str) -> Result<()> {
        self.state_store.update_app_state(app, key_name, value).await
    }

    pub async fn update_user_state(&self, key: &UserKey, key_name: &str, value: &str) -> Result<()> {
        self.state_store.update_user_state(key, key_name, value).await
    }

    pub async fn list_app_states(&self, app: &str) -> Result<Vec<AppStateRow>> {
        self.state_store.list_app_states(app).await
    }

    pub async fn list_user_states(&self, key: &UserKey) -> Result<Vec<UserStateRow>> {
        self.state_store.list_user_states(key).await
    }

    pub async fn delete_app_state(&self, app: &str, key_name: &str) -> Result<()> {
        self.state_store.delete_app_state(app, key_name).await
    }

    pub async fn delete_user_state(&self, key: &UserKey, key_name: &str) -> Result<()> {
        self.state_store.delete_user_state(key, key_name).await
    }

    pub async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        self.state_store.delete_session(key).await
    }

    // ---- Hook-wrapped write/read paths ------------------------------------

    /// Runs the `AppendEvent` hook chain, dispatching to the sync path or
    /// the hash-sharded async persister per `enableAsyncPersist`, then
    /// best-effort enqueues summary generation for the event's filter key.
    pub async fn append_event(&self, key: &SessionKey, event: NewEvent) -> Result<Option<SessionEvent>> {
        key.validate()?;
        let filter_key = event.filter_key.clone();
        let executed = Arc::new(AtomicBool::new(false));

        let result = {
            let executed = executed.clone();
            let event_log = self.event_log.clone();
            let persister = self.persister.clone();
            let terminal: TerminalAppend = Box::new(move |key: Arc<SessionKey>, event: NewEvent| {
                let executed = executed.clone();
                let event_log = event_log.clone();
                let persister = persister.clone();
                Box::pin(async move {
                    executed.store(true, Ordering::SeqCst);
                    match persister {
                        // Detached: the persister's worker body runs
                        // independently of this future being dropped.
                        Some(persister) => {
                            persister.append_event(&key, event).await;
                            Ok(None)
                        }
                        None => event_log.append_event(&key, event).await,
                    }
                })
            });

            run_append_chain(self.append_event_hooks.clone(), 0, Arc::new(key.clone()), event, Arc::new(terminal)).await
        };

        if executed.load(Ordering::SeqCst) {
            if let Err(err) = self.summary_engine.enqueue_summary_job(key, &filter_key, false).await {
                warn!(
                    app = %key.app, user = %key.user, session_id = %key.session_id,
                    error = %err, "summary enqueue failed after append_event"
                );
            }
        }

        result
    }

    /// Runs the `GetSession` hook chain around `SessionAssembler::get_session`.
    pub async fn get_session(&self, key: &SessionKey, opts: GetSessionOptions) -> Result<Option<Session>> {
        key.validate()?;
        let assembler = self.assembler.clone();
        let terminal: TerminalGet = Box::new(move |key: Arc<SessionKey>, opts: GetSessionOptions| {
            let assembler = assembler.clone();
            Box::pin(async move { assembler.get_session(&key, opts).await })
        });

        run_get_chain(self.get_session_hooks.clone(), 0, Arc::new(key.clone()), opts, Arc::new(terminal)).await
    }

    pub async fn list_sessions(&self, user_key: &UserKey) -> Result<Vec<Session>> {
        self.assembler.list_sessions(user_key).await
    }

    // ---- Summary Engine surface -------------------------------------------

    pub async fn create_session_summary(&self, key: &SessionKey, filter_key: &str, force: bool) -> Result<()> {
        self.summary_engine.create_session_summary(key, filter_key, force).await
    }

    pub async fn enqueue_summary_job(&self, key: &SessionKey, filter_key: &str, force: bool) -> Result<()> {
        self.summary_engine.enqueue_summary_job(key, filter_key, force).await
    }

    pub async fn get_session_summary_text(&self, session: &Session, opts: GetSummaryOptions) -> Result<Option<String>> {
        let key = SessionKey::new(session.app.clone(), session.user.clone(), session.session_id.clone());
        self.summary_engine
            .get_session_summary_text(&key, &opts, session.created_at, &session.summaries)
            .await
    }

    // ---- Event Log track-event surface ------------------------------------

    pub async fn append_track_event(
        &self,
        key: &SessionKey,
        event: crate::models::NewTrackEvent,
    ) -> Result<crate::models::SessionTrackEvent> {
        self.event_log.append_track_event(key, event).await
    }

    pub async fn list_track_events(
        &self,
        key: &SessionKey,
        track: Option<&str>,
    ) -> Result<Vec<crate::models::SessionTrackEvent>> {
        self.event_log.list_track_events(key, track).await
    }

    /// Graceful shutdown: stops the cleanup ticker, closes the async-persist
    /// and summary worker channels and waits for them to drain, then closes
    /// the database pool.
    pub async fn close(self) {
        let Service {
            client,
            assembler,
            summary_engine,
            persister,
            cleanup,
            ..
        } = self;

        if let Some(cleanup) = cleanup {
            cleanup.shutdown().await;
        }
        if let Some(persister) = persister {
            match Arc::try_unwrap(persister) {
                Ok(persister) => persister.shutdown().await,
                Err(_) => error!("async persister still referenced at shutdown; workers left running"),
            }
        }

        // The assembler holds its own clone of `summary_engine`; drop it
        // first so the Arc below unwraps cleanly.
        drop(assembler);
        match Arc::try_unwrap(summary_engine) {
            Ok(engine) => engine.shutdown().await,
            Err(_) => error!("summary engine still referenced at shutdown; workers left running"),
        }
        client.close().await;
    }
}

type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
type TerminalAppend = Box<dyn Fn(Arc<SessionKey>, NewEvent) -> BoxFuture<'static, Result<Option<SessionEvent>>> + Send + Sync>;
type TerminalGet = Box<dyn Fn(Arc<SessionKey>, GetSessionOptions) -> BoxFuture<'static, Result<Option<Session>>> + Send + Sync>;

/// Builds and invokes the `AppendEvent` hook chain: hooks compose in
/// declaration order, each deciding whether to call `next()`. Recursion
/// bottoms out at `terminal`, the actual sync/async write.
///
/// The key is threaded as an `Arc<SessionKey>` rather than a borrowed
/// reference — see the note on `hooks::AppendEventNext` for why a borrowed
/// key doesn't typecheck through this continuation-passing recursion.
fn run_append_chain(
    hooks: Arc<Vec<Arc<dyn AppendEventHook>>>,
    pos: usize,
    key: Arc<SessionKey>,
    event: NewEvent,
    terminal: Arc<TerminalAppend>,
) -> BoxFuture<'static, Result<Option<SessionEvent>>> {
    if pos >= hooks.len() {
        return Box::pin(async move { terminal(key, event).await });
    }
    let hook = hooks[pos].clone();
    Box::pin(async move {
        let next = AppendEventNext::new(move |key: Arc<SessionKey>, event: NewEvent| {
            run_append_chain(hooks, pos + 1, key, event, terminal.clone())
        });
        hook.handle(key, event, next).await
    })
}

fn run_get_chain(
    hooks: Arc<Vec<Arc<dyn GetSessionHook>>>,
    pos: usize,
    key: Arc<SessionKey>,
    opts: GetSessionOptions,
    terminal: Arc<TerminalGet>,
) -> BoxFuture<'static, Result<Option<Session>>> {
    if pos >= hooks.len() {
        return Box::pin(async move { terminal(key, opts).await });
    }
    let hook = hooks[pos].clone();
    Box::pin(async move {
        let next = GetSessionNext::new(move |key: Arc<SessionKey>, opts: GetSessionOptions| {
            run_get_chain(hooks, pos + 1, key, opts, terminal.clone())
        });
        hook.handle(key, opts, next).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn opts(dsn: &str) -> ServiceOptions {
        ServiceOptions::default().with_dsn(dsn).with_table_prefix("svc")
    }

    #[tokio::test]
    async fn create_append_get_round_trip() {
        let service = Service::new(opts("sqlite::memory:")).await.unwrap();
        let key = SessionKey::new("app", "u", "s1");

        let mut initial = HashMap::new();
        initial.insert("k".to_string(), serde_json::json!("v"));
        service.create_session(&key, initial).await.unwrap();

        service
            .append_event(
                &key,
                NewEvent {
                    payload: serde_json::json!({ "content": "hi" }),
                    filter_key: String::new(),
                    state_delta: HashMap::new(),
                    partial: false,
                },
            )
            .await
            .unwrap();
        service
            .append_event(
                &key,
                NewEvent {
                    payload: serde_json::json!({ "content": "there" }),
                    filter_key: String::new(),
                    state_delta: HashMap::new(),
                    partial: false,
                },
            )
            .await
            .unwrap();

        let session = service.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
        assert_eq!(session.state["k"], "v");
        assert_eq!(session.events.len(), 2);
        assert_eq!(session.events[0].payload["content"], "hi");
        assert_eq!(session.events[1].payload["content"], "there");

        service.close().await;
    }

    #[tokio::test]
    async fn create_on_live_session_fails_already_exists() {
        let service = Service::new(opts("sqlite::memory:")).await.unwrap();
        let key = SessionKey::new("app", "u", "dup");
        service.create_session(&key, HashMap::new()).await.unwrap();
        let err = service.create_session(&key, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, crate::error::SessionError::AlreadyExists(_)));
        service.close().await;
    }

    #[tokio::test]
    async fn async_persist_preserves_submission_order_on_one_worker() {
        let mut options = opts("sqlite::memory:");
        options.enable_async_persist = true;
        options.async_persister_num = 1;
        let service = Service::new(options).await.unwrap();
        let key = SessionKey::new("app", "u", "async1");
        service.create_session(&key, HashMap::new()).await.unwrap();

        for i in 0..5 {
            service
                .append_event(
                    &key,
                    NewEvent {
                        payload: serde_json::json!({ "content": format!("e{i}") }),
                        filter_key: String::new(),
                        state_delta: HashMap::new(),
                        partial: false,
                    },
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let session = service.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
        let contents: Vec<_> = session.events.iter().map(|e| e.payload["content"].clone()).collect();
        assert_eq!(
            contents,
            vec!["e0", "e1", "e2", "e3", "e4"].into_iter().map(serde_json::Value::from).collect::<Vec<_>>()
        );

        service.close().await;
    }

    struct SkipAllAppends;
    #[async_trait::async_trait]
    impl AppendEventHook for SkipAllAppends {
        async fn handle(
            &self,
            _key: Arc<SessionKey>,
            _event: NewEvent,
            _next: AppendEventNext,
        ) -> Result<Option<SessionEvent>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn append_event_hook_can_skip_the_write() {
        let mut options = opts("sqlite::memory:");
        options.append_event_hooks.push(Arc::new(SkipAllAppends));
        let service = Service::new(options).await.unwrap();
        let key = SessionKey::new("app", "u", "skip1");
        service.create_session(&key, HashMap::new()).await.unwrap();

        service
            .append_event(
                &key,
                NewEvent {
                    payload: serde_json::json!({ "content": "hi" }),
                    filter_key: String::new(),
                    state_delta: HashMap::new(),
                    partial: false,
                },
            )
            .await
            .unwrap();

        let session = service.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
        assert!(session.events.is_empty(), "hook should have skipped the write entirely");
        service.close().await;
    }
}
