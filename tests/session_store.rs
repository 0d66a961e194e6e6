//! End-to-end scenarios against the `Service` facade, backed by an
//! in-process SQLite database. Mirrors the component-level tests colocated
//! with each module, but exercises the public facade surface a caller
//! actually uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shannon_sessions::{
    GetSessionOptions, NewEvent, NewTrackEvent, SessionError, SessionKey, SessionTrackEvent, Service, ServiceOptions,
    Summarizer,
};

fn options(prefix: &str) -> ServiceOptions {
    ServiceOptions::default().with_dsn("sqlite::memory:").with_table_prefix(prefix)
}

fn event(content: &str) -> NewEvent {
    NewEvent {
        payload: serde_json::json!({ "content": content }),
        filter_key: String::new(),
        state_delta: HashMap::new(),
        partial: false,
    }
}

/// Scenario 1: create a session, append two events, and read them back in
/// insertion order.
#[tokio::test]
async fn create_append_list_preserves_order() {
    let service = Service::new(options("s1")).await.unwrap();
    let key = SessionKey::new("app", "user-1", "conv-1");

    service.create_session(&key, HashMap::new()).await.unwrap();
    service.append_event(&key, event("hello")).await.unwrap();
    service.append_event(&key, event("world")).await.unwrap();

    let session = service.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
    assert_eq!(session.events.len(), 2);
    assert_eq!(session.events[0].payload["content"], "hello");
    assert_eq!(session.events[1].payload["content"], "world");

    service.close().await;
}

/// Scenario 2: a session-event retention limit of 3 trims five appends down
/// to the three newest.
#[tokio::test]
async fn retention_limit_keeps_newest_events_only() {
    let mut opts = options("s2");
    opts.session_event_limit = 3;
    let service = Service::new(opts).await.unwrap();
    let key = SessionKey::new("app", "user-1", "conv-2");
    service.create_session(&key, HashMap::new()).await.unwrap();

    for i in 0..5 {
        service.append_event(&key, event(&format!("e{i}"))).await.unwrap();
    }

    let session = service.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
    assert_eq!(session.events.len(), 3);
    assert_eq!(session.events[0].payload["content"], "e2");
    assert_eq!(session.events[2].payload["content"], "e4");

    service.close().await;
}

/// Scenario 3: `CreateSession` against a still-live session fails with
/// `AlreadyExists`; after the TTL expires, a subsequent create revives the
/// slot instead of failing.
#[tokio::test]
async fn create_rejects_live_duplicate_then_revives_after_expiry() {
    let mut opts = options("s3");
    opts.session_ttl = Some(Duration::from_millis(5));
    let service = Service::new(opts).await.unwrap();
    let key = SessionKey::new("app", "user-1", "conv-3");

    let first = service.create_session(&key, HashMap::new()).await.unwrap();
    let err = service.create_session(&key, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyExists(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;

    let revived = service.create_session(&key, HashMap::new()).await.unwrap();
    assert!(revived.created_at >= first.created_at);

    service.close().await;
}

/// Scenario 4: an `UpdateSessionState` delta using the reserved `app:`/
/// `user:` prefixes is rejected.
#[tokio::test]
async fn update_session_state_rejects_reserved_prefix() {
    let service = Service::new(options("s4")).await.unwrap();
    let key = SessionKey::new("app", "user-1", "conv-4");
    service.create_session(&key, HashMap::new()).await.unwrap();

    let mut delta = HashMap::new();
    delta.insert("app:theme".to_string(), serde_json::json!("dark"));
    let err = service.update_session_state(&key, delta).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)));

    service.close().await;
}

struct EchoSummarizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for EchoSummarizer {
    async fn summarize(&self, _key: &SessionKey, events: &[shannon_sessions::SessionEvent]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} events summarized", events.len()))
    }

    fn should_summarize(&self, events: &[shannon_sessions::SessionEvent]) -> bool {
        !events.is_empty()
    }

    fn set_prompt(&self, _prompt: String) {}
    fn set_model(&self, _model: String) {}
    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Scenario 5: forcing a branch summary cascades into writing both the
/// branch-filtered row and the full-session row.
#[tokio::test]
async fn forced_branch_summary_cascades_to_full_session_row() {
    let summarizer = Arc::new(EchoSummarizer { calls: AtomicUsize::new(0) });
    let opts = options("s5").with_summarizer(summarizer.clone());
    let service = Service::new(opts).await.unwrap();
    let key = SessionKey::new("app", "user-1", "conv-5");
    service.create_session(&key, HashMap::new()).await.unwrap();

    service
        .append_event(
            &key,
            NewEvent {
                payload: serde_json::json!({ "content": "search query" }),
                filter_key: "tool-use".to_string(),
                state_delta: HashMap::new(),
                partial: false,
            },
        )
        .await
        .unwrap();
    service.append_event(&key, event("plain chat")).await.unwrap();

    service.create_session_summary(&key, "tool-use", true).await.unwrap();

    let session = service.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
    let branch = service
        .get_session_summary_text(&session, shannon_sessions::GetSummaryOptions { filter_key: "tool-use".to_string() })
        .await
        .unwrap();
    let full = service
        .get_session_summary_text(&session, shannon_sessions::GetSummaryOptions::default())
        .await
        .unwrap();
    assert!(branch.is_some());
    assert!(full.is_some());

    service.close().await;
}

/// Scenario 6: with a single async-persist worker, concurrently submitted
/// writes for one session still land in submission order.
#[tokio::test]
async fn single_worker_async_persist_preserves_order() {
    let mut opts = options("s6");
    opts.enable_async_persist = true;
    opts.async_persister_num = 1;
    let service = Arc::new(Service::new(opts).await.unwrap());
    let key = SessionKey::new("app", "user-1", "conv-6");
    service.create_session(&key, HashMap::new()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let service = service.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            service.append_event(&key, event(&format!("m{i}"))).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let session = service.get_session(&key, GetSessionOptions::default()).await.unwrap().unwrap();
    let contents: Vec<String> = session
        .events
        .iter()
        .map(|e| e.payload["content"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
    assert_eq!(contents, expected);
}

/// Track events are independent of the retention-bound event log and can be
/// filtered by track.
#[tokio::test]
async fn track_events_round_trip_through_service() {
    let service = Service::new(options("s7")).await.unwrap();
    let key = SessionKey::new("app", "user-1", "conv-7");
    service.create_session(&key, HashMap::new()).await.unwrap();

    service
        .append_track_event(&key, NewTrackEvent { track: "llm-call".to_string(), payload: serde_json::json!({"model": "x"}) })
        .await
        .unwrap();
    service
        .append_track_event(&key, NewTrackEvent { track: "tool-call".to_string(), payload: serde_json::json!({"tool": "y"}) })
        .await
        .unwrap();

    let llm_events: Vec<SessionTrackEvent> = service.list_track_events(&key, Some("llm-call")).await.unwrap();
    assert_eq!(llm_events.len(), 1);
    assert_eq!(llm_events[0].payload["model"], "x");

    let all = service.list_track_events(&key, None).await.unwrap();
    assert_eq!(all.len(), 2);

    service.close().await;
}
