//! Plain configuration struct. Deliberately NOT a CLI/env-loading layer —
//! that machinery is an external collaborator, not part of this core. The
//! embedding application constructs a `ServiceOptions` value directly, or
//! via the builder methods below.

use std::sync::Arc;
use std::time::Duration;

use crate::hooks::{AppendEventHook, GetSessionHook};
use crate::summary::Summarizer;

/// Tunables recognized by the core.
#[derive(Clone)]
pub struct ServiceOptions {
    /// Database connection string. Takes precedence over any named instance.
    pub dsn: String,

    /// Table name prefix, validated and normalized by [`crate::keys::validate_table_prefix`].
    pub table_prefix: String,

    /// Max events retained per session. Default 1000.
    pub session_event_limit: u32,

    /// Session row TTL. `None` = never expires.
    pub session_ttl: Option<Duration>,
    /// App-state row TTL. `None` = never expires.
    pub app_state_ttl: Option<Duration>,
    /// User-state row TTL. `None` = never expires.
    pub user_state_ttl: Option<Duration>,

    /// Enable hash-sharded async write workers.
    pub enable_async_persist: bool,
    /// Number of async persist workers. Default 10.
    pub async_persister_num: usize,

    /// Number of async summary workers. Default 3.
    pub async_summary_num: usize,
    /// Bounded queue capacity per summary worker. Default 100.
    pub summary_queue_size: usize,
    /// Per-job timeout for summary generation. `None` = no timeout.
    pub summary_job_timeout: Option<Duration>,

    /// Soft-delete (tombstone) vs. hard delete. Default true.
    pub soft_delete: bool,

    /// Expiry sweep cadence. Default 5 minutes.
    pub cleanup_interval: Duration,

    /// Skip DDL emission/verification on startup.
    pub skip_db_init: bool,

    /// `AppendEvent` middleware chain, applied in declaration order.
    pub append_event_hooks: Vec<Arc<dyn AppendEventHook>>,
    /// `GetSession` middleware chain, applied in declaration order.
    pub get_session_hooks: Vec<Arc<dyn GetSessionHook>>,

    /// Optional LLM summarization provider.
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

impl std::fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("dsn", &"<redacted>")
            .field("table_prefix", &self.table_prefix)
            .field("session_event_limit", &self.session_event_limit)
            .field("session_ttl", &self.session_ttl)
            .field("app_state_ttl", &self.app_state_ttl)
            .field("user_state_ttl", &self.user_state_ttl)
            .field("enable_async_persist", &self.enable_async_persist)
            .field("async_persister_num", &self.async_persister_num)
            .field("async_summary_num", &self.async_summary_num)
            .field("summary_queue_size", &self.summary_queue_size)
            .field("summary_job_timeout", &self.summary_job_timeout)
            .field("soft_delete", &self.soft_delete)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("skip_db_init", &self.skip_db_init)
            .field("append_event_hooks", &self.append_event_hooks.len())
            .field("get_session_hooks", &self.get_session_hooks.len())
            .field("summarizer", &self.summarizer.is_some())
            .finish()
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            table_prefix: "session_".to_string(),
            session_event_limit: 1000,
            session_ttl: None,
            app_state_ttl: None,
            user_state_ttl: None,
            enable_async_persist: false,
            async_persister_num: 10,
            async_summary_num: 3,
            summary_queue_size: 100,
            summary_job_timeout: None,
            soft_delete: true,
            cleanup_interval: Duration::from_secs(5 * 60),
            skip_db_init: false,
            append_event_hooks: Vec::new(),
            get_session_hooks: Vec::new(),
            summarizer: None,
        }
    }
}

impl ServiceOptions {
    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.dsn = dsn.into();
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_session_event_limit(mut self, limit: u32) -> Self {
        self.session_event_limit = limit;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub fn with_app_state_ttl(mut self, ttl: Duration) -> Self {
        self.app_state_ttl = Some(ttl);
        self
    }

    pub fn with_user_state_ttl(mut self, ttl: Duration) -> Self {
        self.user_state_ttl = Some(ttl);
        self
    }

    pub fn with_async_persist(mut self, worker_count: usize) -> Self {
        self.enable_async_persist = true;
        self.async_persister_num = worker_count;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_append_event_hook(mut self, hook: Arc<dyn AppendEventHook>) -> Self {
        self.append_event_hooks.push(hook);
        self
    }

    pub fn with_get_session_hook(mut self, hook: Arc<dyn GetSessionHook>) -> Self {
        self.get_session_hooks.push(hook);
        self
    }

    pub fn with_soft_delete(mut self, soft_delete: bool) -> Self {
        self.soft_delete = soft_delete;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_skip_db_init(mut self, skip: bool) -> Self {
        self.skip_db_init = skip;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let opts = ServiceOptions::default();
        assert_eq!(opts.session_event_limit, 1000);
        assert_eq!(opts.async_persister_num, 10);
        assert_eq!(opts.async_summary_num, 3);
        assert_eq!(opts.summary_queue_size, 100);
        assert!(opts.soft_delete);
        assert_eq!(opts.cleanup_interval, Duration::from_secs(300));
        assert!(!opts.enable_async_persist);
    }

    #[test]
    fn builder_chains() {
        let opts = ServiceOptions::default()
            .with_dsn("sqlite::memory:")
            .with_session_event_limit(50)
            .with_async_persist(4);
        assert_eq!(opts.dsn, "sqlite::memory:");
        assert_eq!(opts.session_event_limit, 50);
        assert!(opts.enable_async_persist);
        assert_eq!(opts.async_persister_num, 4);
    }
}
