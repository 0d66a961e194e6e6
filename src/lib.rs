//! Durable, multi-tenant session store for conversational agent systems.
//!
//! A `Service` owns a connection pool (via the `Client` capability) and
//! exposes state storage, an append-only event log, session assembly,
//! summarization, and expiry cleanup behind one facade. See `DESIGN.md`
//! in this repository for the component-by-component design notes.
//!
//! ```no_run
//! use shannon_sessions::{Service, ServiceOptions, SessionKey};
//! use std::collections::HashMap;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Service::new(ServiceOptions::default().with_dsn("sqlite::memory:")).await?;
//! let key = SessionKey::new("chat-app", "user-42", "");
//! let created = service.create_session(&key, HashMap::new()).await?;
//! println!("created session {}", created.session_id);
//! service.close().await;
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod client;
pub mod cleanup;
pub mod error;
pub mod event_log;
pub mod hooks;
pub mod keys;
pub mod models;
pub mod options;
pub mod persister;
pub mod schema;
pub mod service;
pub mod sharded_pool;
pub mod state_store;
pub mod summary;
mod util;

pub use client::{Client, Engine, SqlxClient};
pub use error::{Result, SessionError};
pub use hooks::{AppendEventHook, AppendEventNext, GetSessionHook, GetSessionNext};
pub use keys::{SessionKey, UserKey};
pub use models::{
    AppStateRow, GetSessionOptions, GetSummaryOptions, NewEvent, NewTrackEvent, Session, SessionEvent,
    SessionStateRow, SessionSummary, SessionTrackEvent, StateMap, UserStateRow,
};
pub use options::ServiceOptions;
pub use service::Service;
pub use summary::Summarizer;
