//! Middleware chains for `AppendEvent` and `GetSession`. Hooks compose in
//! declaration order; a hook that doesn't call `next` short-circuits the
//! chain.
//!
//! The chain threads an `Arc<SessionKey>` rather than a borrowed
//! `&SessionKey` through its continuations. A borrowed key forces the
//! `FnOnce(&SessionKey, ...)` in `Next`'s boxed closure into a higher-ranked
//! bound over the reference's lifetime, which then can't unify with the
//! single concrete lifetime the recursive chain builder needs; an owned,
//! cheaply-cloned key sidesteps that entirely.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::keys::SessionKey;
use crate::models::{GetSessionOptions, NewEvent, Session, SessionEvent};

/// A continuation handed to a hook; calling it runs the remainder of the
/// chain (and, at the end, the real database operation).
pub struct AppendEventNext {
    inner: Box<
        dyn FnOnce(Arc<SessionKey>, NewEvent) -> futures::future::BoxFuture<'static, Result<Option<SessionEvent>>>
            + Send,
    >,
}

impl AppendEventNext {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Arc<SessionKey>, NewEvent) -> futures::future::BoxFuture<'static, Result<Option<SessionEvent>>>
            + Send
            + 'static,
    {
        Self { inner: Box::new(f) }
    }

    pub async fn call(self, key: Arc<SessionKey>, event: NewEvent) -> Result<Option<SessionEvent>> {
        (self.inner)(key, event).await
    }
}

#[async_trait]
pub trait AppendEventHook: Send + Sync {
    async fn handle(
        &self,
        key: Arc<SessionKey>,
        event: NewEvent,
        next: AppendEventNext,
    ) -> Result<Option<SessionEvent>>;
}

pub struct GetSessionNext {
    inner: Box<
        dyn FnOnce(Arc<SessionKey>, GetSessionOptions) -> futures::future::BoxFuture<'static, Result<Option<Session>>>
            + Send,
    >,
}

impl GetSessionNext {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Arc<SessionKey>, GetSessionOptions) -> futures::future::BoxFuture<'static, Result<Option<Session>>>
            + Send
            + 'static,
    {
        Self { inner: Box::new(f) }
    }

    pub async fn call(self, key: Arc<SessionKey>, opts: GetSessionOptions) -> Result<Option<Session>> {
        (self.inner)(key, opts).await
    }
}

#[async_trait]
pub trait GetSessionHook: Send + Sync {
    async fn handle(
        &self,
        key: Arc<SessionKey>,
        opts: GetSessionOptions,
        next: GetSessionNext,
    ) -> Result<Option<Session>>;
}
