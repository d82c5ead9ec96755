//! Inbound message handlers, keyed by the payload's `type` field.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub type HandlerResult = anyhow::Result<Value>;

/// Handles application messages of one `type`.
///
/// The returned value becomes the reply payload when the sender is waiting
/// for one; an error becomes a `HANDLER_FAILED` reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value, from: String) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Value, String) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: Value, from: String) -> HandlerResult {
        (self)(payload, from).await
    }
}

/// Adapter that decodes the payload into `T` and encodes the reply from `R`
pub struct Typed<T, R, F> {
    f: F,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R, F> Typed<T, R, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, R, F, Fut> MessageHandler for Typed<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T, String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    async fn handle(&self, payload: Value, from: String) -> HandlerResult {
        let request: T = serde_json::from_value(payload)
            .context("Payload does not match the handler's message type")?;
        let reply = (self.f)(request, from).await?;
        Ok(serde_json::to_value(reply)?)
    }
}

/// Handlers registered on a client
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerTable {
    /// Register a handler, returning the one it replaced
    pub fn insert(
        &self,
        message_type: String,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type, handler)
    }

    pub fn remove(&self, message_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(message_type)
            .is_some()
    }

    pub fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
    }
}
