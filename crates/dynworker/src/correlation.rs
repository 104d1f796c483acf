//! Controller-side correlation: single-shot triggers and durable callbacks.
//!
//! Both tables are keyed by [`CorrelationId`]. A trigger is removed the moment
//! it is activated; a callback registration stays until it is unregistered or
//! the worker terminates.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::bridge::protocol::CorrelationId;

/// Errors surfaced to controller-side callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// No live worker, or the worker went away while the call was pending.
    #[error("worker is closed")]
    WorkerClosed,

    #[error("worker is already closed")]
    AlreadyClosed,

    #[error("worker is already closing")]
    AlreadyClosing,

    #[error("worker is already initialized")]
    AlreadyInitialized,

    #[error("correlation id {0} is already in use")]
    DuplicateId(CorrelationId),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("failed to send message to worker: {0}")]
    Send(String),

    /// The worker answered with `isError`.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Error payload sent back by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    payload: serde_json::Value,
}

impl RemoteError {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }

    pub fn name(&self) -> Option<&str> {
        self.payload.get("name").and_then(serde_json::Value::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.payload
            .get("message")
            .or_else(|| self.payload.get("description"))
            .and_then(serde_json::Value::as_str)
    }

    pub fn stack(&self) -> Option<&str> {
        self.payload.get("stack").and_then(serde_json::Value::as_str)
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.name(), self.message()) {
            (Some(name), Some(message)) => write!(f, "{name}: {message}"),
            (None, Some(message)) => f.write_str(message),
            _ => write!(f, "worker error: {}", self.payload),
        }
    }
}

impl std::error::Error for RemoteError {}

pub type CallOutcome = Result<serde_json::Value, CallError>;

/// Outstanding single-shot calls.
#[derive(Debug, Default)]
pub struct TriggerTable {
    pending: HashMap<CorrelationId, oneshot::Sender<CallOutcome>>,
}

impl TriggerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: CorrelationId,
    ) -> Result<oneshot::Receiver<CallOutcome>, CallError> {
        if self.pending.contains_key(&id) {
            return Err(CallError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        Ok(rx)
    }

    /// Remove and return the trigger for `id`.
    pub fn activate(&mut self, id: &CorrelationId) -> Option<oneshot::Sender<CallOutcome>> {
        self.pending.remove(id)
    }

    /// Settle a trigger. Returns false when nothing was waiting on `id`.
    pub fn settle(&mut self, id: &CorrelationId, outcome: CallOutcome) -> bool {
        match self.activate(id) {
            Some(tx) => {
                // Receiver may have been dropped by the caller
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove every trigger, leaving the table empty.
    pub fn drain(&mut self) -> Vec<oneshot::Sender<CallOutcome>> {
        self.pending.drain().map(|(_, tx)| tx).collect()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Controller function invoked by worker-side callback closures.
pub type CallbackFn = dyn Fn(CallbackInvocation) + Send + Sync;

/// One worker-initiated call of a registered callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackInvocation {
    pub id: CorrelationId,
    pub this_arg: Option<serde_json::Value>,
    pub arguments: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct Registration {
    pub this_arg: Option<serde_json::Value>,
    pub callback: Arc<CallbackFn>,
}

impl Registration {
    pub fn invoke(&self, id: CorrelationId, arguments: Vec<serde_json::Value>) {
        (self.callback)(CallbackInvocation {
            id,
            this_arg: self.this_arg.clone(),
            arguments,
        });
    }
}

#[derive(Default)]
pub struct CallbackRegistry {
    registrations: HashMap<CorrelationId, Registration>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: CorrelationId,
        this_arg: Option<serde_json::Value>,
        callback: Arc<CallbackFn>,
    ) -> Result<(), CallError> {
        if self.registrations.contains_key(&id) {
            return Err(CallError::DuplicateId(id));
        }
        self.registrations
            .insert(id, Registration { this_arg, callback });
        Ok(())
    }

    pub fn lookup(&self, id: &CorrelationId) -> Option<Registration> {
        self.registrations.get(id).cloned()
    }

    /// Drop every registration of `callback`, compared by identity.
    pub fn remove(&mut self, callback: &Arc<CallbackFn>) -> usize {
        let before = self.registrations.len();
        self.registrations.retain(|_, registration| {
            !std::ptr::addr_eq(Arc::as_ptr(&registration.callback), Arc::as_ptr(callback))
        });
        before - self.registrations.len()
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.registrations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}
