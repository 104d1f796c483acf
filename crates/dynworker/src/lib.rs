//! dynworker: promise-style remote invocation against a detached worker.
//!
//! The controller posts JSON requests naming properties and functions in the
//! worker's scope; the worker evaluates them and answers over a framed pipe.

pub mod bridge;
pub mod client;
pub mod correlation;
pub mod fault;
pub mod interpreter;
pub mod options;
pub mod scope;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use bridge::protocol::{CLOSED_MARKER, CorrelationId, Header, Response};
pub use client::{
    CallbackDescriptor, ClientConfig, CloseFuture, LifecycleState, ResponseFuture, SpawnError,
    TaskSpawner, ThreadSpawner, WorkerClient, WorkerProcess, WorkerSpawner,
};
pub use correlation::{CallError, CallOutcome, CallbackFn, CallbackInvocation, RemoteError};
pub use fault::{Fault, FaultKind};
pub use interpreter::{DENY_LIST, Interpreter};
pub use options::Options;
pub use scope::{Deferred, Function, Object, Outcome, Property, Value};
pub use worker::{ScriptRegistry, WorkerConfig, run_worker};
