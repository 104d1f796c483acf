//! Controller side - correlation and lifecycle for one worker.
//!
//! Flow:
//! 1. `init` spawns a worker on a fresh pipe and starts the dispatcher
//! 2. `post_message` registers a trigger, then queues the frame
//! 3. Dispatcher routes each response to its trigger or callback
//! 4. `close` runs the graceful handshake; `terminate` tears everything down
//!
//! States: Uninitialized → Ready → Closing → Terminated. `terminate` is
//! reachable from Ready and Closing, and `init` may start a new worker once
//! the previous one has terminated.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::protocol::{self, CorrelationId, Header, Response};
use crate::bridge::transport::{ChildTransport, MessageWriter, ResponseReader, create_transport};
use crate::correlation::{
    CallError, CallOutcome, CallbackFn, CallbackRegistry, RemoteError, TriggerTable,
};
use crate::options::{self, Options};
use crate::worker::{WorkerConfig, run_worker};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("no tokio runtime available to host the worker")]
    NoRuntime,
    #[error("failed to spawn worker thread: {0}")]
    Thread(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Handle on a spawned worker.
#[derive(Debug)]
pub struct WorkerProcess {
    handle: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Worker that cannot be aborted from here. It exits when the pipe closes.
    pub fn detached() -> Self {
        Self { handle: None }
    }

    fn kill(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Extension point for different worker hosting strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        config: Arc<WorkerConfig>,
        transport: ChildTransport,
    ) -> Result<WorkerProcess, SpawnError>;
}

/// Runs each worker as a task on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskSpawner;

impl WorkerSpawner for TaskSpawner {
    fn spawn(
        &self,
        config: Arc<WorkerConfig>,
        transport: ChildTransport,
    ) -> Result<WorkerProcess, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SpawnError::NoRuntime)?;
        let handle = runtime.spawn(async move {
            if let Err(e) = run_worker(config, transport).await {
                tracing::error!(error = %e, "Worker exited with error");
            }
        });
        Ok(WorkerProcess::new(handle))
    }
}

/// Runs each worker on its own OS thread with a single-threaded runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &self,
        config: Arc<WorkerConfig>,
        transport: ChildTransport,
    ) -> Result<WorkerProcess, SpawnError> {
        std::thread::Builder::new()
            .name("dynworker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(run_worker(config, transport)) {
                    tracing::error!(error = %e, "Worker exited with error");
                }
            })?;
        Ok(WorkerProcess::detached())
    }
}

pub struct ClientConfig {
    pub worker: Arc<WorkerConfig>,
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Defaults layered under every header. Seeded from the environment.
    pub options: Options,
    /// Frame limit for both directions of the pipe.
    pub max_frame_length: usize,
}

impl ClientConfig {
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker: Arc::new(worker),
            spawner: Arc::new(TaskSpawner),
            options: Options::from_env(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options.merge(options);
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Closing,
    Terminated,
}

/// Settles with the worker's answer to one message.
#[must_use = "the response is lost unless the future is awaited"]
pub struct ResponseFuture {
    inner: ResponseInner,
}

enum ResponseInner {
    Pending(oneshot::Receiver<CallOutcome>),
    Failed(Option<CallError>),
}

impl ResponseFuture {
    fn pending(rx: oneshot::Receiver<CallOutcome>) -> Self {
        Self {
            inner: ResponseInner::Pending(rx),
        }
    }

    fn failed(error: CallError) -> Self {
        Self {
            inner: ResponseInner::Failed(Some(error)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = CallOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            ResponseInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CallError::WorkerClosed))),
            ResponseInner::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(CallError::WorkerClosed)))
            }
        }
    }
}

/// Graceful-close handshake. Every clone settles together.
pub type CloseFuture = Shared<BoxFuture<'static, Result<(), CallError>>>;

fn settled_close(result: Result<(), CallError>) -> CloseFuture {
    futures::future::ready(result).boxed().shared()
}

/// Value to embed in a later message so the worker builds the matching
/// callback closure.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackDescriptor {
    header: Header,
}

impl CallbackDescriptor {
    pub fn id(&self) -> &CorrelationId {
        &self.header.id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// `{"function": "createCallback", "arguments": header}`
    pub fn to_request(&self) -> serde_json::Value {
        serde_json::json!({
            "function": "createCallback",
            "arguments": self.header.to_json(),
        })
    }
}

impl From<CallbackDescriptor> for serde_json::Value {
    fn from(descriptor: CallbackDescriptor) -> Self {
        descriptor.to_request()
    }
}

impl From<&CallbackDescriptor> for serde_json::Value {
    fn from(descriptor: &CallbackDescriptor) -> Self {
        descriptor.to_request()
    }
}

struct Outbound {
    id: CorrelationId,
    frame: serde_json::Value,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    process: WorkerProcess,
    writer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Connection {
    fn shutdown(mut self) {
        self.dispatcher.abort();
        self.writer.abort();
        self.process.kill();
    }
}

struct ClientState {
    lifecycle: LifecycleState,
    connection: Option<Connection>,
    /// Bumped on every start and terminate, so tasks of an old worker
    /// cannot touch the state of a new one.
    generation: u64,
    /// Distinguished id of the running worker, reused by the close handshake.
    worker_id: Option<CorrelationId>,
    options: Options,
    triggers: TriggerTable,
    callbacks: CallbackRegistry,
    closing: Option<CloseFuture>,
}

impl ClientState {
    fn send(&self, id: CorrelationId, frame: serde_json::Value) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.outbound.send(Outbound { id, frame }).is_ok())
    }

    fn id_in_use(&self, id: &CorrelationId) -> bool {
        self.triggers.contains(id) || self.callbacks.contains(id)
    }
}

struct ClientInner {
    worker: Arc<WorkerConfig>,
    spawner: Arc<dyn WorkerSpawner>,
    max_frame_length: usize,
    state: StdMutex<ClientState>,
}

type Acknowledged = (oneshot::Sender<CallOutcome>, CallOutcome);

impl ClientInner {
    /// Lock the client state, recovering from poison.
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Client state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn start(self: &Arc<Self>, options: Options) -> Result<(), CallError> {
        let mut state = self.lock_state();
        match state.lifecycle {
            LifecycleState::Ready => return Err(CallError::AlreadyInitialized),
            LifecycleState::Closing => return Err(CallError::AlreadyClosing),
            LifecycleState::Uninitialized | LifecycleState::Terminated => {}
        }

        let (parent, child) = create_transport(self.max_frame_length);
        let process = self
            .spawner
            .spawn(Arc::clone(&self.worker), child)
            .map_err(|e| CallError::Spawn(e.to_string()))?;

        let (writer, reader) = parent.into_framed();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        state.generation += 1;
        let generation = state.generation;

        let writer = tokio::spawn(write_frames(
            Arc::downgrade(self),
            generation,
            outbound_rx,
            writer,
        ));
        let dispatcher = tokio::spawn(dispatch_responses(
            Arc::downgrade(self),
            generation,
            reader,
        ));

        state.connection = Some(Connection {
            outbound,
            process,
            writer,
            dispatcher,
        });
        state.worker_id = Some(CorrelationId::new());
        state.options.merge(options);
        state.lifecycle = LifecycleState::Ready;
        tracing::info!(generation, "Worker started");
        Ok(())
    }

    fn post(&self, message: serde_json::Value, options: &Options) -> ResponseFuture {
        let mut state = self.lock_state();
        if state.lifecycle != LifecycleState::Ready {
            return ResponseFuture::failed(CallError::WorkerClosed);
        }

        let header = options::build_header(&state.options, options);
        let id = header.id.clone();
        if state.callbacks.contains(&id) {
            return ResponseFuture::failed(CallError::DuplicateId(id));
        }
        // Registered before sending so even an instant response finds it
        let rx = match state.triggers.register(id.clone()) {
            Ok(rx) => rx,
            Err(e) => return ResponseFuture::failed(e),
        };

        let frame = protocol::frame_message(&header, message);
        if !state.send(id.clone(), frame) {
            state.triggers.activate(&id);
            return ResponseFuture::failed(CallError::WorkerClosed);
        }
        tracing::trace!(%id, "Message queued");
        ResponseFuture::pending(rx)
    }

    fn close(&self) -> CloseFuture {
        let mut state = self.lock_state();
        if let Some(closing) = &state.closing {
            return closing.clone();
        }
        if state.lifecycle != LifecycleState::Ready {
            return settled_close(Err(CallError::AlreadyClosed));
        }
        let Some(worker_id) = state.worker_id.clone() else {
            return settled_close(Err(CallError::AlreadyClosed));
        };

        let header =
            options::build_header(&state.options, &Options::new().with_id(worker_id.clone()));
        let rx = match state.triggers.register(worker_id.clone()) {
            Ok(rx) => rx,
            Err(e) => return settled_close(Err(e)),
        };
        let frame = protocol::frame_message(&header, serde_json::json!({"function": "close"}));
        if !state.send(worker_id.clone(), frame) {
            state.triggers.activate(&worker_id);
            return settled_close(Err(CallError::WorkerClosed));
        }

        tracing::info!("Closing worker");
        state.lifecycle = LifecycleState::Closing;
        let closing = async move {
            match rx.await {
                Ok(Ok(_)) | Err(_) => Ok(()),
                Ok(Err(e)) => Err(e),
            }
        }
        .boxed()
        .shared();
        state.closing = Some(closing.clone());
        closing
    }

    /// Route one response. Returns false once this generation is done.
    fn dispatch(&self, generation: u64, response: Response) -> bool {
        let (trigger, registration, log_messages, log_result) = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return false;
            }
            let log_messages = state.options.log_messages();
            let log_result = state.options.log_result();
            match &response.id {
                Some(id) => (
                    state.triggers.activate(id),
                    state.callbacks.lookup(id),
                    log_messages,
                    log_result,
                ),
                None => (None, None, log_messages, log_result),
            }
        };

        if log_messages {
            tracing::info!(
                id = ?response.id,
                is_error = response.is_error,
                result = %response.result,
                "Received response"
            );
        }
        if log_result {
            if response.is_error {
                tracing::error!(id = ?response.id, result = %response.result, "Error result");
            } else {
                tracing::info!(id = ?response.id, result = %response.result, "Result");
            }
        }

        let closed = response.is_closed_sentinel();
        let outcome = if response.is_error {
            Err(CallError::Remote(RemoteError::new(response.result.clone())))
        } else {
            Ok(response.result.clone())
        };

        if let (Some(registration), Some(id)) = (registration, response.id.clone()) {
            registration.invoke(id, callback_arguments(response.result));
        } else if trigger.is_none() {
            tracing::debug!(id = ?response.id, "Dropping response with unknown id");
        }

        if closed {
            tracing::info!("Worker acknowledged close");
            self.shutdown(Some(generation), trigger.map(|tx| (tx, outcome)));
            return false;
        }
        if let Some(tx) = trigger {
            // Caller may have dropped the future
            let _ = tx.send(outcome);
        }
        true
    }

    fn reject(&self, generation: u64, id: &CorrelationId, error: CallError) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.triggers.settle(id, Err(error));
        }
    }

    fn terminate(&self, generation: Option<u64>) {
        self.shutdown(generation, None);
    }

    /// Hard stop. `acknowledged` is a trigger already taken out of the table
    /// that settles ahead of the mass rejection.
    fn shutdown(&self, generation: Option<u64>, acknowledged: Option<Acknowledged>) {
        let torn_down = {
            let mut state = self.lock_state();
            let current = generation.is_none_or(|g| g == state.generation);
            match state.connection.take() {
                Some(connection) if current => {
                    state.generation += 1;
                    state.lifecycle = LifecycleState::Terminated;
                    state.closing = None;
                    let close_trigger = match state.worker_id.take() {
                        Some(id) => state.triggers.activate(&id),
                        None => None,
                    };
                    let pending = state.triggers.drain();
                    let dropped_callbacks = state.callbacks.len();
                    state.callbacks.clear();
                    Some((connection, close_trigger, pending, dropped_callbacks))
                }
                other => {
                    state.connection = other;
                    None
                }
            }
        };

        if let Some((tx, outcome)) = acknowledged {
            let _ = tx.send(outcome);
        }

        let Some((connection, close_trigger, pending, dropped_callbacks)) = torn_down else {
            return;
        };

        if let Some(tx) = close_trigger {
            let _ = tx.send(Ok(serde_json::Value::Null));
        }
        let rejected = pending.len();
        for tx in pending {
            let _ = tx.send(Err(CallError::WorkerClosed));
        }
        connection.shutdown();
        tracing::info!(rejected, dropped_callbacks, "Worker terminated");
    }
}

fn callback_arguments(result: serde_json::Value) -> Vec<serde_json::Value> {
    match result {
        serde_json::Value::Array(arguments) => arguments,
        serde_json::Value::Null => Vec::new(),
        other => vec![other],
    }
}

async fn write_frames(
    inner: Weak<ClientInner>,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut writer: MessageWriter,
) {
    while let Some(Outbound { id, frame }) = outbound.recv().await {
        if let Err(e) = writer.send(frame).await {
            tracing::warn!(%id, error = %e, "Failed to send message to worker");
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.reject(generation, &id, CallError::Send(e.to_string()));
            // Oversized frames are refused before any byte is written
            if e.kind() != io::ErrorKind::InvalidInput {
                inner.terminate(Some(generation));
                break;
            }
        }
    }
    tracing::trace!(generation, "Frame writer exiting");
}

async fn dispatch_responses(inner: Weak<ClientInner>, generation: u64, mut reader: ResponseReader) {
    loop {
        let next = reader.next().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match next {
            Some(Ok(response)) => {
                if !inner.dispatch(generation, response) {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Response channel error");
                inner.terminate(Some(generation));
                break;
            }
            None => {
                tracing::warn!("Response channel closed (worker crashed?)");
                inner.terminate(Some(generation));
                break;
            }
        }
    }
    tracing::debug!(generation, "Dispatcher exiting");
}

/// Promise-style handle on a detached worker.
///
/// Dropping the client terminates its worker.
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl WorkerClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                worker: config.worker,
                spawner: config.spawner,
                max_frame_length: config.max_frame_length,
                state: StdMutex::new(ClientState {
                    lifecycle: LifecycleState::Uninitialized,
                    connection: None,
                    generation: 0,
                    worker_id: None,
                    options: config.options,
                    triggers: TriggerTable::new(),
                    callbacks: CallbackRegistry::new(),
                    closing: None,
                }),
            }),
        }
    }

    /// Spawn the worker, apply `options`, then import `scripts` if any.
    pub async fn init(&self, scripts: &[&str], options: Options) -> Result<(), CallError> {
        self.inner.start(options)?;
        if !scripts.is_empty() {
            self.import_scripts(scripts).await?;
        }
        Ok(())
    }

    pub fn post_message(&self, message: serde_json::Value) -> ResponseFuture {
        self.inner.post(message, &Options::default())
    }

    pub fn post_message_with(&self, message: serde_json::Value, options: Options) -> ResponseFuture {
        self.inner.post(message, &options)
    }

    pub async fn import_scripts(&self, scripts: &[&str]) -> Result<(), CallError> {
        self.post_message(serde_json::json!({
            "function": "importScripts",
            "arguments": scripts,
        }))
        .await
        .map(|_| ())
    }

    /// Register `callback` and return the descriptor that creates its
    /// worker-side closure.
    pub fn register_callback(
        &self,
        callback: &Arc<CallbackFn>,
        options: Options,
    ) -> Result<CallbackDescriptor, CallError> {
        let mut state = self.inner.lock_state();
        let header = options::build_header(&state.options, &options);
        if state.id_in_use(&header.id) {
            return Err(CallError::DuplicateId(header.id));
        }
        state
            .callbacks
            .register(header.id.clone(), header.this_arg.clone(), Arc::clone(callback))?;
        tracing::debug!(id = %header.id, "Registered callback");
        Ok(CallbackDescriptor { header })
    }

    /// Remove every registration of `callback`. Returns how many were removed.
    pub fn unregister_callback(&self, callback: &Arc<CallbackFn>) -> usize {
        self.inner.lock_state().callbacks.remove(callback)
    }

    pub fn unregister_all_callbacks(&self) {
        self.inner.lock_state().callbacks.clear();
    }

    pub fn close(&self) -> CloseFuture {
        self.inner.close()
    }

    pub fn terminate(&self) {
        self.inner.terminate(None);
    }

    pub fn set_options(&self, options: Options) {
        self.inner.lock_state().options.merge(options);
    }

    pub fn options(&self) -> Options {
        self.inner.lock_state().options.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock_state().lifecycle
    }

    /// Calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock_state().triggers.len()
    }

    pub fn callback_count(&self) -> usize {
        self.inner.lock_state().callbacks.len()
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.inner.terminate(None);
    }
}
