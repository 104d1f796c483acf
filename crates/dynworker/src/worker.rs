//! Worker side - evaluates message frames against its own scope.
//!
//! The parent side (spawning, correlation, lifecycle) is in client.rs.
//!
//! Architecture:
//! - Main loop: reads message frames, strips the header, interprets the rest
//! - Outbox: every response goes through one writer task, so callback closures
//!   can post out-of-band frames from anywhere in worker code
//! - Deferred results settle on their own tasks and answer when ready
//!
//! The worker shares nothing with the controller. Its scope is built from the
//! [`WorkerConfig`] installers each time a worker starts.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{self, CorrelationId, Header, Response};
use crate::bridge::transport::{ChildTransport, ResponseWriter};
use crate::fault::Fault;
use crate::interpreter::Interpreter;
use crate::scope::{Function, Object, Outcome, Property, Value};

/// Populates a worker scope with host values and functions.
pub type ScopeInstaller = dyn Fn(&Object) + Send + Sync;

/// Named installers the worker can load on demand through `importScripts`.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<ScopeInstaller>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, install: F)
    where
        F: Fn(&Object) + Send + Sync + 'static,
    {
        self.scripts.insert(name.into(), Arc::new(install));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn import(&self, name: &str, root: &Object) -> Result<(), Fault> {
        let install = self
            .scripts
            .get(name)
            .ok_or_else(|| Fault::application(format!("script {name} is not registered")))?;
        install(root);
        tracing::debug!(script = name, "Imported script");
        Ok(())
    }
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.names())
            .finish()
    }
}

/// Everything a worker needs to build its scope.
#[derive(Clone, Default)]
pub struct WorkerConfig {
    scope: Vec<Arc<ScopeInstaller>>,
    scripts: ScriptRegistry,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an installer run against the root scope at startup, in order.
    pub fn with_scope<F>(mut self, install: F) -> Self
    where
        F: Fn(&Object) + Send + Sync + 'static,
    {
        self.scope.push(Arc::new(install));
        self
    }

    /// Register a script loadable by name after startup.
    pub fn with_script<F>(mut self, name: impl Into<String>, install: F) -> Self
    where
        F: Fn(&Object) + Send + Sync + 'static,
    {
        self.scripts.register(name, install);
        self
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    fn build_scope(&self, root: &Object) {
        for install in &self.scope {
            install(root);
        }
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("scope", &self.scope.len())
            .field("scripts", &self.scripts)
            .finish()
    }
}

enum Outgoing {
    Response(Response),
    /// Write everything queued so far, then stop.
    Flush,
}

/// Queue of frames bound for the controller.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    fn send(&self, response: Response) -> io::Result<()> {
        self.tx
            .send(Outgoing::Response(response))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response channel closed"))
    }

    fn flush(&self) {
        let _ = self.tx.send(Outgoing::Flush);
    }
}

async fn forward_responses(mut rx: mpsc::UnboundedReceiver<Outgoing>, mut writer: ResponseWriter) {
    while let Some(outgoing) = rx.recv().await {
        let response = match outgoing {
            Outgoing::Response(response) => response,
            Outgoing::Flush => break,
        };
        let id = response.id.clone();
        match writer.send(response).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                // Oversized frame; nothing was written, so answer with a fault instead
                tracing::warn!(id = ?id, error = %e, "Response rejected by codec");
                let fault = Fault::application(format!("response could not be sent: {e}"));
                if let Err(e) = writer.send(Response::failure(id, fault.to_wire())).await {
                    tracing::warn!(error = %e, "Failed to forward response");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to forward response");
                break;
            }
        }
    }
    tracing::trace!("Response forwarder exiting");
}

/// Where to send the answer to one message, and whether to log it.
#[derive(Debug, Clone)]
struct ReplyTo {
    id: Option<CorrelationId>,
    log_result: bool,
}

impl ReplyTo {
    fn new(header: Option<&Header>) -> Self {
        Self {
            id: header.map(|h| h.id.clone()),
            log_result: header.is_some_and(|h| h.log_result),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn send_response(outbox: &Outbox, reply: ReplyTo, outcome: Outcome) {
    let response = match outcome {
        Ok(value) => {
            let result = match value.to_wire() {
                Ok(data) => data,
                Err(e) => {
                    tracing::debug!(id = ?reply.id, error = %e, "Sending shallow copy of result");
                    value.to_wire_shallow()
                }
            };
            if reply.log_result {
                tracing::info!(id = ?reply.id, %result, "Result");
            }
            Response::success(reply.id, result)
        }
        Err(fault) => {
            if reply.log_result {
                tracing::error!(id = ?reply.id, stack = %fault.stack(), "Error result");
            }
            Response::failure(reply.id, fault.to_wire())
        }
    };

    if let Err(e) = outbox.send(response) {
        tracing::warn!(error = %e, "Dropping response");
    }
}

/// Turns interpreter outcomes into response frames.
struct Responder {
    interpreter: Interpreter,
    outbox: Outbox,
    deferreds: JoinSet<()>,
}

impl Responder {
    fn new(interpreter: Interpreter, outbox: Outbox) -> Self {
        Self {
            interpreter,
            outbox,
            deferreds: JoinSet::new(),
        }
    }

    fn handle_message(&mut self, frame: serde_json::Value) {
        let log_messages = frame
            .get(0)
            .and_then(|header| header.get("logMessages"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if log_messages {
            tracing::info!(%frame, "Received message");
        }

        let (header, message) = protocol::split_message(frame);
        let reply = ReplyTo::new(header.as_ref());

        let interpreter = &self.interpreter;
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            interpreter.process(&message)
        })) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(id = ?reply.id, panic = %message, "Message handler panicked");
                Err(Fault::panicked(message))
            }
        };

        self.respond(reply, outcome);
    }

    fn respond(&mut self, reply: ReplyTo, outcome: Outcome) {
        match outcome {
            Ok(Value::Deferred(deferred)) => {
                tracing::trace!(id = ?reply.id, "Waiting for deferred result");
                let outbox = self.outbox.clone();
                self.deferreds.spawn(async move {
                    let settled = AssertUnwindSafe(deferred.settle())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            Err(Fault::panicked(panic_message(payload.as_ref())))
                        });
                    send_response(&outbox, reply, settled);
                });
            }
            outcome => send_response(&self.outbox, reply, outcome),
        }
    }
}

fn script_names(args: &[Value]) -> Result<Vec<String>, Fault> {
    let mut names = Vec::new();
    for arg in args {
        match arg.as_data() {
            Some(serde_json::Value::String(name)) => names.push(name.clone()),
            Some(serde_json::Value::Array(items)) => {
                for item in items {
                    let name = item
                        .as_str()
                        .ok_or_else(|| Fault::application("script names must be strings"))?;
                    names.push(name.to_string());
                }
            }
            Some(serde_json::Value::Null) => {}
            _ => return Err(Fault::application("script names must be strings")),
        }
    }
    Ok(names)
}

fn create_callback(outbox: &Outbox, header: Option<&Value>) -> Value {
    let id = header
        .map(|header| header.get("id"))
        .and_then(|id| id.as_str().map(CorrelationId::from));
    if id.is_none() {
        tracing::warn!("createCallback called without an id; invocations cannot be routed");
    }
    let log_result = header
        .and_then(|header| header.get("logResult").as_data().and_then(serde_json::Value::as_bool))
        .unwrap_or(false);

    let outbox = outbox.clone();
    Function::new("callback", move |_, args| {
        let arguments = Value::list(args);
        let result = arguments
            .to_wire()
            .unwrap_or_else(|_| arguments.to_wire_shallow());
        if log_result {
            tracing::info!(id = ?id, %result, "Callback invoked");
        }
        outbox
            .send(Response::success(id.clone(), result))
            .map_err(|e| Fault::application(e.to_string()))?;
        Ok(Value::undefined())
    })
    .into()
}

/// Protocol built-ins. Installed after the host scope so they cannot be shadowed.
fn install_builtins(
    root: &Object,
    scripts: &ScriptRegistry,
    outbox: &Outbox,
    shutdown: &CancellationToken,
) {
    let weak = root.downgrade();
    root.insert(
        "self",
        Property::read_only(move || weak.upgrade().map(Value::Object).unwrap_or_default()),
    );

    let token = shutdown.clone();
    root.define_function("close", move |_, _| {
        tracing::info!("Close requested");
        token.cancel();
        Ok(protocol::closed_sentinel().into())
    });

    let callback_outbox = outbox.clone();
    root.insert(
        "createCallback",
        Function::new("createCallback", move |_, args| {
            Ok(create_callback(&callback_outbox, args.first()))
        })
        .with_arity(1),
    );

    let scripts = scripts.clone();
    let weak = root.downgrade();
    root.define_function("importScripts", move |_, args| {
        let Some(root) = weak.upgrade() else {
            return Ok(Value::undefined());
        };
        for name in script_names(&args)? {
            scripts.import(&name, &root)?;
        }
        Ok(Value::undefined())
    });

    // Evaluates a message given as JSON text. Host code may call it; the
    // protocol never can.
    let weak = root.downgrade();
    root.insert(
        "eval",
        Function::new("eval", move |_, args| {
            let Some(root) = weak.upgrade() else {
                return Ok(Value::undefined());
            };
            let source = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| Fault::application("eval expects a string"))?;
            let message: serde_json::Value = serde_json::from_str(source)
                .map_err(|e| Fault::application(format!("eval: {e}")))?;
            Interpreter::new(root).process(&message)
        })
        .with_arity(1)
        .restricted(),
    );
}

/// Empties the root scope when the worker goes away, including by abort.
///
/// Members may hold the root strongly (`[["me", null, "self"]]`) and callback
/// closures hold the outbox, so the scope is never freed on its own.
struct ScopeGuard(Object);

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Run the worker event loop until `close` is called or the controller hangs up.
pub async fn run_worker(config: Arc<WorkerConfig>, transport: ChildTransport) -> io::Result<()> {
    let (mut reader, writer) = transport.into_framed();

    let (tx, rx) = mpsc::unbounded_channel();
    let outbox = Outbox { tx };
    let forwarder = tokio::spawn(forward_responses(rx, writer));

    let shutdown = CancellationToken::new();
    let root = Object::new();
    let _scope = ScopeGuard(root.clone());
    config.build_scope(&root);
    install_builtins(&root, &config.scripts, &outbox, &shutdown);
    tracing::info!(members = root.len(), "Worker scope ready");

    let mut responder = Responder::new(Interpreter::new(root.clone()), outbox.clone());
    let mut result = Ok(());

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Worker closing");
                break;
            }

            Some(joined) = responder.deferreds.join_next() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Deferred task failed");
                }
            }

            frame = reader.next() => {
                match frame {
                    Some(Ok(frame)) => responder.handle_message(frame),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Message channel error");
                        result = Err(e);
                        break;
                    }
                    None => {
                        tracing::info!("Message channel closed (controller gone?), exiting");
                        break;
                    }
                }
            }
        }
    }

    // Unsettled deferreds are abandoned, like any work pending at close
    responder.deferreds.shutdown().await;
    outbox.flush();
    drop(responder);
    drop(outbox);
    if let Err(e) = forwarder.await {
        tracing::warn!(error = %e, "Response forwarder failed");
    }

    tracing::info!("Worker exiting");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
    use crate::bridge::transport::{MessageWriter, ResponseReader, create_transport};
    use crate::scope::WeakObject;
    use crate::test_support::{capture_logs, drain_logs};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    fn test_config(gate: Arc<Notify>) -> WorkerConfig {
        WorkerConfig::new()
            .with_scope(|root| {
                root.insert("answer", json!(5));
                root.define_function("add", |_, args| {
                    let sum: i64 = args
                        .iter()
                        .filter_map(|arg| arg.as_data().and_then(serde_json::Value::as_i64))
                        .sum();
                    Ok(json!(sum).into())
                });
                root.define_function("explode", |_, _| panic!("kaboom"));
                root.define_function("repeat", |_, args| {
                    let callback = args
                        .first()
                        .and_then(Value::as_function)
                        .cloned()
                        .ok_or_else(|| Fault::application("repeat expects a callback"))?;
                    for n in 0..3 {
                        callback.call(&Value::undefined(), vec![json!(n).into()])?;
                    }
                    Ok(Value::undefined())
                });
            })
            .with_scope(move |root| {
                let gate = Arc::clone(&gate);
                root.define_function("slow", move |_, _| {
                    let gate = Arc::clone(&gate);
                    Ok(Value::deferred(async move {
                        gate.notified().await;
                        Ok::<_, Fault>(Value::from(json!("slow")))
                    }))
                });
                root.define_function("fast", |_, _| {
                    Ok(Value::deferred(async { Ok::<_, Fault>(Value::from(json!("fast"))) }))
                });
            })
            .with_script("math", |root| {
                root.define_function("square", |_, args| {
                    let n = args
                        .first()
                        .and_then(Value::as_data)
                        .and_then(serde_json::Value::as_i64)
                        .unwrap_or(0);
                    Ok(json!(n * n).into())
                });
            })
    }

    fn start(config: WorkerConfig) -> (MessageWriter, ResponseReader, JoinHandle<io::Result<()>>) {
        let (parent, child) = create_transport(DEFAULT_MAX_FRAME_LENGTH);
        let handle = tokio::spawn(run_worker(Arc::new(config), child));
        let (writer, reader) = parent.into_framed();
        (writer, reader, handle)
    }

    fn start_default() -> (MessageWriter, ResponseReader, JoinHandle<io::Result<()>>) {
        start(test_config(Arc::new(Notify::new())))
    }

    async fn next_response(reader: &mut ResponseReader) -> Response {
        reader.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn responds_with_tagged_result() {
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "a"}, {"function": "add", "arguments": [2, 3]}]))
            .await
            .unwrap();

        let response = next_response(&mut reader).await;
        insta::assert_json_snapshot!(response, @r#"
        {
          "id": "a",
          "isError": false,
          "result": 5
        }
        "#);
    }

    #[tokio::test]
    async fn fault_becomes_error_response_and_loop_survives() {
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "bad"}, {"function": "missing"}]))
            .await
            .unwrap();
        let response = next_response(&mut reader).await;
        assert!(response.is_error);
        assert_eq!(response.result["name"], "FunctionNotFound");
        assert_eq!(response.result["member"], "missing");

        writer.send(json!([{"id": "ok"}, "answer"])).await.unwrap();
        let response = next_response(&mut reader).await;
        assert_eq!(response.id, Some(CorrelationId::from("ok")));
        assert_eq!(response.result, json!(5));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "p"}, {"function": "explode"}]))
            .await
            .unwrap();
        let response = next_response(&mut reader).await;
        assert!(response.is_error);
        assert_eq!(response.result["name"], "Panicked");

        writer.send(json!([{"id": "after"}, "answer"])).await.unwrap();
        assert_eq!(next_response(&mut reader).await.result, json!(5));
    }

    #[tokio::test]
    async fn message_without_header_is_answered_without_id() {
        let (mut writer, mut reader, _handle) = start_default();
        writer.send(json!("answer")).await.unwrap();
        let response = next_response(&mut reader).await;
        assert_eq!(response.id, None);
        assert_eq!(response.result, json!(5));
    }

    #[tokio::test]
    async fn deferred_results_answer_when_settled() {
        let gate = Arc::new(Notify::new());
        let (mut writer, mut reader, _handle) = start(test_config(Arc::clone(&gate)));

        writer
            .send(json!([{"id": "slow"}, {"function": "slow"}]))
            .await
            .unwrap();
        writer
            .send(json!([{"id": "fast"}, {"function": "fast"}]))
            .await
            .unwrap();

        let first = next_response(&mut reader).await;
        assert_eq!(first.id, Some(CorrelationId::from("fast")));
        assert_eq!(first.result, json!("fast"));

        gate.notify_one();
        let second = next_response(&mut reader).await;
        assert_eq!(second.id, Some(CorrelationId::from("slow")));
        assert_eq!(second.result, json!("slow"));
    }

    #[tokio::test]
    async fn callback_frames_are_out_of_band() {
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "call"}, {
                "function": "repeat",
                "nestedArguments": [{"function": "createCallback", "arguments": {"id": "cb"}}]
            }]))
            .await
            .unwrap();

        for n in 0..3 {
            let response = next_response(&mut reader).await;
            assert_eq!(response.id, Some(CorrelationId::from("cb")));
            assert!(!response.is_error);
            assert_eq!(response.result, json!([n]));
        }
        let done = next_response(&mut reader).await;
        assert_eq!(done.id, Some(CorrelationId::from("call")));
    }

    #[tokio::test]
    async fn callback_invocations_honour_log_result() {
        let (_guard, mut logs) = capture_logs();
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "call"}, {
                "function": "repeat",
                "nestedArguments": [{
                    "function": "createCallback",
                    "arguments": {"id": "cb", "logResult": true}
                }]
            }]))
            .await
            .unwrap();
        for _ in 0..4 {
            next_response(&mut reader).await;
        }

        let invoked: Vec<String> = drain_logs(&mut logs)
            .into_iter()
            .filter(|line| line.starts_with("INFO [dynworker::worker] Callback invoked"))
            .collect();
        assert_eq!(invoked.len(), 3, "{invoked:?}");
        for (n, line) in invoked.iter().enumerate() {
            assert!(line.contains(&format!("result=[{n}]")), "{line}");
        }
    }

    #[tokio::test]
    async fn silent_callbacks_are_not_logged() {
        let (_guard, mut logs) = capture_logs();
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "call"}, {
                "function": "repeat",
                "nestedArguments": [{"function": "createCallback", "arguments": {"id": "cb"}}]
            }]))
            .await
            .unwrap();
        for _ in 0..4 {
            next_response(&mut reader).await;
        }
        assert!(
            !drain_logs(&mut logs)
                .iter()
                .any(|line| line.contains("Callback invoked"))
        );
    }

    #[tokio::test]
    async fn log_messages_traces_the_whole_frame() {
        let (_guard, mut logs) = capture_logs();
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "m", "logMessages": true}, "answer"]))
            .await
            .unwrap();
        next_response(&mut reader).await;
        writer.send(json!([{"id": "q"}, "answer"])).await.unwrap();
        next_response(&mut reader).await;

        let received: Vec<String> = drain_logs(&mut logs)
            .into_iter()
            .filter(|line| line.starts_with("INFO [dynworker::worker] Received message"))
            .collect();
        assert_eq!(received.len(), 1, "{received:?}");
        assert!(received[0].contains(r#""logMessages":true"#), "{}", received[0]);
        assert!(received[0].contains(r#""answer""#), "{}", received[0]);
    }

    #[tokio::test]
    async fn aborted_worker_releases_scope_and_forwarder() {
        let slot: Arc<Mutex<Option<WeakObject>>> = Arc::new(Mutex::new(None));
        let installed = Arc::clone(&slot);
        let config = test_config(Arc::new(Notify::new())).with_scope(move |root| {
            *installed.lock().unwrap() = Some(root.downgrade());
        });
        let (mut writer, mut reader, handle) = start(config);

        // A strong self-reference plus a callback closure holding the outbox
        writer
            .send(json!([{"id": "me"}, ["me", null, "self"]]))
            .await
            .unwrap();
        next_response(&mut reader).await;
        writer
            .send(json!([{"id": "cb"}, [
                "keep", null, {"function": "createCallback", "arguments": {"id": "k"}}
            ]]))
            .await
            .unwrap();
        next_response(&mut reader).await;

        let weak = slot.lock().unwrap().clone().unwrap();
        assert!(weak.upgrade().is_some());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(weak.upgrade().is_none());

        let end = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .expect("forwarder should exit once the scope is released");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn self_is_sent_as_shallow_copy() {
        let (mut writer, mut reader, _handle) = start_default();
        writer.send(json!([{"id": "s"}, "self"])).await.unwrap();
        let response = next_response(&mut reader).await;
        assert!(!response.is_error);
        assert_eq!(response.result, json!({"answer": 5}));
    }

    #[tokio::test]
    async fn import_scripts_installs_named_scripts() {
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "i"}, {"function": "importScripts", "arguments": ["math"]}]))
            .await
            .unwrap();
        assert!(!next_response(&mut reader).await.is_error);

        writer
            .send(json!([{"id": "sq"}, {"function": "square", "arguments": [7]}]))
            .await
            .unwrap();
        assert_eq!(next_response(&mut reader).await.result, json!(49));

        writer
            .send(json!([{"id": "u"}, {"function": "importScripts", "arguments": ["nope"]}]))
            .await
            .unwrap();
        let response = next_response(&mut reader).await;
        assert!(response.is_error);
        assert_eq!(
            response.result["message"],
            "script nope is not registered"
        );
    }

    #[tokio::test]
    async fn eval_is_disallowed() {
        let (mut writer, mut reader, _handle) = start_default();
        writer
            .send(json!([{"id": "e"}, {"function": "eval", "arguments": ["[[\"x\", 1]]"]}]))
            .await
            .unwrap();
        let response = next_response(&mut reader).await;
        assert!(response.is_error);
        assert_eq!(response.result["name"], "FunctionDisallowed");

        writer.send(json!([{"id": "x"}, "x"])).await.unwrap();
        assert_eq!(next_response(&mut reader).await.result, json!(null));
    }

    #[tokio::test]
    async fn close_sends_sentinel_then_exits() {
        let (mut writer, mut reader, handle) = start_default();
        writer
            .send(json!([{"id": "w"}, {"function": "close"}]))
            .await
            .unwrap();

        let response = next_response(&mut reader).await;
        assert_eq!(response.id, Some(CorrelationId::from("w")));
        assert!(response.is_closed_sentinel());

        assert!(reader.next().await.is_none());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn controller_hangup_stops_worker() {
        let (writer, reader, handle) = start_default();
        drop(writer);
        drop(reader);
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn script_names_accepts_strings_and_lists() {
        let args = vec![Value::from(json!("a")), Value::from(json!(["b", "c"]))];
        assert_eq!(script_names(&args).unwrap(), vec!["a", "b", "c"]);
        assert!(script_names(&[Value::from(json!(1))]).is_err());
    }
}
