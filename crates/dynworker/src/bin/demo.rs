//! Drives a worker through a call, a chained read, a callback and a graceful close.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use dynworker::{
    CallbackFn, CallbackInvocation, ClientConfig, Fault, Object, Options, Value, WorkerClient,
    WorkerConfig,
};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("DYNWORKER_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("dynworker={level},dynworker_demo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn number(value: Option<&Value>) -> Result<f64, Fault> {
    value
        .and_then(Value::as_data)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| Fault::application("expected a number"))
}

fn demo_scope(root: &Object) {
    root.insert("location", json!({"host": "localhost", "port": 8080}));
    root.define_function("add", |_, args| {
        Ok(json!(number(args.first())? + number(args.get(1))?).into())
    });
    root.define_function("every", |this, args| {
        let callback = this
            .get("onTick")
            .as_function()
            .cloned()
            .ok_or_else(|| Fault::application("onTick is not set"))?;
        let times = number(args.first())? as u64;
        for tick in 0..times {
            callback.call(this, vec![json!(tick).into()])?;
        }
        Ok(json!(times).into())
    });

    let console = Object::new();
    console.define_function("log", |_, args| {
        let rendered: Vec<serde_json::Value> = args.iter().map(Value::to_wire_shallow).collect();
        tracing::info!(target: "dynworker_demo", args = ?rendered, "console.log");
        Ok(json!(rendered.len()).into())
    });
    root.insert("console", console);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let worker = WorkerConfig::new()
        .with_scope(demo_scope)
        .with_script("stats", |root| {
            root.define_function("mean", |_, args| {
                let values: Vec<f64> = args
                    .iter()
                    .map(|arg| number(Some(arg)))
                    .collect::<Result<_, _>>()?;
                if values.is_empty() {
                    return Err(Fault::application("mean of nothing"));
                }
                Ok(json!(values.iter().sum::<f64>() / values.len() as f64).into())
            });
        });
    let client = WorkerClient::new(ClientConfig::new(worker));
    client
        .init(&["stats"], Options::new())
        .await
        .context("failed to start worker")?;

    let sum = client
        .post_message(json!({"function": "add", "arguments": [2, 3]}))
        .await?;
    tracing::info!(%sum, "add(2, 3)");

    let mean = client
        .post_message(json!({"function": "mean", "arguments": [1, 2, 3, 4]}))
        .await?;
    tracing::info!(%mean, "mean(1, 2, 3, 4)");

    let logged = client
        .post_message(json!(["console", {
            "function": "log",
            "nestedArguments": [["self", "location", "port"], ["self"]]
        }]))
        .await?;
    tracing::info!(%logged, "console.log(self.location.port, self)");

    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let on_tick: Arc<CallbackFn> = Arc::new(move |invocation: CallbackInvocation| {
        counter.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            id = %invocation.id,
            arguments = ?invocation.arguments,
            "Callback fired"
        );
    });
    let descriptor = client
        .register_callback(&on_tick, Options::new().with_this_arg(json!("ticker")))
        .context("failed to register callback")?;
    client
        .post_message(json!([["onTick", null, descriptor.to_request()]]))
        .await?;
    client
        .post_message(json!({"function": "every", "arguments": [3]}))
        .await?;
    tracing::info!(fired = ticks.load(Ordering::SeqCst), "Callbacks delivered");
    client.unregister_callback(&on_tick);

    match client.post_message(json!({"function": "eval", "arguments": ["[]"]})).await {
        Ok(result) => tracing::warn!(%result, "eval unexpectedly succeeded"),
        Err(e) => tracing::info!(error = %e, "eval refused"),
    }

    client.close().await.context("graceful close failed")?;
    tracing::info!(state = ?client.state(), "Worker closed");
    Ok(())
}
