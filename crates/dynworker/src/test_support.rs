//! Tracing capture for tests that assert on emitted logs.

use std::fmt::Write as _;

use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Forwards every event as `"LEVEL [target] message key=value ..."`.
pub struct LogCapture {
    tx: mpsc::UnboundedSender<String>,
}

impl<S> Layer<S> for LogCapture
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let line = format!(
            "{} [{}] {}{}",
            metadata.level(),
            metadata.target(),
            visitor.message,
            visitor.fields
        );
        let _ = self.tx.send(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

/// Install a capturing subscriber for the current thread.
///
/// `#[tokio::test]` runs every spawned task on the test thread, so worker and
/// dispatcher events land here too.
pub fn capture_logs() -> (DefaultGuard, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber = tracing_subscriber::registry().with(LogCapture { tx });
    (tracing::subscriber::set_default(subscriber), rx)
}

pub fn drain_logs(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}
