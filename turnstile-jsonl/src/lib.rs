//! JSONL stats sink for `turnstile`. Writes one decision per line.
//! Always appends; bring your own path.

use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use turnstile::stats::{StatsEvent, StatsSink};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    // Serializes appends so concurrent lines never interleave.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: Arc::new(path.into()), write_lock: Arc::new(tokio::sync::Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl tower_service::Service<StatsEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: StatsEvent) -> Self::Future {
        let path = self.path.clone();
        let write_lock = self.write_lock.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let _guard = write_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_path())
                .await
                .inspect_err(|err| {
                    tracing::debug!(path = %path.display(), error = %err, "cannot open stats file");
                })?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

impl StatsSink for JsonlSink {
    type SinkError = io::Error;
}

fn event_to_json(event: &StatsEvent) -> serde_json::Value {
    let kind = if event.allowed { "allowed" } else { "denied" };
    json!({
        "kind": kind,
        "key": event.key.as_str(),
        "method": event.method,
        "path": event.path,
        "route": event.route(),
        "at_ms": event.at_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile::Key;

    #[test]
    fn denied_event_shape() {
        let event = StatsEvent::new(Key::from("10.0.0.1"), false, "POST", "/orders");
        let value = event_to_json(&event);
        assert_eq!(value["kind"], "denied");
        assert_eq!(value["key"], "10.0.0.1");
        assert_eq!(value["route"], "POST /orders");
        assert!(value["at_ms"].as_u64().unwrap() > 0);
    }
}
