//! JSONL sink for `tollgate`. Appends one admission event per line.
//!
//! Writes happen on the call future, so pair it with
//! [`NonBlockingSink`](tollgate::telemetry::NonBlockingSink) before handing it to an
//! [`EventBus`](tollgate::telemetry::EventBus).

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tollgate::telemetry::{event_to_json, AdmissionEvent, TelemetrySink};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File the sink appends to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<AdmissionEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            if let Err(err) = file.write_all(line.as_bytes()).await {
                tracing::warn!(path = %path.display(), error = %err, "failed to append event");
                return Err(err);
            }
            file.flush().await
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
