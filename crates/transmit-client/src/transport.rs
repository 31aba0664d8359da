//! Streaming transport: the long-lived connection frames arrive on.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::protocol::SseDecoder;
use crate::types::CredentialProvider;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The stream is established.
    Open,
    /// One frame of data.
    Message(String),
    /// The stream failed or ended. No further events follow.
    Error(String),
}

/// A single streaming connection.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next event. `None` means the transport is finished.
    async fn next_event(&mut self) -> Option<TransportEvent>;
    /// Close the connection. No events are delivered afterwards.
    fn close(&mut self);
}

/// Opens transports. Opening never fails synchronously; failures are reported
/// as [`TransportEvent::Error`].
pub trait TransportFactory: Send + Sync {
    fn open(&self, url: &Url) -> Box<dyn Transport>;
}

/// Server-sent events over a streaming HTTP GET.
pub struct SseTransportFactory {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl SseTransportFactory {
    /// `http` should have its cookie store enabled so session cookies are sent.
    pub fn new(http: reqwest::Client, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { http, credentials }
    }
}

impl TransportFactory for SseTransportFactory {
    fn open(&self, url: &Url) -> Box<dyn Transport> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let request = self
            .http
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .headers(self.credentials.headers());
        let task = tokio::spawn(stream_events(request, tx));
        Box::new(SseTransport { rx, task })
    }
}

struct SseTransport {
    rx: mpsc::Receiver<TransportEvent>,
    task: JoinHandle<()>,
}

#[async_trait]
impl Transport for SseTransport {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.task.abort();
        self.rx.close();
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn stream_events(request: reqwest::RequestBuilder, tx: mpsc::Sender<TransportEvent>) {
    let response = match request
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
    {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send(TransportEvent::Error(e.to_string())).await;
            return;
        }
    };
    if tx.send(TransportEvent::Open).await.is_err() {
        return;
    }

    let mut decoder = SseDecoder::default();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for data in decoder.push(&bytes) {
                    if tx.send(TransportEvent::Message(data)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        }
    }
    let _ = tx
        .send(TransportEvent::Error("event stream ended".to_string()))
        .await;
}
