//! Duplex JSON channel to the backend process.

use std::future::Future;

use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The other end went away.
    #[error("transport is closed")]
    Closed,
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// One frame could not be decoded; the stream itself is still usable.
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Outgoing half. Sends are fire-and-forget; correlation happens above.
pub trait TransportSink: Send + Sync + 'static {
    fn send(&self, request: Value) -> Result<(), TransportError>;
}

/// Incoming half. Each call yields exactly one backend event or response.
pub trait TransportSource: Send + 'static {
    fn receive(&mut self) -> impl Future<Output = Result<Value, TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ChannelSink {
    requests: mpsc::UnboundedSender<Value>,
}

impl TransportSink for ChannelSink {
    fn send(&self, request: Value) -> Result<(), TransportError> {
        self.requests
            .send(request)
            .map_err(|_| TransportError::Closed)
    }
}

#[derive(Debug)]
pub struct ChannelSource {
    events: mpsc::UnboundedReceiver<Value>,
}

impl TransportSource for ChannelSource {
    async fn receive(&mut self) -> Result<Value, TransportError> {
        self.events.recv().await.ok_or(TransportError::Closed)
    }
}

/// Backend end of an in-memory transport. Dropping it closes the stream.
#[derive(Debug)]
pub struct BackendPeer {
    requests: mpsc::UnboundedReceiver<Value>,
    events: mpsc::UnboundedSender<Value>,
}

impl BackendPeer {
    pub async fn next_request(&mut self) -> Option<Value> {
        self.requests.recv().await
    }

    pub fn emit(&self, event: Value) -> Result<(), TransportError> {
        self.events.send(event).map_err(|_| TransportError::Closed)
    }

    /// Answer `request`, echoing its correlation id.
    pub fn reply(&self, request: &Value, mut response: Value) -> Result<(), TransportError> {
        if let (Some(object), Some(extra)) = (response.as_object_mut(), request.get("@extra")) {
            object.insert("@extra".to_owned(), extra.clone());
        }
        self.emit(response)
    }
}

/// In-memory transport pair plus the backend's end, for tests and scripted runs.
pub fn channel_transport() -> (ChannelSink, ChannelSource, BackendPeer) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        ChannelSink {
            requests: request_tx,
        },
        ChannelSource { events: event_rx },
        BackendPeer {
            requests: request_rx,
            events: event_tx,
        },
    )
}

#[derive(Debug, Clone)]
pub struct LineSink {
    frames: mpsc::UnboundedSender<Value>,
}

impl TransportSink for LineSink {
    fn send(&self, request: Value) -> Result<(), TransportError> {
        self.frames.send(request).map_err(|_| TransportError::Closed)
    }
}

/// Newline-delimited frames decoded from raw bytes. A frame that is not
/// valid JSON or UTF-8 fails alone as [`TransportError::Frame`].
pub struct LineSource<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> TransportSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn receive(&mut self) -> Result<Value, TransportError> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Err(TransportError::Closed);
            }
            let frame = self.buf.trim_ascii();
            if frame.is_empty() {
                continue;
            }
            trace!(bytes = frame.len(), "frame received");
            return Ok(serde_json::from_slice(frame)?);
        }
    }
}

/// Newline-delimited JSON over any async byte stream. Must be called inside
/// a tokio runtime: a writer task owns `writer` until the sink is dropped.
pub fn line_transport<R, W>(reader: R, writer: W) -> (LineSink, LineSource<R>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (frames, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(writer, rx));
    (
        LineSink { frames },
        LineSource {
            reader,
            buf: Vec::new(),
        },
    )
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = frame.to_string();
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!(error = %err, "backend writer failed; dropping outgoing frames");
            return;
        }
    }
}
