//! Tokio runtime around the synchronization engine.
//!
//! One task reads backend frames, one actor task owns the [`Engine`]. Both
//! feed a bounded [`SharedIngress`]; the UI talks to the actor through a
//! cloneable [`SyncHandle`] and reads published [`ViewSnapshot`]s.

/// Ingress sharing, event fan-out and snapshot publication.
pub mod channel;
/// Duplex JSON transports to the backend.
pub mod transport;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use sync_core::{
    ChatId, ConnectionState, Engine, EngineConfig, EngineInput, FileId, Intent, IntentTicket,
    LocalId, MessageId, PushOutcome, Step, Update, ViewProjector, ViewSnapshot, normalize_logged,
};
use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use channel::{EventStream, RuntimeError, SharedIngress, SyncChannels};
pub use transport::{
    BackendPeer, ChannelSink, ChannelSource, LineSink, LineSource, TransportError, TransportSink,
    TransportSource, channel_transport, line_transport,
};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_EVENT_BUFFER: usize = 512;

#[derive(Debug, Clone)]
pub struct SyncRuntimeConfig {
    pub engine: EngineConfig,
    /// How often timeouts, retries and typing expiry are checked.
    pub tick_interval: Duration,
    pub event_buffer: usize,
}

impl Default for SyncRuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Cloneable front door of a running engine.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    ingress: SharedIngress,
    channels: SyncChannels,
    next_ticket: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl SyncHandle {
    /// Queue an intent. Its outcome arrives on [`SyncHandle::subscribe`]
    /// tagged with the returned ticket.
    pub fn submit(&self, intent: Intent) -> Result<IntentTicket, RuntimeError> {
        if self.cancel.is_cancelled() {
            return Err(RuntimeError::Closed);
        }
        let ticket = IntentTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        trace!(%ticket, intent = intent.kind(), "queueing intent");
        if self.ingress.push(EngineInput::Intent { ticket, intent }) == PushOutcome::OverCapacity {
            debug!(%ticket, "ingress over capacity; intent kept");
        }
        Ok(ticket)
    }

    pub fn open_chat(&self, chat_id: ChatId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::OpenChat { chat_id })
    }

    pub fn close_chat(&self, chat_id: ChatId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::CloseChat { chat_id })
    }

    pub fn load_more_history(&self, chat_id: ChatId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::LoadMoreHistory { chat_id })
    }

    pub fn send_message(
        &self,
        chat_id: ChatId,
        text: impl Into<String>,
    ) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::SendMessage {
            chat_id,
            text: text.into(),
        })
    }

    pub fn retry_failed_send(&self, message_id: LocalId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::RetryFailedSend { message_id })
    }

    pub fn dismiss_failed_send(&self, message_id: LocalId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::DismissFailedSend { message_id })
    }

    pub fn mark_read(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::MarkRead {
            chat_id,
            message_id,
        })
    }

    pub fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: impl Into<String>,
    ) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::EditMessage {
            chat_id,
            message_id,
            text: text.into(),
        })
    }

    pub fn delete_messages(
        &self,
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
        revoke: bool,
    ) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::DeleteMessages {
            chat_id,
            message_ids,
            revoke,
        })
    }

    pub fn select_message(
        &self,
        chat_id: ChatId,
        message_id: Option<MessageId>,
    ) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::SelectMessage {
            chat_id,
            message_id,
        })
    }

    pub fn download_file(&self, file_id: FileId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::DownloadFile { file_id })
    }

    pub fn cancel_download(&self, file_id: FileId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::CancelDownload { file_id })
    }

    /// Remove the downloaded copy of a file; the message keeps its attachment.
    pub fn delete_local_file(&self, file_id: FileId) -> Result<IntentTicket, RuntimeError> {
        self.submit(Intent::DeleteLocalFile { file_id })
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.channels.latest()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.channels.watch()
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Stop both runtime tasks. Later intents fail with [`RuntimeError::Closed`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Start the receive loop and the engine actor on the current tokio runtime.
pub fn spawn_runtime<S, R>(config: SyncRuntimeConfig, sink: S, source: R) -> SyncHandle
where
    S: TransportSink,
    R: TransportSource,
{
    let engine = Engine::new(config.engine.clone());
    let ingress = SharedIngress::new(config.engine.ingress_capacity);
    let channels = SyncChannels::new(
        config.event_buffer,
        ViewProjector::new(&engine).snapshot(0),
    );
    let cancel = CancellationToken::new();

    tokio::spawn(receive_loop(source, ingress.clone(), cancel.child_token()));
    let actor = EngineActor {
        engine,
        sink,
        ingress: ingress.clone(),
        channels: channels.clone(),
        version: 0,
        tick_interval: config.tick_interval,
    };
    tokio::spawn(actor.run(cancel.child_token()));

    SyncHandle {
        ingress,
        channels,
        next_ticket: Arc::new(AtomicU64::new(1)),
        cancel,
    }
}

async fn receive_loop<R: TransportSource>(
    mut source: R,
    ingress: SharedIngress,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = source.receive() => match received {
                Ok(raw) => {
                    if let Some(update) = normalize_logged(&raw) {
                        ingress.push(EngineInput::Update(update));
                    }
                }
                Err(TransportError::Frame(err)) => {
                    warn!(error = %err, "skipping malformed backend frame");
                }
                Err(err) => {
                    warn!(error = %err, "backend transport ended");
                    ingress.push(EngineInput::Update(Update::ConnectionStateChanged(
                        ConnectionState::Disconnected,
                    )));
                    break;
                }
            }
        }
    }
    debug!("receive loop stopped");
}

struct EngineActor<S> {
    engine: Engine,
    sink: S,
    ingress: SharedIngress,
    channels: SyncChannels,
    version: u64,
    tick_interval: Duration,
}

impl<S: TransportSink> EngineActor<S> {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("sync runtime started");
        let step = self.engine.start(Instant::now());
        self.dispatch(step);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ingress.notified() => self.drain(),
                _ = ticker.tick() => {
                    let step = self.engine.tick(Instant::now());
                    self.dispatch(step);
                }
            }
        }
        info!("sync runtime stopped");
    }

    fn drain(&mut self) {
        let drained = self.ingress.drain();
        let now = Instant::now();
        let mut step = self.engine.apply_overflow(&drained.overflow, now);
        for input in drained.inputs {
            step.merge(self.engine.handle(input, now));
        }
        self.dispatch(step);
    }

    fn dispatch(&mut self, step: Step) {
        if step.is_empty() {
            return;
        }
        for request in step.requests {
            if let Err(err) = self.sink.send(request) {
                warn!(error = %err, "failed to send backend request");
            }
        }
        for event in step.events {
            self.channels.emit(event);
        }
        if !step.changes.is_empty() {
            self.version += 1;
            trace!(version = self.version, changes = ?step.changes, "publishing snapshot");
            self.channels
                .publish(ViewProjector::new(&self.engine).snapshot(self.version));
        }
    }
}
