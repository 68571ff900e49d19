//! Connection driver: runs a [`SurfaceSynchronizer`] against a transport

use crate::error::{ClientError, ClientResult};
use crate::surface::{SurfaceEvent, SurfaceSynchronizer};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tandem_core::{AuthorData, AuthorId, AuthorPatch, Change, DocumentName, Selection, Step};
use tandem_protocol::{codes, ClientMessage, Codec, Frame, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Delay between a local edit and its submission
pub const DEFAULT_SUBMIT_DEBOUNCE: Duration = Duration::from_millis(50);

/// A bidirectional frame channel to the server
#[async_trait]
pub trait ClientTransport: Send {
    async fn send(&mut self, frame: Frame) -> ClientResult<()>;

    /// Next frame from the server; `None` once the connection closed
    async fn recv(&mut self) -> Option<ClientResult<Frame>>;
}

/// Transport over a pair of in-process channels
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Frame>,
    receiver: mpsc::UnboundedReceiver<Frame>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<Frame>, receiver: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { sender, receiver }
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn send(&mut self, frame: Frame) -> ClientResult<()> {
        self.sender.send(frame).map_err(|_| ClientError::Disconnected)
    }

    async fn recv(&mut self) -> Option<ClientResult<Frame>> {
        self.receiver.recv().await.map(Ok)
    }
}

#[cfg(feature = "websocket")]
pub use self::websocket::WebSocketTransport;

#[cfg(feature = "websocket")]
mod websocket {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    /// Transport over a WebSocket connection
    pub struct WebSocketTransport {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl WebSocketTransport {
        pub async fn connect(url: &str) -> ClientResult<Self> {
            let (stream, _) = connect_async(url).await?;
            debug!(url, "WebSocket connected");
            Ok(Self { stream })
        }
    }

    #[async_trait]
    impl ClientTransport for WebSocketTransport {
        async fn send(&mut self, frame: Frame) -> ClientResult<()> {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data.to_vec()),
            };
            self.stream.send(message).await?;
            Ok(())
        }

        async fn recv(&mut self) -> Option<ClientResult<Frame>> {
            while let Some(message) = self.stream.next().await {
                match message {
                    Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                    Ok(Message::Binary(data)) => return Some(Ok(Frame::Binary(data.into()))),
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => {}
                    Err(e) => return Some(Err(e.into())),
                }
            }
            None
        }
    }
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub doc: DocumentName,
    pub codec: Codec,
    pub submit_debounce: Duration,
    /// Identity to resume; a fresh one is minted when absent
    pub author_id: Option<AuthorId>,
    pub token: Option<String>,
}

impl ClientConfig {
    pub fn new(doc: DocumentName) -> Self {
        Self {
            doc,
            codec: Codec::Json,
            submit_debounce: DEFAULT_SUBMIT_DEBOUNCE,
            author_id: None,
            token: None,
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_credentials(mut self, author_id: AuthorId, token: impl Into<String>) -> Self {
        self.author_id = Some(author_id);
        self.token = Some(token.into());
        self
    }
}

/// Point-in-time view of a running client
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub author_id: Option<AuthorId>,
    pub text: String,
    pub history: Change,
    pub commit_length: usize,
    pub sent_length: usize,
    pub initialized: bool,
    pub authors: BTreeMap<AuthorId, AuthorData>,
    pub selections: BTreeMap<AuthorId, Selection>,
}

impl Snapshot {
    /// Joined and nothing left to confirm
    pub fn is_settled(&self) -> bool {
        self.initialized && self.commit_length == self.history.end()
    }
}

enum Command {
    Edit(Vec<Step>),
    Select(Selection),
    ChangeAuthor(AuthorPatch),
    LogEvent { event: String, data: serde_json::Value },
    Pause,
    Resume,
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Handle to a client task spawned with [`SyncClient::spawn`]
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    fn command(&self, command: Command) -> ClientResult<()> {
        self.commands.send(command).map_err(|_| ClientError::Disconnected)
    }

    pub fn edit(&self, steps: Vec<Step>) -> ClientResult<()> {
        self.command(Command::Edit(steps))
    }

    pub fn insert(&self, pos: usize, text: impl Into<String>) -> ClientResult<()> {
        self.edit(vec![Step::insert(pos, text)])
    }

    pub fn select(&self, selection: Selection) -> ClientResult<()> {
        self.command(Command::Select(selection))
    }

    pub fn change_author(&self, patch: AuthorPatch) -> ClientResult<()> {
        self.command(Command::ChangeAuthor(patch))
    }

    pub fn log_event(&self, event: impl Into<String>, data: serde_json::Value) -> ClientResult<()> {
        self.command(Command::LogEvent {
            event: event.into(),
            data,
        })
    }

    pub fn pause(&self) -> ClientResult<()> {
        self.command(Command::Pause)
    }

    pub fn resume(&self) -> ClientResult<()> {
        self.command(Command::Resume)
    }

    pub async fn snapshot(&self) -> ClientResult<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Snapshot(tx))?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }

    /// Flush pending work and close the connection
    pub fn shutdown(&self) -> ClientResult<()> {
        self.command(Command::Shutdown)
    }
}

/// Drives one document session over a transport
pub struct SyncClient<T> {
    transport: T,
    config: ClientConfig,
    sync: SurfaceSynchronizer,
    deadline: Option<Instant>,
}

impl<T: ClientTransport + 'static> SyncClient<T> {
    fn new(transport: T, config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let (sync, events) = SurfaceSynchronizer::new();
        let client = Self {
            transport,
            config,
            sync,
            deadline: None,
        };
        (client, events)
    }

    /// Run on a new task; the task ends on shutdown, disconnect or a fatal error
    pub fn spawn(
        transport: T,
        config: ClientConfig,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<SurfaceEvent>, JoinHandle<ClientResult<()>>) {
        let (client, events) = Self::new(transport, config);
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(client.run(receiver));
        (ClientHandle { commands }, events, task)
    }

    async fn send(&mut self, message: &ClientMessage) -> ClientResult<()> {
        let frame = self.config.codec.encode(message)?;
        self.transport.send(frame).await
    }

    fn schedule_submit(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.config.submit_debounce);
        }
    }

    async fn flush(&mut self) -> ClientResult<()> {
        self.deadline = None;
        for message in self.sync.submit() {
            self.send(&message).await?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            author_id: self.sync.author_id(),
            text: self.sync.text().to_string(),
            history: self.sync.history().clone(),
            commit_length: self.sync.engine().commit_length(),
            sent_length: self.sync.engine().sent_length(),
            initialized: self.sync.is_initialized(),
            authors: self.sync.authors().clone(),
            selections: self.sync.selections().clone(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> ClientResult<()> {
        let join = ClientMessage::Join {
            doc: self.config.doc.clone(),
            author_id: self.config.author_id,
            token: self.config.token.clone(),
            start_length: 0,
        };
        self.send(&join).await?;
        info!(doc = %self.config.doc, "Joining document");

        loop {
            let deadline = self.deadline;
            tokio::select! {
                frame = self.transport.recv() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => {
                            info!(doc = %self.config.doc, "Server closed the connection");
                            return Err(ClientError::Disconnected);
                        }
                    };
                    self.on_frame(frame)?;
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        return self.flush().await;
                    };
                    if !self.on_command(command).await? {
                        self.flush().await?;
                        info!(doc = %self.config.doc, "Client shut down");
                        return Ok(());
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await?;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> ClientResult<()> {
        let message = match Codec::decode::<ServerMessage>(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed server message");
                return Ok(());
            }
        };
        debug!(kind = message.kind(), "Server message");

        match self.sync.handle(message) {
            Ok(()) => {}
            Err(ClientError::Server { code, message }) if code == codes::STORAGE => {
                warn!(code = %code, message = %message, "Server could not persist");
            }
            Err(e) => return Err(e),
        }

        if self.sync.has_unsent() {
            self.schedule_submit();
        }
        Ok(())
    }

    /// Returns false once the client should stop
    async fn on_command(&mut self, command: Command) -> ClientResult<bool> {
        match command {
            Command::Edit(steps) => match self.sync.local_edit(steps) {
                Ok(true) => self.schedule_submit(),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Rejected local edit"),
            },
            Command::Select(selection) => match self.sync.local_select(selection) {
                Ok(true) => self.schedule_submit(),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Rejected local selection"),
            },
            Command::ChangeAuthor(patch) => {
                self.send(&ClientMessage::ChangeAuthor(patch)).await?;
            }
            Command::LogEvent { event, data } => {
                self.send(&ClientMessage::LogEvent { event, data }).await?;
            }
            Command::Pause => self.sync.pause(),
            Command::Resume => {
                if self.sync.resume()? {
                    self.schedule_submit();
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }
}
