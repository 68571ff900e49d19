//! Connection handler - decodes client frames and drives the session

use crate::error::{TransportError, TransportResult};
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::session::{SessionContext, SessionOrchestrator};
use futures_util::{pin_mut, Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tandem_protocol::{codes, ClientMessage, Codec, Frame, ServerMessage};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What the connection loop must do after a frame was processed
#[derive(Default)]
pub struct Outcome {
    pub replies: Vec<ServerMessage>,
    /// Subscription to the joined document's broadcasts
    pub updates: Option<broadcast::Receiver<ServerMessage>>,
    pub close: bool,
}

impl Outcome {
    fn reply(message: ServerMessage) -> Self {
        Self {
            replies: vec![message],
            ..Default::default()
        }
    }

    fn fatal(message: ServerMessage) -> Self {
        Self {
            replies: vec![message],
            close: true,
            ..Default::default()
        }
    }
}

/// Handles a single client connection
pub struct ConnectionHandler {
    /// Unique client ID
    pub client_id: String,
    session: Arc<SessionOrchestrator>,
    context: Option<SessionContext>,
    /// Codec of the last frame received; replies use the same
    codec: Codec,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionHandler {
    pub fn new(client_id: String, session: Arc<SessionOrchestrator>) -> Self {
        Self {
            client_id,
            session,
            context: None,
            codec: Codec::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn encode(&self, message: &ServerMessage) -> TransportResult<Frame> {
        Ok(self.codec.encode(message)?)
    }

    /// Process one incoming frame
    pub async fn process(&mut self, frame: Frame) -> Outcome {
        self.codec = frame.codec();

        let message = match Codec::decode::<ClientMessage>(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(client = %self.client_id, error = %e, "Ignoring malformed message");
                #[cfg(feature = "metrics")]
                self.record_error(codes::MALFORMED);
                return Outcome::default();
            }
        };

        debug!(client = %self.client_id, kind = message.kind(), "Processing message");
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_message(message.kind());
        }

        let outcome = match message {
            ClientMessage::Join {
                doc,
                author_id,
                token,
                start_length,
            } => self.handle_join(doc, author_id, token, start_length).await,
            other => match self.context.clone() {
                Some(context) => self.handle_joined(&context, other).await,
                None => Outcome::reply(ServerMessage::error(
                    codes::NOT_JOINED,
                    "Send join before any other message",
                )),
            },
        };

        #[cfg(feature = "metrics")]
        for reply in &outcome.replies {
            if let ServerMessage::Error { code, .. } = reply {
                self.record_error(code);
            }
        }

        outcome
    }

    async fn handle_join(
        &mut self,
        doc: tandem_core::DocumentName,
        author_id: Option<tandem_core::AuthorId>,
        token: Option<String>,
        start_length: usize,
    ) -> Outcome {
        if let Some(context) = &self.context {
            warn!(client = %self.client_id, doc = %context.doc, "Ignoring repeated join");
            return Outcome::default();
        }

        let welcome = async {
            let context = self
                .session
                .authenticate(&doc, author_id, token.as_deref())
                .await?;
            let welcome = self.session.welcome_client(&context, start_length).await?;
            Ok::<_, TransportError>((context, welcome))
        }
        .await;

        match welcome {
            Ok((context, welcome)) => {
                info!(
                    client = %self.client_id,
                    doc = %context.doc,
                    author = context.author_id,
                    "Client joined"
                );
                self.context = Some(context);
                Outcome {
                    replies: welcome.messages,
                    updates: Some(welcome.updates),
                    close: false,
                }
            }
            Err(e) => {
                warn!(client = %self.client_id, doc = %doc, error = %e, "Join failed");
                Outcome::fatal(ServerMessage::error(codes::STORAGE, e.to_string()))
            }
        }
    }

    async fn handle_joined(&mut self, context: &SessionContext, message: ClientMessage) -> Outcome {
        match message {
            ClientMessage::Join { .. } => Outcome::default(),
            ClientMessage::SubmitChange { backtrack, change } => {
                match self.session.on_submit_change(context, backtrack, &change).await {
                    Ok(submitted) => {
                        debug!(
                            client = %self.client_id,
                            applied = submitted.applied.len(),
                            rejections = submitted.rejections,
                            "Submission processed"
                        );
                        #[cfg(feature = "metrics")]
                        if let Some(metrics) = &self.metrics {
                            metrics.record_submission(submitted.applied.len(), submitted.rejections);
                        }
                        Outcome::default()
                    }
                    Err(e) if e.is_protocol_violation() => {
                        warn!(
                            client = %self.client_id,
                            author = context.author_id,
                            error = %e,
                            "Protocol violation, closing connection"
                        );
                        Outcome::fatal(ServerMessage::error(codes::PROTOCOL_VIOLATION, e.to_string()))
                    }
                    Err(e) => Outcome::reply(ServerMessage::error(codes::STORAGE, e.to_string())),
                }
            }
            ClientMessage::ChangeAuthor(patch) => match self.session.on_change_author(context, &patch) {
                Ok(_) => Outcome::default(),
                Err(e) => Outcome::reply(ServerMessage::error(codes::INTERNAL, e.to_string())),
            },
            ClientMessage::LogEvent { event, data } => {
                self.session.on_log_event(context, &event, &data);
                Outcome::default()
            }
        }
    }

    #[cfg(feature = "metrics")]
    fn record_error(&self, code: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(code);
        }
    }

    /// Clean up when connection closes
    pub fn cleanup(&mut self) {
        if let Some(context) = self.context.take() {
            self.session.on_disconnect(&context);
        }
    }

    /// Pump frames between a connection and the session until either side
    /// closes. Broadcasts for the joined document are forwarded as they come.
    pub async fn run<S, K>(mut self, incoming: S, outgoing: K) -> TransportResult<()>
    where
        S: Stream<Item = Frame>,
        K: Sink<Frame, Error = TransportError>,
    {
        pin_mut!(incoming, outgoing);
        let result = self.pump(&mut incoming, &mut outgoing).await;
        self.cleanup();
        let _ = outgoing.close().await;
        result
    }

    async fn pump<S, K>(&mut self, incoming: &mut S, outgoing: &mut K) -> TransportResult<()>
    where
        S: Stream<Item = Frame> + Unpin,
        K: Sink<Frame, Error = TransportError> + Unpin,
    {
        let mut updates: Option<broadcast::Receiver<ServerMessage>> = None;

        loop {
            tokio::select! {
                frame = incoming.next() => {
                    let Some(frame) = frame else {
                        debug!(client = %self.client_id, "Client closed the connection");
                        return Ok(());
                    };

                    let outcome = self.process(frame).await;
                    for reply in &outcome.replies {
                        outgoing.send(self.encode(reply)?).await?;
                    }
                    if outcome.updates.is_some() {
                        updates = outcome.updates;
                    }
                    if outcome.close {
                        return Ok(());
                    }
                }

                update = next_update(&mut updates) => {
                    match update {
                        Ok(message) => {
                            outgoing.send(self.encode(&message)?).await?;
                            #[cfg(feature = "metrics")]
                            if let Some(metrics) = &self.metrics {
                                metrics.record_broadcast();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(client = %self.client_id, missed, "Client lagged behind broadcasts, closing");
                            let reply = ServerMessage::error(codes::LAGGED, format!("Missed {} updates", missed));
                            outgoing.send(self.encode(&reply)?).await?;
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn next_update(
    updates: &mut Option<broadcast::Receiver<ServerMessage>>,
) -> Result<ServerMessage, broadcast::error::RecvError> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{Change, DocumentName, Step, Transaction};
    use tandem_storage::MemoryStorage;

    fn handler() -> ConnectionHandler {
        let session = Arc::new(SessionOrchestrator::new(Arc::new(MemoryStorage::new())));
        ConnectionHandler::new("test:0".into(), session)
    }

    fn json(message: &ClientMessage) -> Frame {
        Codec::Json.encode(message).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let mut handler = handler();
        let outcome = handler.process(Frame::Text("{not json".into())).await;
        assert!(outcome.replies.is_empty());
        assert!(!outcome.close);
    }

    #[tokio::test]
    async fn test_submit_before_join() {
        let mut handler = handler();
        let submit = ClientMessage::SubmitChange {
            backtrack: 0,
            change: Change::empty(0),
        };
        let outcome = handler.process(json(&submit)).await;
        assert!(matches!(
            &outcome.replies[..],
            [ServerMessage::Error { code, .. }] if code == codes::NOT_JOINED
        ));
        assert!(!outcome.close);
    }

    #[tokio::test]
    async fn test_join_replies_in_client_codec() {
        let mut handler = handler();
        let join = ClientMessage::join(DocumentName::new("notes").unwrap());
        let outcome = handler.process(Codec::MessagePack.encode(&join).unwrap()).await;

        assert_eq!(outcome.replies.len(), 2);
        assert!(outcome.updates.is_some());
        assert_eq!(handler.codec(), Codec::MessagePack);
        assert!(matches!(handler.encode(&outcome.replies[0]).unwrap(), Frame::Binary(_)));
    }

    #[tokio::test]
    async fn test_protocol_violation_closes() {
        let mut handler = handler();
        handler
            .process(json(&ClientMessage::join(DocumentName::new("notes").unwrap())))
            .await;
        let author = handler.context().unwrap().author_id;

        let submit = ClientMessage::SubmitChange {
            backtrack: 1,
            change: Change::new(0, vec![Transaction::new(author, vec![Step::insert(0, "x")])]),
        };
        let outcome = handler.process(json(&submit)).await;
        assert!(outcome.close);
        assert!(matches!(
            &outcome.replies[..],
            [ServerMessage::Error { code, .. }] if code == codes::PROTOCOL_VIOLATION
        ));
    }

    #[tokio::test]
    async fn test_cleanup_deactivates_author() {
        let mut handler = handler();
        let doc = DocumentName::new("notes").unwrap();
        handler.process(json(&ClientMessage::join(doc.clone()))).await;
        let session = handler.session.clone();
        assert_eq!(session.coordinator().authors(&doc).len(), 1);

        handler.cleanup();
        assert!(session.coordinator().authors(&doc).is_empty());
        assert!(handler.context().is_none());
    }
}
