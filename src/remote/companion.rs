//! TCP companion link.
//!
//! Requests carry a sequence number and are answered by a `response` frame
//! with the same number. A single reader task owns the receive half of the
//! connection: it completes pending requests and forwards `team_message`
//! broadcasts to the push subscriber, if any.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::JsonFrameCodec;
use super::frames::{error_codes, ClientFrame, ServerFrame, WireChatMessage};
use super::{PushSubscription, RemoteLink, RemoteSession};
use crate::common::error::{
    ConnectionError, ConnectionResult, PushRegistrationError, SendFailure,
};
use crate::common::InboundMessage;
use crate::config::{PushCredentials, ServerCredentials};

const PUSH_BUFFER: usize = 256;

type ClientCodec = JsonFrameCodec<ServerFrame, ClientFrame>;

/// Opens [`CompanionSession`]s over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompanionLink;

#[async_trait]
impl RemoteLink for CompanionLink {
    async fn connect(
        &self,
        credentials: &ServerCredentials,
    ) -> ConnectionResult<Arc<dyn RemoteSession>> {
        debug!("Connecting to {}", credentials.endpoint());
        let stream = TcpStream::connect((credentials.address.as_str(), credentials.port)).await?;
        stream.set_nodelay(true)?;

        let session = CompanionSession::handshake(stream, credentials).await?;
        info!("Authenticated with {}", credentials.endpoint());
        Ok(Arc::new(session))
    }
}

/// A reply to one request.
#[derive(Debug)]
struct Reply {
    error: Option<String>,
    messages: Vec<WireChatMessage>,
}

/// Request could not be answered because the session is gone.
#[derive(Debug)]
struct Closed(String);

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u32, oneshot::Sender<Reply>>>,
    push_tx: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl Shared {
    fn take_pending(&self, seq: u32) -> Option<oneshot::Sender<Reply>> {
        self.pending.lock().ok().and_then(|mut p| p.remove(&seq))
    }

    fn push_sender(&self) -> Option<mpsc::Sender<InboundMessage>> {
        self.push_tx.lock().ok().and_then(|tx| tx.clone())
    }

    fn set_push_sender(&self, tx: Option<mpsc::Sender<InboundMessage>>) {
        if let Ok(mut slot) = self.push_tx.lock() {
            *slot = tx;
        }
    }

    /// Fail all in-flight requests and end the push stream.
    fn close(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        self.set_push_sender(None);
    }
}

/// Removes a pending request if its caller gives up (e.g. on timeout).
struct PendingGuard<'a> {
    shared: &'a Shared,
    seq: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.take_pending(self.seq);
    }
}

pub struct CompanionSession<S> {
    writer: tokio::sync::Mutex<SplitSink<Framed<S, ClientCodec>, ClientFrame>>,
    shared: Arc<Shared>,
    next_seq: AtomicU32,
    closed: CancellationToken,
}

impl<S> CompanionSession<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Start the reader task and authenticate.
    pub async fn handshake(stream: S, credentials: &ServerCredentials) -> ConnectionResult<Self> {
        let session = Self::start(stream);
        let reply = session
            .request(|seq| ClientFrame::Auth {
                seq,
                player_id: credentials.player_id,
                player_token: credentials.player_token,
            })
            .await
            .map_err(|Closed(message)| ConnectionError::network(message))?;

        match reply.error.as_deref() {
            None => Ok(session),
            Some(code) => {
                session.disconnect().await;
                Err(connection_error(code))
            }
        }
    }

    fn start(stream: S) -> Self {
        let (writer, reader) = Framed::new(stream, ClientCodec::new()).split();
        let shared = Arc::new(Shared::default());
        let closed = CancellationToken::new();

        tokio::spawn(read_loop(reader, shared.clone(), closed.clone()));

        Self {
            writer: tokio::sync::Mutex::new(writer),
            shared,
            next_seq: AtomicU32::new(1),
            closed,
        }
    }

    async fn request(&self, build: impl FnOnce(u32) -> ClientFrame) -> Result<Reply, Closed> {
        if self.closed.is_cancelled() {
            return Err(Closed("session closed".to_string()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(seq, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            seq,
        };

        {
            let mut writer = self.writer.lock().await;
            writer
                .send(build(seq))
                .await
                .map_err(|e| Closed(e.to_string()))?;
        }

        rx.await
            .map_err(|_| Closed("connection closed before reply".to_string()))
    }
}

#[async_trait]
impl<S> RemoteSession for CompanionSession<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_team_message(&self, text: &str) -> Result<(), SendFailure> {
        let reply = self
            .request(|seq| ClientFrame::SendTeamMessage {
                seq,
                message: text.to_string(),
            })
            .await
            .map_err(|Closed(message)| SendFailure::Link { message })?;

        match reply.error {
            None => Ok(()),
            Some(reason) => Err(SendFailure::Rejected { reason }),
        }
    }

    async fn team_chat(&self) -> ConnectionResult<Vec<InboundMessage>> {
        let reply = self
            .request(|seq| ClientFrame::GetTeamChat { seq })
            .await
            .map_err(|Closed(message)| ConnectionError::network(message))?;

        match reply.error.as_deref() {
            None => Ok(reply.messages.into_iter().map(InboundMessage::from).collect()),
            Some(code) => Err(connection_error(code)),
        }
    }

    async fn subscribe(
        &self,
        credentials: &PushCredentials,
    ) -> Result<PushSubscription, PushRegistrationError> {
        // Install the sender first so no broadcast sent right after the
        // reply is lost.
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        self.shared.set_push_sender(Some(tx));

        let result = self
            .request(|seq| ClientFrame::Subscribe {
                seq,
                credentials: credentials.as_value().clone(),
            })
            .await;

        let failure = match result {
            Ok(Reply { error: None, .. }) => return Ok(PushSubscription::new(rx)),
            Ok(Reply {
                error: Some(code), ..
            }) if code == error_codes::INVALID_PUSH_TOKEN => {
                PushRegistrationError::Rejected { reason: code }
            }
            Ok(Reply {
                error: Some(code), ..
            }) => PushRegistrationError::Unavailable { message: code },
            Err(Closed(message)) => PushRegistrationError::Unavailable { message },
        };

        self.shared.set_push_sender(None);
        Err(failure)
    }

    async fn heartbeat(&self) -> ConnectionResult<()> {
        let reply = self
            .request(|seq| ClientFrame::Ping { seq })
            .await
            .map_err(|Closed(message)| ConnectionError::network(message))?;

        match reply.error.as_deref() {
            None => Ok(()),
            Some(code) => Err(connection_error(code)),
        }
    }

    async fn disconnect(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.shared.close();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("Error closing companion link: {}", e);
        }
    }
}

impl<S> Drop for CompanionSession<S> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn connection_error(code: &str) -> ConnectionError {
    match code {
        error_codes::NOT_AUTHORIZED => ConnectionError::Auth {
            reason: code.to_string(),
        },
        error_codes::NOT_IN_TEAM => ConnectionError::TeamNotFound,
        other => ConnectionError::network(format!("server error: {}", other)),
    }
}

async fn read_loop<S>(
    mut reader: SplitStream<Framed<S, ClientCodec>>,
    shared: Arc<Shared>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(ServerFrame::Response {
                seq,
                error,
                messages,
            })) => match shared.take_pending(seq) {
                Some(tx) => {
                    let _ = tx.send(Reply { error, messages });
                }
                None => debug!("Dropping reply for unknown request {}", seq),
            },
            Some(Ok(ServerFrame::TeamMessage { message })) => {
                let Some(tx) = shared.push_sender() else {
                    debug!("Ignoring team message broadcast without a subscriber");
                    continue;
                };
                if tx.send(InboundMessage::from(message)).await.is_err() {
                    debug!("Push subscriber went away");
                    shared.set_push_sender(None);
                }
            }
            Some(Err(e)) => {
                warn!("Companion link read error: {}", e);
                break;
            }
            None => {
                info!("Companion link closed by server");
                break;
            }
        }
    }

    closed.cancel();
    shared.close();
}
