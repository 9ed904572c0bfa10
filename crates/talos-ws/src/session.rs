//! Boundary to the application layer.
//!
//! The engine hands decoded frames to a [`SessionHandler`] created by the
//! [`ClientEndpoint`] once the handshake succeeds. Callbacks run while the
//! connection is locked, so they reply through the [`SessionContext`] they
//! are given rather than through a [`ConnectionSender`](crate::ConnectionSender).

use bytes::Bytes;
use tracing::warn;

use crate::connection::ConnectionId;
use crate::error::{CloseReason, WsError, WsResult};
use crate::extension::ExtensionDescriptor;
use crate::frame::Frame;

/// Replies queued by a session callback.
///
/// Queued frames are sent, in order, when the callback returns; a requested
/// close runs after them.
#[derive(Debug)]
pub struct SessionContext {
    connection_id: ConnectionId,
    outgoing: Vec<Frame>,
    close: Option<CloseReason>,
}

impl SessionContext {
    pub(crate) fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            outgoing: Vec::new(),
            close: None,
        }
    }

    /// The connection the callback belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a frame.
    pub fn send(&mut self, frame: Frame) {
        self.outgoing.push(frame);
    }

    /// Queue a text frame.
    pub fn send_text(&mut self, text: impl Into<String>) {
        self.send(Frame::text(text.into()));
    }

    /// Queue a binary frame.
    pub fn send_binary(&mut self, data: impl Into<Bytes>) {
        self.send(Frame::binary(data));
    }

    /// Close the connection once queued frames are sent.
    pub fn close(&mut self, reason: CloseReason) {
        self.close = Some(reason);
    }

    pub(crate) fn into_parts(self) -> (Vec<Frame>, Option<CloseReason>) {
        (self.outgoing, self.close)
    }
}

/// Receives the frames of one connection.
pub trait SessionHandler: Send {
    /// The connection is open.
    fn on_connect(&mut self, _ctx: &mut SessionContext) {}

    /// A data frame (text, binary or continuation) arrived.
    fn on_frame(&mut self, ctx: &mut SessionContext, frame: &Frame);

    /// A ping arrived. The pong has already been sent.
    fn on_ping(&mut self, _ctx: &mut SessionContext, _payload: &Bytes) {}

    /// A pong arrived.
    fn on_pong(&mut self, _ctx: &mut SessionContext, _payload: &Bytes) {}

    /// The connection closed.
    fn on_close(&mut self, _reason: &CloseReason) {}
}

/// The application endpoint a client engine connects on behalf of.
pub trait ClientEndpoint: Send + Sync {
    /// Create the session for a freshly upgraded connection.
    fn create_session(
        &self,
        subprotocol: Option<&str>,
        extensions: &[ExtensionDescriptor],
    ) -> WsResult<Box<dyn SessionHandler>>;

    /// The connection is open and its session connected.
    fn on_open(&self, _connection_id: ConnectionId) {}

    /// The handshake failed.
    fn on_error(&self, error: &WsError) {
        warn!(error = %error, "WebSocket handshake failed");
    }
}
