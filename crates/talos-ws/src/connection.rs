//! Established connections.
//!
//! A successful handshake yields a [`ConnectionFactory`]; the transport turns
//! it into a [`Connection`], feeds inbound chunks to its read side and sends
//! frames through any number of [`ConnectionSender`] clones.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CloseCode, CloseReason, WsError, WsResult};
use crate::extension::ExtensionDescriptor;
use crate::frame::Frame;
use crate::protocol::ProtocolHandler;
use crate::reassembly::ReadHandler;

/// A unique identifier for a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new time-ordered connection ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Outbound half of the transport.
pub trait Writer: Send {
    /// Write encoded bytes to the peer.
    fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// Close the transport.
    fn close(&mut self) -> io::Result<()>;
}

/// Notified once when a connection closes, whatever the cause.
pub trait CloseListener: Send {
    /// The connection closed with `reason`.
    fn on_close(&self, reason: &CloseReason);
}

impl<F> CloseListener for F
where
    F: Fn(&CloseReason) + Send,
{
    fn on_close(&self, reason: &CloseReason) {
        self(reason);
    }
}

/// A close listener call parked by [`ProtocolHandler::close`].
///
/// Fired by whoever released the handler lock, so the listener may call back
/// into the connection.
#[must_use = "the close listener only runs when the notification is fired"]
pub struct CloseNotification {
    listener: Box<dyn CloseListener>,
    reason: CloseReason,
}

impl CloseNotification {
    pub(crate) fn new(listener: Box<dyn CloseListener>, reason: CloseReason) -> Self {
        Self { listener, reason }
    }

    /// The reason the connection closed with.
    pub fn reason(&self) -> &CloseReason {
        &self.reason
    }

    /// Run the listener.
    pub fn fire(self) {
        self.listener.on_close(&self.reason);
    }
}

impl std::fmt::Debug for CloseNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseNotification")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Close `handler` and return the parked listener call, without holding the
/// lock past the return.
fn close_shared(
    handler: &Mutex<ProtocolHandler>,
    reason: CloseReason,
) -> Option<CloseNotification> {
    let mut handler = handler.lock();
    handler.close(reason);
    handler.take_close_notification()
}

/// Cloneable handle for sending frames on a connection.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    id: ConnectionId,
    handler: Arc<Mutex<ProtocolHandler>>,
}

impl ConnectionSender {
    /// Connection this sender writes to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send a frame.
    ///
    /// # Errors
    ///
    /// Returns `WsError::ConnectionClosed` if the connection is closed, or
    /// the writer's error.
    pub fn send(&self, frame: Frame) -> WsResult<()> {
        self.handler.lock().send(frame)
    }

    /// Send a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> WsResult<()> {
        self.send(Frame::text(text.into()))
    }

    /// Send a binary frame.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> WsResult<()> {
        self.send(Frame::binary(data))
    }

    /// Send a ping.
    pub fn ping(&self, payload: impl Into<Bytes>) -> WsResult<()> {
        let payload = payload.into();
        if payload.len() > crate::frame::MAX_CONTROL_PAYLOAD {
            return Err(WsError::send_failed("ping payload exceeds 125 bytes"));
        }
        self.send(Frame::ping(payload))
    }

    /// Close the connection. Later calls do nothing.
    pub fn close(&self, reason: CloseReason) {
        if let Some(notification) = close_shared(&self.handler, reason) {
            notification.fire();
        }
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.handler.lock().is_closed()
    }
}

/// An open client connection.
#[derive(Debug)]
pub struct Connection {
    read_handler: ReadHandler,
    sender: ConnectionSender,
    subprotocol: Option<String>,
    extensions: Vec<ExtensionDescriptor>,
}

impl Connection {
    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.sender.id
    }

    /// Negotiated subprotocol.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Negotiated extensions, in negotiated order.
    pub fn extensions(&self) -> &[ExtensionDescriptor] {
        &self.extensions
    }

    /// Feed a chunk read from the transport.
    pub fn handle_read(&mut self, chunk: &[u8]) {
        self.read_handler.handle(chunk);
    }

    /// The read side of the connection.
    pub fn read_handler(&mut self) -> &mut ReadHandler {
        &mut self.read_handler
    }

    /// A sender for this connection.
    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    /// Send a frame.
    pub fn send(&self, frame: Frame) -> WsResult<()> {
        self.sender.send(frame)
    }

    /// Close the connection. Later calls do nothing.
    pub fn close(&self, reason: CloseReason) {
        self.sender.close(reason);
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Split into the read side and a sender, e.g. to move reading onto
    /// another thread.
    pub fn into_parts(self) -> (ReadHandler, ConnectionSender) {
        (self.read_handler, self.sender)
    }
}

/// Builds the [`Connection`] of a successful handshake.
///
/// Dropping the factory without creating the connection closes the wired
/// protocol handler so extension state is released.
#[derive(Debug)]
pub struct ConnectionFactory {
    id: ConnectionId,
    handler: Option<Arc<Mutex<ProtocolHandler>>>,
    max_buffer_size: usize,
    subprotocol: Option<String>,
    extensions: Vec<ExtensionDescriptor>,
}

impl ConnectionFactory {
    pub(crate) fn new(
        handler: ProtocolHandler,
        max_buffer_size: usize,
        subprotocol: Option<String>,
        extensions: Vec<ExtensionDescriptor>,
    ) -> Self {
        Self {
            id: handler.connection_id(),
            handler: Some(Arc::new(Mutex::new(handler))),
            max_buffer_size,
            subprotocol,
            extensions,
        }
    }

    /// Identifier the connection will carry.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Maximum size of the inbound reassembly buffer.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Negotiated subprotocol.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Negotiated extensions.
    pub fn extensions(&self) -> &[ExtensionDescriptor] {
        &self.extensions
    }

    /// Create the connection.
    ///
    /// # Errors
    ///
    /// Returns `WsError::IllegalState` on the second call.
    pub fn create_connection(&mut self) -> WsResult<Connection> {
        let handler = self
            .handler
            .take()
            .ok_or_else(|| WsError::illegal_state("connection already created"))?;

        debug!(connection_id = %self.id, max_buffer_size = self.max_buffer_size, "Creating connection");

        Ok(Connection {
            read_handler: ReadHandler::new(Arc::clone(&handler), self.max_buffer_size),
            sender: ConnectionSender {
                id: self.id,
                handler,
            },
            subprotocol: self.subprotocol.clone(),
            extensions: self.extensions.clone(),
        })
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            debug!(connection_id = %self.id, "Connection factory dropped before use");
            let reason = CloseReason::new(CloseCode::GoingAway, "connection abandoned");
            if let Some(notification) = close_shared(&handler, reason) {
                notification.fire();
            }
        }
    }
}
