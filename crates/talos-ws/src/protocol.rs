//! Per-connection protocol state.
//!
//! The [`ProtocolHandler`] decodes frames out of the read buffer, dispatches
//! them to the bound session, writes outbound frames through the extension
//! pipeline and owns the single close path of a connection.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::connection::{CloseListener, CloseNotification, ConnectionId, Writer};
use crate::error::{CloseReason, WsError, WsResult};
use crate::extension::{Extension, ExtensionContext, ExtensionPipeline};
use crate::frame::{self, Frame, Opcode};
use crate::session::{SessionContext, SessionHandler};

/// Wire protocol version, sent as `Sec-WebSocket-Version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    /// RFC 6455 (`13`).
    #[default]
    Rfc6455,
    /// hybi-08 draft (`8`).
    Hybi08,
}

impl Version {
    /// The `Sec-WebSocket-Version` header value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rfc6455 => "13",
            Self::Hybi08 => "8",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame-level protocol handler for one connection.
pub struct ProtocolHandler {
    version: Version,
    connection_id: ConnectionId,
    writer: Option<Box<dyn Writer>>,
    session: Option<Box<dyn SessionHandler>>,
    pipeline: ExtensionPipeline,
    context: ExtensionContext,
    close_listener: Option<Box<dyn CloseListener>>,
    pending_close: Option<CloseNotification>,
    fragmented: bool,
    close_reason: Option<CloseReason>,
}

impl ProtocolHandler {
    /// Create an unbound handler.
    pub fn new(version: Version) -> Self {
        Self {
            version,
            connection_id: ConnectionId::new(),
            writer: None,
            session: None,
            pipeline: ExtensionPipeline::default(),
            context: ExtensionContext::new(),
            close_listener: None,
            pending_close: None,
            fragmented: false,
            close_reason: None,
        }
    }

    /// Protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Connection identifier used in logs and session callbacks.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Bind the transport writer.
    pub fn set_writer(&mut self, writer: Box<dyn Writer>) {
        self.writer = Some(writer);
    }

    /// Bind the session receiving frames.
    pub fn set_session(&mut self, session: Box<dyn SessionHandler>) {
        self.session = Some(session);
    }

    /// Set the negotiated extensions, in negotiated order.
    pub fn set_extensions(&mut self, extensions: Vec<Extension>) {
        self.pipeline = ExtensionPipeline::new(extensions);
    }

    /// Set the extension context of this connection.
    pub fn set_extension_context(&mut self, context: ExtensionContext) {
        self.context = context;
    }

    /// Set the listener notified once the connection closes.
    pub fn set_close_listener(&mut self, listener: Box<dyn CloseListener>) {
        self.close_listener = Some(listener);
    }

    /// Negotiated extensions.
    pub fn extensions(&self) -> &[Extension] {
        self.pipeline.extensions()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    /// The reason the connection closed with, once closed.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Decode the next frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not hold a complete frame yet.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed frames, masked frames, and
    /// reserved bits when no extension was negotiated.
    pub fn unframe(&mut self, buf: &mut BytesMut) -> WsResult<Option<Frame>> {
        let Some(frame) = frame::decode(buf)? else {
            return Ok(None);
        };

        if frame.mask_key.is_some() {
            return Err(WsError::protocol("server frames must not be masked"));
        }
        if frame.has_rsv_bits() && self.pipeline.is_empty() {
            return Err(WsError::protocol(
                "reserved bits set without a negotiated extension",
            ));
        }

        Ok(Some(frame))
    }

    /// Run an inbound frame through the negotiated extensions.
    pub fn apply_incoming(&mut self, frame: Frame) -> Frame {
        self.pipeline.apply_incoming(&mut self.context, frame)
    }

    /// Notify the session that the connection is open.
    pub fn connect(&mut self) -> WsResult<()> {
        let mut ctx = SessionContext::new(self.connection_id);
        if let Some(session) = self.session.as_mut() {
            session.on_connect(&mut ctx);
        }
        self.flush(ctx)
    }

    /// Dispatch a decoded (and extension-processed) frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for out-of-sequence fragments or malformed
    /// close frames, and write errors from answering pings.
    pub fn process(&mut self, frame: Frame) -> WsResult<()> {
        if self.is_closed() {
            debug!(connection_id = %self.connection_id, opcode = ?frame.opcode, "Dropping frame after close");
            return Ok(());
        }

        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.fragmented {
                    return Err(WsError::protocol(
                        "data frame received while a fragmented message is in progress",
                    ));
                }
                self.fragmented = !frame.fin;
                self.deliver(&frame)
            }
            Opcode::Continuation => {
                if !self.fragmented {
                    return Err(WsError::protocol(
                        "continuation frame without a fragmented message",
                    ));
                }
                self.fragmented = !frame.fin;
                self.deliver(&frame)
            }
            Opcode::Ping => {
                self.send(Frame::pong(frame.payload.clone()))?;
                let mut ctx = SessionContext::new(self.connection_id);
                if let Some(session) = self.session.as_mut() {
                    session.on_ping(&mut ctx, &frame.payload);
                }
                self.flush(ctx)
            }
            Opcode::Pong => {
                let mut ctx = SessionContext::new(self.connection_id);
                if let Some(session) = self.session.as_mut() {
                    session.on_pong(&mut ctx, &frame.payload);
                }
                self.flush(ctx)
            }
            Opcode::Close => {
                let reason = frame.close_reason()?;
                debug!(connection_id = %self.connection_id, close_code = reason.code, "Peer sent close frame");
                self.close(reason);
                Ok(())
            }
        }
    }

    /// Send a frame through the outbound extension pipeline.
    ///
    /// The frame is masked with a fresh key before it is written.
    ///
    /// # Errors
    ///
    /// Returns `WsError::ConnectionClosed` once closed and `WsError::Io` when
    /// the writer fails.
    pub fn send(&mut self, frame: Frame) -> WsResult<()> {
        if let Some(reason) = &self.close_reason {
            return Err(WsError::connection_closed(
                Some(reason.code),
                "cannot send on a closed connection",
            ));
        }
        self.write_frame(frame)
    }

    /// Close the connection.
    ///
    /// Sends a close frame, closes the writer, notifies the session and
    /// destroys extension state. The close listener call is parked for
    /// [`take_close_notification`](Self::take_close_notification). Only the
    /// first call has any effect.
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        self.close_reason = Some(reason.clone());

        info!(connection_id = %self.connection_id, close_code = reason.code, reason = %reason.reason, "Closing connection");

        if self.writer.is_some() {
            if let Err(err) = self.write_frame(Frame::close(&reason)) {
                warn!(connection_id = %self.connection_id, error = %err, "Failed to send close frame");
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.close() {
                warn!(connection_id = %self.connection_id, error = %err, "Failed to close writer");
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.on_close(&reason);
        }
        self.pipeline.destroy(&mut self.context);
        if let Some(listener) = self.close_listener.take() {
            self.pending_close = Some(CloseNotification::new(listener, reason));
        }
    }

    /// Take the close listener call parked by [`close`](Self::close).
    ///
    /// Fire it only after the lock guarding this handler is released.
    pub fn take_close_notification(&mut self) -> Option<CloseNotification> {
        self.pending_close.take()
    }

    fn deliver(&mut self, frame: &Frame) -> WsResult<()> {
        let mut ctx = SessionContext::new(self.connection_id);
        if let Some(session) = self.session.as_mut() {
            session.on_frame(&mut ctx, frame);
        }
        self.flush(ctx)
    }

    fn flush(&mut self, ctx: SessionContext) -> WsResult<()> {
        let (frames, close) = ctx.into_parts();
        for frame in frames {
            self.send(frame)?;
        }
        if let Some(reason) = close {
            self.close(reason);
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: Frame) -> WsResult<()> {
        let mut frame = self.pipeline.apply_outgoing(&mut self.context, frame);
        frame.mask_key = Some(frame::generate_mask_key());

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| WsError::illegal_state("no writer bound to the connection"))?;

        debug!(connection_id = %self.connection_id, opcode = ?frame.opcode, len = frame.payload.len(), "Writing frame");
        let bytes: Bytes = frame.to_bytes();
        writer.write(bytes)?;
        Ok(())
    }
}

impl fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("version", &self.version)
            .field("connection_id", &self.connection_id)
            .field("extensions", &self.pipeline.extensions())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::error::CloseCode;
    use crate::extension::{ExtendedExtension, ExtensionDescriptor};

    #[derive(Clone, Default)]
    struct Recorder {
        written: Arc<Mutex<Vec<Bytes>>>,
        closed: Arc<Mutex<usize>>,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn written_frames(&self) -> Vec<Frame> {
            self.written
                .lock()
                .iter()
                .map(|b| frame::decode(&mut BytesMut::from(&b[..])).unwrap().unwrap())
                .collect()
        }
    }

    impl Writer for Recorder {
        fn write(&mut self, data: Bytes) -> io::Result<()> {
            self.written.lock().push(data);
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            *self.closed.lock() += 1;
            Ok(())
        }
    }

    impl SessionHandler for Recorder {
        fn on_frame(&mut self, ctx: &mut SessionContext, frame: &Frame) {
            self.events
                .lock()
                .push(format!("frame:{}", String::from_utf8_lossy(&frame.payload)));
            if &frame.payload[..] == b"echo" {
                ctx.send_text("echoed");
            }
        }

        fn on_ping(&mut self, _ctx: &mut SessionContext, payload: &Bytes) {
            self.events.lock().push(format!("ping:{}", payload.len()));
        }

        fn on_close(&mut self, reason: &CloseReason) {
            self.events.lock().push(format!("close:{}", reason.code));
        }
    }

    fn handler(recorder: &Recorder) -> ProtocolHandler {
        let mut handler = ProtocolHandler::new(Version::Rfc6455);
        handler.set_writer(Box::new(recorder.clone()));
        handler.set_session(Box::new(recorder.clone()));
        handler
    }

    #[test]
    fn test_version_strings() {
        assert_eq!(Version::default(), Version::Rfc6455);
        assert_eq!(Version::Rfc6455.as_str(), "13");
        assert_eq!(Version::Hybi08.to_string(), "8");
    }

    #[test]
    fn test_unframe_rejects_masked_frames() {
        let mut frame = Frame::text("x");
        frame.mask_key = Some([1, 2, 3, 4]);
        let mut buf = BytesMut::from(&frame.to_bytes()[..]);
        let err = ProtocolHandler::new(Version::Rfc6455).unframe(&mut buf).unwrap_err();
        assert_eq!(err.close_code(), Some(1002));
    }

    #[test]
    fn test_unframe_rejects_rsv_without_extensions() {
        let mut buf = BytesMut::from(&Frame::text("x").with_rsv1(true).to_bytes()[..]);
        assert!(ProtocolHandler::new(Version::Rfc6455).unframe(&mut buf).is_err());
    }

    #[test]
    fn test_unframe_allows_rsv_with_extensions() {
        struct Identity;
        impl ExtendedExtension for Identity {
            fn process_incoming(&self, _: &mut ExtensionContext, f: &Frame) -> WsResult<Frame> {
                Ok(f.clone())
            }
            fn process_outgoing(&self, _: &mut ExtensionContext, f: &Frame) -> WsResult<Frame> {
                Ok(f.clone())
            }
        }

        let mut handler = ProtocolHandler::new(Version::Rfc6455);
        handler.set_extensions(vec![Extension::extended(
            ExtensionDescriptor::new("identity"),
            Arc::new(Identity),
        )]);
        let mut buf = BytesMut::from(&Frame::text("x").with_rsv1(true).to_bytes()[..]);
        assert!(handler.unframe(&mut buf).unwrap().unwrap().rsv1);
    }

    #[test]
    fn test_ping_is_answered_and_forwarded() {
        let recorder = Recorder::default();
        let mut handler = handler(&recorder);

        handler.process(Frame::ping("abc")).unwrap();

        let written = recorder.written_frames();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].opcode, Opcode::Pong);
        assert_eq!(&written[0].payload[..], b"abc");
        assert!(written[0].mask_key.is_some());
        assert_eq!(*recorder.events.lock(), ["ping:3"]);
    }

    #[test]
    fn test_session_replies_are_flushed() {
        let recorder = Recorder::default();
        let mut handler = handler(&recorder);

        handler.process(Frame::text("echo")).unwrap();

        let written = recorder.written_frames();
        assert_eq!(&written[0].payload[..], b"echoed");
    }

    #[test]
    fn test_fragment_sequencing() {
        let recorder = Recorder::default();
        let mut handler = handler(&recorder);

        assert!(handler.process(Frame::continuation("x", true)).is_err());

        handler.process(Frame::text("a").with_fin(false)).unwrap();
        handler.process(Frame::ping("")).unwrap();
        assert!(handler.process(Frame::binary("b")).is_err());
        handler.process(Frame::continuation("c", true)).unwrap();
        handler.process(Frame::text("d")).unwrap();
    }

    #[test]
    fn test_close_frame_is_echoed_once() {
        let recorder = Recorder::default();
        let mut handler = handler(&recorder);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        handler.set_close_listener(Box::new(move |reason: &CloseReason| {
            sink.lock().push(reason.code);
        }));

        handler
            .process(Frame::close(&CloseReason::new(CloseCode::GoingAway, "bye")))
            .unwrap();
        assert!(fired.lock().is_empty());
        handler.take_close_notification().unwrap().fire();

        handler.close(CloseReason::normal());
        assert!(handler.take_close_notification().is_none());

        let written = recorder.written_frames();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].close_reason().unwrap().code, 1001);
        assert_eq!(*recorder.closed.lock(), 1);
        assert_eq!(*fired.lock(), [1001]);
        assert_eq!(*recorder.events.lock(), ["close:1001"]);
        assert!(handler.is_closed());
    }

    #[test]
    fn test_send_after_close_fails() {
        let recorder = Recorder::default();
        let mut handler = handler(&recorder);
        handler.close(CloseReason::normal());

        assert!(matches!(
            handler.send(Frame::text("late")),
            Err(WsError::ConnectionClosed { code: Some(1000), .. })
        ));
        assert!(handler.process(Frame::text("ignored")).is_ok());
    }

    #[test]
    fn test_send_without_writer() {
        let mut handler = ProtocolHandler::new(Version::Rfc6455);
        assert!(matches!(
            handler.send(Frame::text("x")),
            Err(WsError::IllegalState(_))
        ));
    }
}
