//! Recording fakes shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderValue};
use http::StatusCode;
use parking_lot::Mutex;
use talos_ws::frame;
use talos_ws::handshake::compute_accept_key;
use talos_ws::{
    ClientEndpoint, CloseReason, ConnectionId, ExtensionDescriptor, Frame, SessionContext,
    SessionHandler, UpgradeRequest, UpgradeResponse, WsError, WsResult, Writer,
};

/// Writer that keeps every written chunk.
#[derive(Clone, Default)]
pub struct RecordingWriter {
    pub written: Arc<Mutex<Vec<Bytes>>>,
    pub closed: Arc<Mutex<usize>>,
}

impl RecordingWriter {
    /// Decode everything written so far.
    pub fn frames(&self) -> Vec<Frame> {
        let mut buf = BytesMut::new();
        for chunk in self.written.lock().iter() {
            buf.extend_from_slice(chunk);
        }
        let mut frames = Vec::new();
        while let Some(frame) = frame::decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }
}

impl Writer for RecordingWriter {
    fn write(&mut self, data: Bytes) -> io::Result<()> {
        self.written.lock().push(data);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        *self.closed.lock() += 1;
        Ok(())
    }
}

/// Everything the endpoint and its sessions observed.
#[derive(Default)]
pub struct Observed {
    pub errors: Vec<String>,
    pub opened: Vec<ConnectionId>,
    pub sessions: Vec<(Option<String>, Vec<String>)>,
    pub connected: usize,
    pub frames: Vec<Frame>,
    pub closes: Vec<CloseReason>,
}

/// Endpoint whose sessions record into a shared [`Observed`].
#[derive(Clone, Default)]
pub struct RecordingEndpoint {
    pub observed: Arc<Mutex<Observed>>,
    pub fail_sessions: bool,
}

impl RecordingEndpoint {
    pub fn failing() -> Self {
        Self {
            fail_sessions: true,
            ..Self::default()
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.observed.lock().errors.clone()
    }

    /// Concatenated payload of every delivered data frame.
    pub fn payload(&self) -> Vec<u8> {
        self.observed
            .lock()
            .frames
            .iter()
            .flat_map(|f| f.payload.iter().copied())
            .collect()
    }
}

impl ClientEndpoint for RecordingEndpoint {
    fn create_session(
        &self,
        subprotocol: Option<&str>,
        extensions: &[ExtensionDescriptor],
    ) -> WsResult<Box<dyn SessionHandler>> {
        if self.fail_sessions {
            return Err(WsError::internal("session refused"));
        }
        self.observed.lock().sessions.push((
            subprotocol.map(ToString::to_string),
            extensions.iter().map(|e| e.name().to_string()).collect(),
        ));
        Ok(Box::new(RecordingSession {
            observed: Arc::clone(&self.observed),
        }))
    }

    fn on_open(&self, connection_id: ConnectionId) {
        self.observed.lock().opened.push(connection_id);
    }

    fn on_error(&self, error: &WsError) {
        self.observed.lock().errors.push(error.to_string());
    }
}

struct RecordingSession {
    observed: Arc<Mutex<Observed>>,
}

impl SessionHandler for RecordingSession {
    fn on_connect(&mut self, _ctx: &mut SessionContext) {
        self.observed.lock().connected += 1;
    }

    fn on_frame(&mut self, _ctx: &mut SessionContext, frame: &Frame) {
        self.observed.lock().frames.push(frame.clone());
    }

    fn on_close(&mut self, reason: &CloseReason) {
        self.observed.lock().closes.push(reason.clone());
    }
}

/// A `101` response accepting `request`.
pub fn accept(request: &UpgradeRequest) -> UpgradeResponse {
    UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS)
        .with_header(header::UPGRADE, HeaderValue::from_static("websocket"))
        .with_header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
        .with_header(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&compute_accept_key(request.key())).unwrap(),
        )
}

/// A `401` response with a Basic challenge.
pub fn unauthorized() -> UpgradeResponse {
    UpgradeResponse::new(StatusCode::UNAUTHORIZED).with_header(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=test"),
    )
}

/// A `301` response pointing at `location`.
pub fn moved(location: &'static str) -> UpgradeResponse {
    UpgradeResponse::new(StatusCode::MOVED_PERMANENTLY)
        .with_header(header::LOCATION, HeaderValue::from_static(location))
}

/// Encode a server frame (unmasked).
pub fn server_frame(frame: &Frame) -> Bytes {
    frame.to_bytes()
}
