//! Inbound byte reassembly.
//!
//! The transport hands arbitrary chunks of the inbound stream to a
//! [`ReadHandler`]. Chunks are accumulated in a [`ReassemblyBuffer`] bounded
//! by the connection's maximum buffer size, and complete frames are peeled
//! off the front as soon as they are available.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::CloseNotification;
use crate::error::{WsError, WsResult};
use crate::protocol::ProtocolHandler;

/// Default maximum buffer size: 4 MiB of payload plus 11 bytes of framing.
pub const DEFAULT_INCOMING_BUFFER_SIZE: usize = 4_194_315;

/// Minimum growth increment of the buffer.
pub const BUFFER_STEP_SIZE: usize = 256;

/// Growable byte buffer with a hard upper bound.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    buf: Option<BytesMut>,
    allocated: usize,
    max: usize,
    step: usize,
}

impl ReassemblyBuffer {
    /// Create an empty buffer that may grow to `max` bytes.
    pub fn new(max: usize) -> Self {
        Self::with_step(max, BUFFER_STEP_SIZE)
    }

    /// Create an empty buffer with a custom growth step.
    pub fn with_step(max: usize, step: usize) -> Self {
        Self {
            buf: None,
            allocated: 0,
            max,
            step: step.max(1),
        }
    }

    /// Append a chunk.
    ///
    /// # Errors
    ///
    /// Returns `WsError::BufferOverflow` if the buffered data would exceed
    /// the maximum. The buffer is left unchanged in that case.
    pub fn push(&mut self, chunk: &[u8]) -> WsResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        match self.buf.as_mut() {
            None => {
                if chunk.len() > self.max {
                    return Err(WsError::buffer_overflow(chunk.len(), self.max));
                }
                self.allocated = round_up(chunk.len(), self.step).min(self.max);
                let mut buf = BytesMut::with_capacity(self.allocated);
                buf.extend_from_slice(chunk);
                self.buf = Some(buf);
            }
            Some(buf) => {
                let required = buf.len() + chunk.len();
                if required > self.max {
                    return Err(WsError::buffer_overflow(required, self.max));
                }
                if required > self.allocated {
                    self.allocated = round_up(required, self.step).min(self.max);
                    buf.reserve(self.allocated - buf.len());
                }
                buf.extend_from_slice(chunk);
            }
        }

        Ok(())
    }

    /// The buffered bytes, if any are retained.
    pub fn bytes_mut(&mut self) -> Option<&mut BytesMut> {
        self.buf.as_mut()
    }

    /// Drop the buffer once everything in it has been consumed.
    pub fn compact(&mut self) {
        if self.buf.as_ref().is_some_and(BytesMut::is_empty) {
            self.release();
        }
    }

    /// Drop any retained bytes.
    pub fn release(&mut self) {
        self.buf = None;
        self.allocated = 0;
    }

    /// Number of retained bytes.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, BytesMut::len)
    }

    /// Whether no bytes are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a buffer is currently allocated.
    pub fn is_allocated(&self) -> bool {
        self.buf.is_some()
    }

    /// Current logical capacity.
    pub fn capacity(&self) -> usize {
        self.allocated
    }

    /// Maximum capacity.
    pub fn max(&self) -> usize {
        self.max
    }
}

fn round_up(len: usize, step: usize) -> usize {
    len.div_ceil(step).saturating_mul(step)
}

/// Feeds inbound chunks of one connection through the protocol handler.
///
/// Errors never escape [`handle`](Self::handle); they close the connection
/// instead.
#[derive(Debug)]
pub struct ReadHandler {
    handler: Arc<Mutex<ProtocolHandler>>,
    buffer: ReassemblyBuffer,
}

impl ReadHandler {
    /// Create a read handler bounded by `max_buffer_size`.
    pub fn new(handler: Arc<Mutex<ProtocolHandler>>, max_buffer_size: usize) -> Self {
        Self {
            handler,
            buffer: ReassemblyBuffer::new(max_buffer_size),
        }
    }

    /// The reassembly buffer.
    pub fn buffer(&self) -> &ReassemblyBuffer {
        &self.buffer
    }

    /// Process a chunk read from the transport.
    ///
    /// A close listener triggered by this chunk runs after the handler lock
    /// is released.
    pub fn handle(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        if let Some(notification) = self.handle_locked(chunk) {
            notification.fire();
        }
    }

    fn handle_locked(&mut self, chunk: &[u8]) -> Option<CloseNotification> {
        let handler = Arc::clone(&self.handler);
        let mut handler = handler.lock();

        if handler.is_closed() {
            debug!(connection_id = %handler.connection_id(), len = chunk.len(), "Dropping data received after close");
            self.buffer.release();
            return None;
        }

        if let Err(err) = self.process(&mut handler, chunk) {
            warn!(connection_id = %handler.connection_id(), error = %err, "Closing connection after read failure");
            handler.close(err.close_reason());
        }

        if handler.is_closed() {
            self.buffer.release();
        }
        handler.take_close_notification()
    }

    fn process(&mut self, handler: &mut ProtocolHandler, chunk: &[u8]) -> WsResult<()> {
        self.buffer.push(chunk)?;

        while let Some(buf) = self.buffer.bytes_mut() {
            let Some(frame) = handler.unframe(buf)? else {
                break;
            };
            let frame = handler.apply_incoming(frame);
            handler.process(frame)?;
            if handler.is_closed() {
                return Ok(());
            }
        }

        self.buffer.compact();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_allocation_rounds_to_step() {
        let mut buffer = ReassemblyBuffer::new(4096);
        buffer.push(&[0; 10]).unwrap();
        assert_eq!(buffer.capacity(), 256);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_allocation_capped_at_max() {
        let mut buffer = ReassemblyBuffer::new(300);
        buffer.push(&[0; 290]).unwrap();
        assert_eq!(buffer.capacity(), 300);
    }

    #[test]
    fn test_growth() {
        let mut buffer = ReassemblyBuffer::new(4096);
        buffer.push(&[0; 200]).unwrap();
        buffer.push(&[0; 100]).unwrap();
        assert_eq!(buffer.capacity(), 512);
        assert_eq!(buffer.len(), 300);
    }

    #[test]
    fn test_first_chunk_overflow() {
        let mut buffer = ReassemblyBuffer::new(100);
        let err = buffer.push(&[0; 101]).unwrap_err();
        assert!(matches!(err, WsError::BufferOverflow { size: 101, max: 100 }));
        assert!(!buffer.is_allocated());
    }

    #[test]
    fn test_accumulated_overflow() {
        let mut buffer = ReassemblyBuffer::new(100);
        buffer.push(&[0; 60]).unwrap();
        let err = buffer.push(&[0; 41]).unwrap_err();
        assert_eq!(err.to_string(), "Buffer overflow.");
        assert_eq!(buffer.len(), 60);
    }

    #[test]
    fn test_exact_max_fits() {
        let mut buffer = ReassemblyBuffer::new(100);
        buffer.push(&[0; 40]).unwrap();
        buffer.push(&[0; 60]).unwrap();
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 100);
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut buffer = ReassemblyBuffer::new(100);
        buffer.push(&[]).unwrap();
        assert!(!buffer.is_allocated());
    }

    #[test]
    fn test_compact_releases_drained_buffer() {
        let mut buffer = ReassemblyBuffer::new(100);
        buffer.push(&[1, 2, 3]).unwrap();
        let _ = buffer.bytes_mut().unwrap().split_to(2);
        buffer.compact();
        assert!(buffer.is_allocated());

        let _ = buffer.bytes_mut().unwrap().split_to(1);
        buffer.compact();
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.capacity(), 0);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 256), 256);
        assert_eq!(round_up(256, 256), 256);
        assert_eq!(round_up(257, 256), 512);
    }
}
