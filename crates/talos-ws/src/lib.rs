//! Client-side WebSocket protocol engine.
//!
//! This crate drives the HTTP upgrade handshake (including one
//! authentication retry and one redirect retry), reassembles inbound byte
//! chunks into frames and runs every frame through the negotiated extension
//! chain before handing it to the application's session.
//!
//! It performs no I/O: the transport sends the bytes of each
//! [`UpgradeRequest`], hands the parsed [`UpgradeResponse`] back, and then
//! feeds raw reads into the [`Connection`] while frames are written through
//! the [`Writer`] it supplied.
//!
//! # Example
//!
//! ```rust,ignore
//! use talos_ws::{ClientEngine, UpgradeInfo};
//!
//! let mut engine = ClientEngine::builder("ws://localhost:8025/echo", endpoint).build()?;
//! let mut request = engine.create_upgrade_request(None)?;
//! loop {
//!     let response = transport.exchange(request.to_http_bytes())?;
//!     match engine.process_response(&response, transport.writer(), None)? {
//!         Some(UpgradeInfo::AnotherUpgradeRequestRequired(_)) => {
//!             request = engine.create_upgrade_request(None)?;
//!         }
//!         Some(mut info @ UpgradeInfo::Success(_)) => {
//!             let mut connection = info.create_connection()?;
//!             while let Some(chunk) = transport.read()? {
//!                 connection.handle_read(&chunk);
//!             }
//!             break;
//!         }
//!         _ => break,
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  ClientEngine ── create_upgrade_request / process_response    │
//! │       │                                                       │
//! │       ▼ Success                                               │
//! │  ConnectionFactory ──► Connection                             │
//! │                          ├── ReadHandler (ReassemblyBuffer)   │
//! │                          │        │ unframe                   │
//! │                          │        ▼                           │
//! │                          │   ExtensionPipeline (incoming)     │
//! │                          │        ▼                           │
//! │                          │   SessionHandler                   │
//! │                          └── ConnectionSender                 │
//! │                                   │ ExtensionPipeline (out)   │
//! │                                   ▼                           │
//! │                                 Writer                        │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod reassembly;
pub mod session;

// Re-exports for convenience
pub use auth::{AuthHeaderGenerator, Authenticator, BasicAuthHeaderGenerator, Credentials};
pub use config::{ClientEndpointConfig, Configurator};
pub use connection::{
    CloseListener, Connection, ConnectionFactory, ConnectionId, ConnectionSender, Writer,
};
pub use engine::{ClientEngine, ClientEngineBuilder, TimeoutHandler, UpgradeInfo, UpgradeStatus};
pub use error::{CloseCode, CloseReason, WsError, WsResult};
pub use extension::{
    ExtendedExtension, Extension, ExtensionContext, ExtensionDescriptor, ExtensionParameter,
    ExtensionPipeline,
};
pub use frame::{Frame, Opcode};
pub use handshake::{UpgradeRequest, UpgradeResponse};
pub use protocol::{ProtocolHandler, Version};
pub use reassembly::{ReadHandler, ReassemblyBuffer, DEFAULT_INCOMING_BUFFER_SIZE};
pub use session::{ClientEndpoint, SessionContext, SessionHandler};
