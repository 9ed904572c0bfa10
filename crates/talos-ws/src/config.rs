//! Endpoint configuration.
//!
//! [`ClientEndpointConfig`] carries what the application offers in the
//! handshake (subprotocols, extensions, header hooks) plus the buffer size
//! override a container may impose.

use std::fmt;
use std::sync::Arc;

use http::HeaderMap;
use talos_config::ClientConfig;

use crate::extension::{Extension, ExtensionDescriptor};
use crate::handshake::UpgradeResponse;

/// Hooks around the upgrade exchange.
pub trait Configurator: Send + Sync {
    /// Adjust the headers of every upgrade request before it is returned.
    fn before_request(&self, _headers: &mut HeaderMap) {}

    /// Inspect a successful upgrade response.
    fn after_response(&self, _response: &UpgradeResponse) {}
}

/// Configuration of a client endpoint.
#[derive(Clone, Default)]
pub struct ClientEndpointConfig {
    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in preference order.
    pub subprotocols: Vec<String>,
    /// Extensions offered in `Sec-WebSocket-Extensions`, in preference order.
    pub extensions: Vec<Extension>,
    /// Request/response hooks.
    pub configurator: Option<Arc<dyn Configurator>>,
    /// Container-imposed maximum inbound buffer size.
    pub container_incoming_buffer_size: Option<usize>,
}

impl ClientEndpointConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer the subprotocols and plain extensions named in `config`.
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            subprotocols: config.subprotocols.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| Extension::plain(ExtensionDescriptor::from(e)))
                .collect(),
            ..Self::default()
        }
    }

    /// Offer a subprotocol (appended in preference order).
    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocols.push(subprotocol.into());
        self
    }

    /// Replace the offered subprotocols.
    pub fn subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    /// Offer an extension (appended in preference order).
    pub fn extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Install request/response hooks.
    pub fn configurator(mut self, configurator: Arc<dyn Configurator>) -> Self {
        self.configurator = Some(configurator);
        self
    }

    /// Container-imposed maximum inbound buffer size.
    ///
    /// An explicit `ClientConfig::incoming_buffer_size` takes precedence.
    pub fn container_incoming_buffer_size(mut self, size: usize) -> Self {
        self.container_incoming_buffer_size = Some(size);
        self
    }
}

impl fmt::Debug for ClientEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEndpointConfig")
            .field("subprotocols", &self.subprotocols)
            .field("extensions", &self.extensions)
            .field("configurator", &self.configurator.is_some())
            .field(
                "container_incoming_buffer_size",
                &self.container_incoming_buffer_size,
            )
            .finish()
    }
}
