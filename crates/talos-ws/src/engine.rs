//! Client engine.
//!
//! [`ClientEngine`] drives the upgrade handshake in two phases: the transport
//! asks for an [`UpgradeRequest`], sends it, and hands the server's answer to
//! [`ClientEngine::process_response`]. The engine decides whether another
//! request is needed (authentication or redirect), whether the attempt
//! failed, or whether a connection can be created.
//!
//! ```text
//! New ──► AwaitingResponse ──► AuthRetry ─────┐
//!               ▲         ├──► RedirectRetry ─┤
//!               │         ├──► Failed         │
//!               │         └──► Open           │
//!               └── create_upgrade_request ◄──┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{self, HeaderValue};
use talos_config::ClientConfig;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::{Authenticator, Credentials};
use crate::config::ClientEndpointConfig;
use crate::connection::{CloseListener, Connection, ConnectionFactory, Writer};
use crate::error::{WsError, WsResult};
use crate::extension::{self, ExtensionContext, ExtensionDescriptor, ExtensionPipeline};
use crate::handshake::{self, Handshake, UpgradeRequest, UpgradeResponse};
use crate::protocol::{ProtocolHandler, Version};
use crate::reassembly::DEFAULT_INCOMING_BUFFER_SIZE;
use crate::session::ClientEndpoint;

/// Callback the container invokes when the handshake times out.
pub type TimeoutHandler = Arc<dyn Fn() + Send + Sync>;

/// Kind of outcome of [`ClientEngine::process_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStatus {
    /// Send the attached request and process its response.
    AnotherUpgradeRequestRequired,
    /// The handshake failed; the endpoint was notified.
    UpgradeRequestFailed,
    /// The handshake succeeded.
    Success,
}

/// Outcome of processing an upgrade response.
#[derive(Debug)]
pub enum UpgradeInfo {
    /// Another request must be sent (authentication or redirect retry).
    AnotherUpgradeRequestRequired(UpgradeRequest),
    /// The handshake failed.
    UpgradeRequestFailed,
    /// The handshake succeeded.
    Success(ConnectionFactory),
}

impl UpgradeInfo {
    /// Kind of this outcome.
    pub fn status(&self) -> UpgradeStatus {
        match self {
            Self::AnotherUpgradeRequestRequired(_) => UpgradeStatus::AnotherUpgradeRequestRequired,
            Self::UpgradeRequestFailed => UpgradeStatus::UpgradeRequestFailed,
            Self::Success(_) => UpgradeStatus::Success,
        }
    }

    /// The retry request, if another one is required.
    pub fn upgrade_request(&self) -> Option<&UpgradeRequest> {
        match self {
            Self::AnotherUpgradeRequestRequired(request) => Some(request),
            _ => None,
        }
    }

    /// Create the connection of a successful handshake.
    ///
    /// # Errors
    ///
    /// Returns `WsError::IllegalState` unless the outcome is `Success`, or
    /// when the connection was already created.
    pub fn create_connection(&mut self) -> WsResult<Connection> {
        match self {
            Self::Success(factory) => factory.create_connection(),
            other => Err(WsError::illegal_state(format!(
                "cannot create a connection from {:?}",
                other.status()
            ))),
        }
    }
}

enum State {
    New,
    AwaitingResponse(Handshake),
    AuthRetry(Handshake),
    RedirectRetry(Handshake),
    Failed,
    Open,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::AwaitingResponse(_) => "awaiting_response",
            Self::AuthRetry(_) => "auth_retry",
            Self::RedirectRetry(_) => "redirect_retry",
            Self::Failed => "failed",
            Self::Open => "open",
        }
    }
}

/// Builder for [`ClientEngine`].
pub struct ClientEngineBuilder {
    uri: String,
    endpoint: Arc<dyn ClientEndpoint>,
    endpoint_config: ClientEndpointConfig,
    client_config: ClientConfig,
    credentials: Option<Credentials>,
    authenticator: Authenticator,
    version: Version,
}

impl ClientEngineBuilder {
    /// Set the endpoint configuration.
    pub fn endpoint_config(mut self, config: ClientEndpointConfig) -> Self {
        self.endpoint_config = config;
        self
    }

    /// Set the client configuration.
    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Credentials answering `401` challenges. Takes precedence over
    /// credentials in the client configuration.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replace the authenticator.
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Protocol version to request.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns `WsError::InvalidUri` unless the URI parses with a `ws` or
    /// `wss` scheme and a host, and `WsError::AuthenticationFailed` for
    /// invalid configured credentials.
    pub fn build(self) -> WsResult<ClientEngine> {
        let uri = Url::parse(&self.uri)
            .map_err(|e| WsError::invalid_uri(format!("{}: {e}", self.uri)))?;
        check_target(&uri)?;

        let credentials = match (self.credentials, &self.client_config.credentials) {
            (Some(credentials), _) => Some(credentials),
            (None, Some(config)) => Some(Credentials::try_from(config)?),
            (None, None) => None,
        };

        Ok(ClientEngine {
            uri,
            endpoint: self.endpoint,
            endpoint_config: self.endpoint_config,
            client_config: self.client_config,
            credentials,
            authenticator: self.authenticator,
            version: self.version,
            state: State::New,
            auth_retried: false,
            redirect_retried: false,
            timeout_handler: None,
        })
    }
}

/// Client side of the WebSocket opening handshake.
pub struct ClientEngine {
    uri: Url,
    endpoint: Arc<dyn ClientEndpoint>,
    endpoint_config: ClientEndpointConfig,
    client_config: ClientConfig,
    credentials: Option<Credentials>,
    authenticator: Authenticator,
    version: Version,
    state: State,
    auth_retried: bool,
    redirect_retried: bool,
    timeout_handler: Option<TimeoutHandler>,
}

impl ClientEngine {
    /// Start building an engine connecting `endpoint` to `uri`.
    pub fn builder(uri: impl Into<String>, endpoint: Arc<dyn ClientEndpoint>) -> ClientEngineBuilder {
        ClientEngineBuilder {
            uri: uri.into(),
            endpoint,
            endpoint_config: ClientEndpointConfig::default(),
            client_config: ClientConfig::default(),
            credentials: None,
            authenticator: Authenticator::default(),
            version: Version::default(),
        }
    }

    /// The original target URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Protocol version requested.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The timeout handler registered with the last request.
    pub fn timeout_handler(&self) -> Option<&TimeoutHandler> {
        self.timeout_handler.as_ref()
    }

    /// How long the container should wait for a response.
    pub fn handshake_timeout(&self) -> Duration {
        self.client_config.handshake_timeout()
    }

    /// Whether the handshake completed successfully.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open)
    }

    /// Whether the handshake failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// Create the next upgrade request.
    ///
    /// The first call builds a request for the target URI; after an
    /// `AnotherUpgradeRequestRequired` outcome it returns the prepared retry
    /// request.
    ///
    /// # Errors
    ///
    /// Returns `WsError::IllegalState` while a request is outstanding or once
    /// the handshake has finished.
    #[instrument(skip(self, timeout_handler), fields(uri = %self.uri, state = self.state.name()))]
    pub fn create_upgrade_request(
        &mut self,
        timeout_handler: Option<TimeoutHandler>,
    ) -> WsResult<UpgradeRequest> {
        let handshake = match std::mem::replace(&mut self.state, State::Failed) {
            State::New => match self.prepare(self.uri.clone(), None) {
                Ok(handshake) => handshake,
                Err(err) => {
                    self.state = State::New;
                    return Err(err);
                }
            },
            State::AuthRetry(handshake) | State::RedirectRetry(handshake) => handshake,
            other => {
                let err = WsError::illegal_state(format!(
                    "cannot create an upgrade request in state {}",
                    other.name()
                ));
                self.state = other;
                return Err(err);
            }
        };

        if timeout_handler.is_some() {
            self.timeout_handler = timeout_handler;
        }

        let request = handshake.request().clone();
        info!(target_uri = %request.uri(), "Upgrade request created");
        self.state = State::AwaitingResponse(handshake);
        Ok(request)
    }

    /// Process the server's response to the outstanding request.
    ///
    /// Returns `Ok(None)` when the handshake itself succeeded but the
    /// connection could not be set up; the endpoint has been notified.
    ///
    /// # Errors
    ///
    /// Returns `WsError::IllegalState` when no request is outstanding.
    #[instrument(
        skip(self, response, writer, close_listener),
        fields(uri = %self.uri, status = response.status().as_u16())
    )]
    pub fn process_response(
        &mut self,
        response: &UpgradeResponse,
        writer: Box<dyn Writer>,
        close_listener: Option<Box<dyn CloseListener>>,
    ) -> WsResult<Option<UpgradeInfo>> {
        let handshake = match std::mem::replace(&mut self.state, State::Failed) {
            State::AwaitingResponse(handshake) => handshake,
            other => {
                let err = WsError::illegal_state(format!(
                    "no upgrade request outstanding in state {}",
                    other.name()
                ));
                self.state = other;
                return Err(err);
            }
        };

        let status = response.status();
        if status == http::StatusCode::UNAUTHORIZED {
            return Ok(Some(self.handle_auth(&handshake, response)));
        }
        if status.is_redirection() {
            return Ok(Some(self.handle_redirect(&handshake, response)));
        }

        if let Err(err) = handshake.validate(response) {
            return Ok(Some(self.fail(&err)));
        }

        match self.open(response, writer, close_listener) {
            Ok(factory) => {
                info!(connection_id = %factory.id(), "Handshake completed");
                self.state = State::Open;
                Ok(Some(UpgradeInfo::Success(factory)))
            }
            Err(err) => {
                self.report_failure(&err);
                Ok(None)
            }
        }
    }

    /// The container's handshake timer fired: fail the outstanding attempt
    /// and run the registered timeout handler.
    pub fn handle_timeout(&mut self) {
        if !matches!(self.state, State::AwaitingResponse(_)) {
            return;
        }
        self.report_failure(&WsError::handshake_failed(format!(
            "no response within {:?}",
            self.handshake_timeout()
        )));
        if let Some(handler) = &self.timeout_handler {
            handler();
        }
    }

    fn handle_auth(&mut self, handshake: &Handshake, response: &UpgradeResponse) -> UpgradeInfo {
        if self.auth_retried {
            return self.fail(&WsError::authentication_failed(
                "server rejected the supplied credentials",
            ));
        }
        let Some(credentials) = &self.credentials else {
            return self.fail(&WsError::authentication_failed(
                "authentication required but no credentials are configured",
            ));
        };

        let challenges = response.header_values(&header::WWW_AUTHENTICATE);
        let authorization = match self
            .authenticator
            .authorization_header(&challenges, credentials)
        {
            Ok(authorization) => authorization,
            Err(err) => return self.fail(&err),
        };

        let uri = handshake.request().uri().clone();
        match self.prepare(uri, Some(&authorization)) {
            Ok(next) => {
                self.auth_retried = true;
                info!("Retrying upgrade with credentials");
                let request = next.request().clone();
                self.state = State::AuthRetry(next);
                UpgradeInfo::AnotherUpgradeRequestRequired(request)
            }
            Err(err) => self.fail(&err),
        }
    }

    fn handle_redirect(&mut self, handshake: &Handshake, response: &UpgradeResponse) -> UpgradeInfo {
        if !self.client_config.redirect_enabled {
            return self.fail(&WsError::handshake_failed(format!(
                "received redirect {} but redirects are disabled",
                response.status()
            )));
        }
        if self.redirect_retried {
            return self.fail(&WsError::handshake_failed("too many redirects"));
        }
        let Some(location) = response.header(&header::LOCATION) else {
            return self.fail(&WsError::handshake_failed(
                "redirect response carries no Location header",
            ));
        };

        let target = match resolve_location(handshake.request().uri(), location) {
            Ok(target) => target,
            Err(err) => return self.fail(&err),
        };

        match self.prepare(target, None) {
            Ok(next) => {
                self.redirect_retried = true;
                info!(location = %next.request().uri(), "Following redirect");
                let request = next.request().clone();
                self.state = State::RedirectRetry(next);
                UpgradeInfo::AnotherUpgradeRequestRequired(request)
            }
            Err(err) => self.fail(&err),
        }
    }

    fn fail(&mut self, err: &WsError) -> UpgradeInfo {
        self.report_failure(err);
        UpgradeInfo::UpgradeRequestFailed
    }

    fn report_failure(&mut self, err: &WsError) {
        warn!(error = %err, "Upgrade request failed");
        self.endpoint.on_error(err);
        self.state = State::Failed;
    }

    fn prepare(&self, uri: Url, authorization: Option<&str>) -> WsResult<Handshake> {
        let descriptors: Vec<ExtensionDescriptor> = self
            .endpoint_config
            .extensions
            .iter()
            .map(|e| e.descriptor().clone())
            .collect();
        let mut handshake = Handshake::client(
            uri,
            &self.endpoint_config.subprotocols,
            &descriptors,
            self.version,
        )?;

        if let Some(authorization) = authorization {
            let value = HeaderValue::from_str(authorization).map_err(|_| {
                WsError::authentication_failed("authorization header is not valid ASCII")
            })?;
            handshake
                .headers_mut()
                .insert(header::AUTHORIZATION, value);
        }
        if let Some(configurator) = &self.endpoint_config.configurator {
            configurator.before_request(handshake.headers_mut());
        }

        Ok(handshake)
    }

    fn open(
        &self,
        response: &UpgradeResponse,
        writer: Box<dyn Writer>,
        close_listener: Option<Box<dyn CloseListener>>,
    ) -> WsResult<ConnectionFactory> {
        let answered = handshake::response_extensions(response)?;
        let mut context = ExtensionContext::new();
        let negotiated =
            extension::negotiate(&self.endpoint_config.extensions, &answered, &mut context);
        let subprotocol = handshake::negotiated_subprotocol(response);
        let descriptors: Vec<ExtensionDescriptor> =
            negotiated.iter().map(|e| e.descriptor().clone()).collect();
        debug!(?subprotocol, extensions = ?descriptors, "Negotiated connection parameters");

        let session = match self
            .endpoint
            .create_session(subprotocol.as_deref(), &descriptors)
        {
            Ok(session) => session,
            Err(err) => {
                ExtensionPipeline::new(negotiated).destroy(&mut context);
                return Err(err);
            }
        };

        if let Some(configurator) = &self.endpoint_config.configurator {
            configurator.after_response(response);
        }

        let mut handler = ProtocolHandler::new(self.version);
        handler.set_writer(writer);
        handler.set_session(session);
        handler.set_extensions(negotiated);
        handler.set_extension_context(context);
        if let Some(listener) = close_listener {
            handler.set_close_listener(listener);
        }
        let connection_id = handler.connection_id();

        let connected = handler.connect();
        if let Err(err) = &connected {
            handler.close(err.close_reason());
        }
        if let Some(notification) = handler.take_close_notification() {
            notification.fire();
        }
        connected?;
        self.endpoint.on_open(connection_id);

        Ok(ConnectionFactory::new(
            handler,
            self.incoming_buffer_size(),
            subprotocol,
            descriptors,
        ))
    }

    fn incoming_buffer_size(&self) -> usize {
        self.client_config
            .incoming_buffer_size
            .or(self.endpoint_config.container_incoming_buffer_size)
            .unwrap_or(DEFAULT_INCOMING_BUFFER_SIZE)
    }
}

impl fmt::Debug for ClientEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEngine")
            .field("uri", &self.uri.as_str())
            .field("version", &self.version)
            .field("state", &self.state.name())
            .field("auth_retried", &self.auth_retried)
            .field("redirect_retried", &self.redirect_retried)
            .finish_non_exhaustive()
    }
}

fn check_target(uri: &Url) -> WsResult<()> {
    if !matches!(uri.scheme(), "ws" | "wss") {
        return Err(WsError::invalid_uri(format!(
            "unsupported scheme {:?} in {uri}",
            uri.scheme()
        )));
    }
    if uri.host_str().is_none() {
        return Err(WsError::invalid_uri(format!("{uri} has no host")));
    }
    Ok(())
}

/// Resolve a `Location` header against the current target, mapping
/// `http`/`https` onto `ws`/`wss`.
fn resolve_location(base: &Url, location: &str) -> WsResult<Url> {
    let mut target = base
        .join(location.trim())
        .map_err(|e| WsError::invalid_uri(format!("invalid redirect location {location:?}: {e}")))?;

    let scheme = match target.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(WsError::invalid_uri(format!(
                "unsupported redirect scheme {other:?}"
            )))
        }
    };
    if target.scheme() != scheme && target.set_scheme(scheme).is_err() {
        return Err(WsError::invalid_uri(format!(
            "cannot use redirect location {location:?} as a WebSocket URI"
        )));
    }

    check_target(&target)?;
    Ok(target)
}
