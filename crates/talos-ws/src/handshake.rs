//! Client side of the HTTP upgrade handshake (RFC 6455 §4.1).
//!
//! This module builds [`UpgradeRequest`]s and validates the server's
//! [`UpgradeResponse`]. Retry decisions (authentication, redirects) live in
//! the [`engine`](crate::engine).

use std::fmt::Write as _;

use base64::Engine;
use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, StatusCode};
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::{WsError, WsResult};
use crate::extension::{parse_extensions_header, render_extensions_header, ExtensionDescriptor};
use crate::protocol::Version;

/// The WebSocket magic GUID used in the handshake.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value for a key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(result)
}

/// Generate a `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

fn header_value(value: &str) -> WsResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| WsError::handshake_failed(format!("invalid header value: {value:?}")))
}

fn header_values<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Vec<&'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect()
}

/// An HTTP upgrade request produced by the engine.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    uri: Url,
    headers: HeaderMap,
    key: String,
}

impl UpgradeRequest {
    /// Target URI.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The `Sec-WebSocket-Key` of this attempt.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// First value of a header, if it is visible ASCII.
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the target uses TLS (`wss`).
    pub fn is_secure(&self) -> bool {
        self.uri.scheme() == "wss"
    }

    /// Request target: path plus query.
    pub fn request_target(&self) -> String {
        match self.uri.query() {
            Some(query) => format!("{}?{}", self.uri.path(), query),
            None => self.uri.path().to_string(),
        }
    }

    /// Render the request as HTTP/1.1 bytes.
    pub fn to_http_bytes(&self) -> Bytes {
        let mut out = format!("GET {} HTTP/1.1\r\n", self.request_target());
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: ", name.as_str());
            out.push_str(&String::from_utf8_lossy(value.as_bytes()));
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        Bytes::from(out)
    }
}

/// The server's answer to an [`UpgradeRequest`].
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    status: StatusCode,
    headers: HeaderMap,
}

impl UpgradeResponse {
    /// Create a response with no headers.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// First value of a header, if it is visible ASCII.
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header, in order.
    pub fn header_values(&self, name: &HeaderName) -> Vec<&str> {
        header_values(&self.headers, name)
    }
}

impl<B> From<http::Response<B>> for UpgradeResponse {
    fn from(response: http::Response<B>) -> Self {
        let (parts, _) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
        }
    }
}

/// One handshake attempt: the request sent and what it offered.
#[derive(Debug, Clone)]
pub struct Handshake {
    request: UpgradeRequest,
}

impl Handshake {
    /// Build the upgrade request for `uri`.
    ///
    /// # Errors
    ///
    /// Returns `WsError::InvalidUri` if the URI has no host, and
    /// `WsError::HandshakeFailed` if an offered value is not a valid header.
    pub fn client(
        uri: Url,
        subprotocols: &[String],
        extensions: &[ExtensionDescriptor],
        version: Version,
    ) -> WsResult<Self> {
        let host = uri
            .host_str()
            .ok_or_else(|| WsError::invalid_uri(format!("{uri} has no host")))?;
        let host = match uri.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let key = generate_key();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, header_value(&host)?);
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_KEY, header_value(&key)?);
        headers.insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(version.as_str()),
        );
        if !subprotocols.is_empty() {
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                header_value(&subprotocols.join(", "))?,
            );
        }
        if !extensions.is_empty() {
            headers.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                header_value(&render_extensions_header(extensions))?,
            );
        }

        Ok(Self {
            request: UpgradeRequest { uri, headers, key },
        })
    }

    /// The request of this attempt.
    pub fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    /// Mutable request headers, for hooks that run before sending.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.request.headers
    }

    /// Validate a response to this attempt.
    ///
    /// # Errors
    ///
    /// Returns `WsError::HandshakeFailed` describing the first mismatch.
    pub fn validate(&self, response: &UpgradeResponse) -> WsResult<()> {
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(WsError::handshake_failed(format!(
                "unexpected response status {}",
                response.status()
            )));
        }

        let upgrade = response.header(&header::UPGRADE);
        if !upgrade.is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket")) {
            return Err(WsError::handshake_failed(format!(
                "invalid Upgrade header: {upgrade:?}"
            )));
        }

        let has_upgrade_token = response
            .header_values(&header::CONNECTION)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        if !has_upgrade_token {
            return Err(WsError::handshake_failed(
                "Connection header does not contain the Upgrade token",
            ));
        }

        let expected = compute_accept_key(&self.request.key);
        match response.header(&header::SEC_WEBSOCKET_ACCEPT) {
            Some(accept) if accept.trim() == expected => Ok(()),
            Some(accept) => Err(WsError::handshake_failed(format!(
                "invalid Sec-WebSocket-Accept {accept:?}, expected {expected:?}"
            ))),
            None => Err(WsError::handshake_failed(
                "missing Sec-WebSocket-Accept header",
            )),
        }
    }
}

/// The subprotocol the server selected: the first `Sec-WebSocket-Protocol` value.
pub fn negotiated_subprotocol(response: &UpgradeResponse) -> Option<String> {
    response
        .header(&header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// The extensions the server answered with.
///
/// # Errors
///
/// Returns `WsError::HandshakeFailed` for a malformed header.
pub fn response_extensions(response: &UpgradeResponse) -> WsResult<Vec<ExtensionDescriptor>> {
    parse_extensions_header(response.header_values(&header::SEC_WEBSOCKET_EXTENSIONS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn accepting(handshake: &Handshake) -> UpgradeResponse {
        UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
            .with_header(
                header::SEC_WEBSOCKET_ACCEPT,
                HeaderValue::from_str(&compute_accept_key(handshake.request().key())).unwrap(),
            )
    }

    #[test]
    fn test_compute_accept_key() {
        // Example from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = compute_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_generate_key() {
        let key = generate_key();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_request_headers() {
        let handshake = Handshake::client(
            uri("ws://localhost:8025/echo?x=1"),
            &["chat".to_string(), "superchat".to_string()],
            &[ExtensionDescriptor::new("foo").with_parameter("a", Some("1"))],
            Version::Rfc6455,
        )
        .unwrap();
        let request = handshake.request();

        assert_eq!(request.header(&header::HOST), Some("localhost:8025"));
        assert_eq!(request.header(&header::UPGRADE), Some("websocket"));
        assert_eq!(request.header(&header::CONNECTION), Some("Upgrade"));
        assert_eq!(request.header(&header::SEC_WEBSOCKET_VERSION), Some("13"));
        assert_eq!(
            request.header(&header::SEC_WEBSOCKET_PROTOCOL),
            Some("chat, superchat")
        );
        assert_eq!(
            request.header(&header::SEC_WEBSOCKET_EXTENSIONS),
            Some("foo; a=1")
        );
        assert_eq!(request.request_target(), "/echo?x=1");
        assert!(!request.is_secure());
    }

    #[test]
    fn test_request_omits_empty_offers_and_default_port() {
        let handshake = Handshake::client(uri("wss://example.com/"), &[], &[], Version::Hybi08)
            .unwrap();
        let request = handshake.request();

        assert_eq!(request.header(&header::HOST), Some("example.com"));
        assert_eq!(request.header(&header::SEC_WEBSOCKET_VERSION), Some("8"));
        assert!(request.header(&header::SEC_WEBSOCKET_PROTOCOL).is_none());
        assert!(request.header(&header::SEC_WEBSOCKET_EXTENSIONS).is_none());
        assert!(request.is_secure());
    }

    #[test]
    fn test_to_http_bytes() {
        let handshake =
            Handshake::client(uri("ws://localhost/chat"), &[], &[], Version::Rfc6455).unwrap();
        let bytes = handshake.request().to_http_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(text.contains("host: localhost\r\n"));
        assert!(text.contains(&format!(
            "sec-websocket-key: {}\r\n",
            handshake.request().key()
        )));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_validate_success() {
        let handshake =
            Handshake::client(uri("ws://localhost/"), &[], &[], Version::Rfc6455).unwrap();
        assert!(handshake.validate(&accepting(&handshake)).is_ok());
    }

    #[test]
    fn test_validate_accepts_connection_token_list() {
        let handshake =
            Handshake::client(uri("ws://localhost/"), &[], &[], Version::Rfc6455).unwrap();
        let mut response = accepting(&handshake);
        response.headers_mut().insert(
            header::CONNECTION,
            HeaderValue::from_static("keep-alive, upgrade"),
        );
        response
            .headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(handshake.validate(&response).is_ok());
    }

    #[test]
    fn test_validate_failures() {
        let handshake =
            Handshake::client(uri("ws://localhost/"), &[], &[], Version::Rfc6455).unwrap();

        let wrong_status = UpgradeResponse {
            status: StatusCode::OK,
            ..accepting(&handshake)
        };
        assert!(handshake.validate(&wrong_status).is_err());

        let mut wrong_accept = accepting(&handshake);
        wrong_accept.headers_mut().insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_static("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        );
        assert!(handshake.validate(&wrong_accept).is_err());

        let mut no_upgrade = accepting(&handshake);
        no_upgrade.headers_mut().remove(header::UPGRADE);
        assert!(handshake.validate(&no_upgrade).is_err());

        let mut no_connection = accepting(&handshake);
        no_connection
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(handshake.validate(&no_connection).is_err());
    }

    #[test]
    fn test_negotiated_subprotocol() {
        let response = UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"))
            .with_header(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("other"));
        assert_eq!(negotiated_subprotocol(&response).as_deref(), Some("chat"));
        assert_eq!(
            negotiated_subprotocol(&UpgradeResponse::new(StatusCode::SWITCHING_PROTOCOLS)),
            None
        );
    }

    #[test]
    fn test_response_from_http() {
        let response = http::Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(header::WWW_AUTHENTICATE, "Basic realm=test")
            .body(())
            .unwrap();
        let response = UpgradeResponse::from(response);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.header_values(&header::WWW_AUTHENTICATE),
            ["Basic realm=test"]
        );
    }
}
