//! HTTP authentication for the upgrade handshake.
//!
//! When the server answers the upgrade request with `401`, the engine asks
//! the [`Authenticator`] for an `Authorization` header matching one of the
//! `WWW-Authenticate` challenges. Only the `Basic` scheme ships by default.

use std::fmt;

use base64::Engine;

use crate::error::{WsError, WsResult};

/// Username and password used to answer an authentication challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: Vec<u8>,
}

impl Credentials {
    /// Create credentials from a raw password.
    ///
    /// # Errors
    ///
    /// Returns `WsError::AuthenticationFailed` if the username is empty.
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> WsResult<Self> {
        let username = username.into();
        if username.is_empty() {
            return Err(WsError::authentication_failed("username must not be empty"));
        }
        Ok(Self {
            username,
            password: password.into(),
        })
    }

    /// Create credentials from a text password, encoded as ISO-8859-1.
    pub fn with_text_password(username: impl Into<String>, password: &str) -> WsResult<Self> {
        Self::new(username, encode_latin1(password))
    }

    /// Username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password bytes.
    pub fn password(&self) -> &[u8] {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl TryFrom<&talos_config::CredentialsConfig> for Credentials {
    type Error = WsError;

    fn try_from(config: &talos_config::CredentialsConfig) -> WsResult<Self> {
        Self::with_text_password(config.username.clone(), &config.password)
    }
}

/// Encode `s` as ISO-8859-1, replacing unmappable characters with `?`.
pub fn encode_latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Produces an `Authorization` header value for one authentication scheme.
pub trait AuthHeaderGenerator: Send + Sync {
    /// Scheme name, as it appears in `WWW-Authenticate`.
    fn scheme(&self) -> &'static str;

    /// Whether one of the server's challenges names this scheme.
    fn is_suitable(&self, challenges: &[&str]) -> bool {
        let scheme = self.scheme();
        challenges.iter().any(|challenge| {
            challenge
                .trim_start()
                .split(|c: char| c.is_ascii_whitespace() || c == ',')
                .next()
                .is_some_and(|token| token.eq_ignore_ascii_case(scheme))
        })
    }

    /// Build the header value.
    fn authorization_header(&self, credentials: &Credentials) -> WsResult<String>;
}

/// The `Basic` scheme (RFC 7617).
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAuthHeaderGenerator;

impl AuthHeaderGenerator for BasicAuthHeaderGenerator {
    fn scheme(&self) -> &'static str {
        "Basic"
    }

    fn authorization_header(&self, credentials: &Credentials) -> WsResult<String> {
        let mut token = encode_latin1(credentials.username());
        token.push(b':');
        token.extend_from_slice(credentials.password());
        Ok(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(token)
        ))
    }
}

/// Registry of header generators, consulted in registration order.
pub struct Authenticator {
    generators: Vec<Box<dyn AuthHeaderGenerator>>,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self {
            generators: vec![Box::new(BasicAuthHeaderGenerator)],
        }
    }
}

impl Authenticator {
    /// An authenticator supporting `Basic`.
    pub fn new() -> Self {
        Self::default()
    }

    /// An authenticator with no schemes registered.
    pub fn empty() -> Self {
        Self {
            generators: Vec::new(),
        }
    }

    /// Register an additional scheme.
    pub fn with_generator(mut self, generator: impl AuthHeaderGenerator + 'static) -> Self {
        self.generators.push(Box::new(generator));
        self
    }

    /// Registered scheme names.
    pub fn schemes(&self) -> Vec<&'static str> {
        self.generators.iter().map(|g| g.scheme()).collect()
    }

    /// Answer the first challenge a registered scheme supports.
    ///
    /// # Errors
    ///
    /// Returns `WsError::AuthenticationFailed` when there is no challenge or
    /// no registered scheme matches one.
    pub fn authorization_header(
        &self,
        challenges: &[&str],
        credentials: &Credentials,
    ) -> WsResult<String> {
        if challenges.is_empty() {
            return Err(WsError::authentication_failed(
                "401 response carries no WWW-Authenticate header",
            ));
        }

        self.generators
            .iter()
            .find(|g| g.is_suitable(challenges))
            .ok_or_else(|| {
                WsError::authentication_failed(format!(
                    "unsupported authentication scheme: {}",
                    challenges.join(", ")
                ))
            })?
            .authorization_header(credentials)
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("schemes", &self.schemes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header_value() {
        let credentials = Credentials::with_text_password("user1", "password").unwrap();
        let header = BasicAuthHeaderGenerator.authorization_header(&credentials).unwrap();
        assert_eq!(header, "Basic dXNlcjE6cGFzc3dvcmQ=");
    }

    #[test]
    fn test_latin1_encoding() {
        assert_eq!(encode_latin1("abc"), b"abc");
        assert_eq!(encode_latin1("é"), [0xE9]);
        assert_eq!(encode_latin1("€"), b"?");
    }

    #[test]
    fn test_empty_username_rejected() {
        assert!(matches!(
            Credentials::new("", "secret"),
            Err(WsError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let credentials = Credentials::new("user1", "hunter2").unwrap();
        let debug = format!("{credentials:?}");
        assert!(debug.contains("user1"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_basic_is_suitable() {
        let basic = BasicAuthHeaderGenerator;
        assert!(basic.is_suitable(&["Basic realm=test"]));
        assert!(basic.is_suitable(&["  basic realm=\"x\""]));
        assert!(basic.is_suitable(&["Digest realm=x", "BASIC"]));
        assert!(!basic.is_suitable(&["Digest realm=x"]));
        assert!(!basic.is_suitable(&["Bas"]));
        assert!(!basic.is_suitable(&["BasicSSO realm=x"]));
        assert!(basic.is_suitable(&["Basic, Digest realm=x"]));
    }

    #[test]
    fn test_authenticator_errors() {
        let authenticator = Authenticator::new();
        let credentials = Credentials::new("user1", "password").unwrap();

        assert!(authenticator.authorization_header(&[], &credentials).is_err());
        assert!(authenticator
            .authorization_header(&["Negotiate"], &credentials)
            .is_err());
        assert!(Authenticator::empty()
            .authorization_header(&["Basic realm=test"], &credentials)
            .is_err());
    }

    #[test]
    fn test_authenticator_custom_scheme() {
        struct Token;

        impl AuthHeaderGenerator for Token {
            fn scheme(&self) -> &'static str {
                "Bearer"
            }

            fn authorization_header(&self, credentials: &Credentials) -> WsResult<String> {
                Ok(format!("Bearer {}", credentials.username()))
            }
        }

        let authenticator = Authenticator::new().with_generator(Token);
        let credentials = Credentials::new("abc", "").unwrap();
        assert_eq!(authenticator.schemes(), ["Basic", "Bearer"]);
        assert_eq!(
            authenticator
                .authorization_header(&["Bearer realm=api"], &credentials)
                .unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_credentials_from_config() {
        let config = talos_config::CredentialsConfig {
            username: "user1".to_string(),
            password: "pässword".to_string(),
        };
        let credentials = Credentials::try_from(&config).unwrap();
        assert_eq!(credentials.password(), b"p\xE4ssword");
    }
}
