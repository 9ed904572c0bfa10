//! Extension descriptors, negotiation and the per-connection frame pipeline.
//!
//! Plain extensions are only names and parameters exchanged in the
//! `Sec-WebSocket-Extensions` header. Extended extensions additionally
//! implement [`ExtendedExtension`] and transform every frame of the
//! connection, keeping their state in the connection's [`ExtensionContext`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{WsError, WsResult};
use crate::frame::Frame;

/// A single `name[=value]` extension parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParameter {
    name: String,
    value: Option<String>,
}

impl ExtensionParameter {
    /// Create a parameter.
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter value, `None` for flags.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl fmt::Display for ExtensionParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            None => f.write_str(&self.name),
            Some(value) if is_token(value) => write!(f, "{}={}", self.name, value),
            Some(value) => {
                write!(f, "{}=\"", self.name)?;
                for c in value.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
        }
    }
}

/// Name plus ordered parameters of an extension.
///
/// Two descriptors denote the same extension iff their names are equal
/// (case-sensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    name: String,
    parameters: Vec<ExtensionParameter>,
}

impl ExtensionDescriptor {
    /// Create a descriptor without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.parameters
            .push(ExtensionParameter::new(name, value.map(ToString::to_string)));
        self
    }

    /// Extension name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters in header order.
    pub fn parameters(&self) -> &[ExtensionParameter] {
        &self.parameters
    }

    /// Whether `other` names the same extension.
    pub fn same_extension(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Display for ExtensionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for parameter in &self.parameters {
            write!(f, "; {parameter}")?;
        }
        Ok(())
    }
}

impl From<&talos_config::ExtensionConfig> for ExtensionDescriptor {
    fn from(config: &talos_config::ExtensionConfig) -> Self {
        Self {
            name: config.name.clone(),
            parameters: config
                .parameters
                .iter()
                .map(|p| ExtensionParameter::new(p.name.clone(), p.value.clone()))
                .collect(),
        }
    }
}

/// Render descriptors as a `Sec-WebSocket-Extensions` header value.
pub fn render_extensions_header(extensions: &[ExtensionDescriptor]) -> String {
    extensions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse one or more `Sec-WebSocket-Extensions` header values.
///
/// Values may be quoted strings with backslash escapes.
pub fn parse_extensions_header<'a, I>(values: I) -> WsResult<Vec<ExtensionDescriptor>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut descriptors = Vec::new();

    for value in values {
        for element in split_unquoted(value, ',') {
            let element = element.trim();
            if element.is_empty() {
                continue;
            }

            let mut parts = split_unquoted(element, ';').into_iter();
            let name = parts.next().map(str::trim).unwrap_or_default();
            if !is_token(name) {
                return Err(WsError::handshake_failed(format!(
                    "invalid extension name in header: {element}"
                )));
            }

            let mut descriptor = ExtensionDescriptor::new(name);
            for part in parts {
                descriptor.parameters.push(parse_parameter(part.trim(), element)?);
            }
            descriptors.push(descriptor);
        }
    }

    Ok(descriptors)
}

fn parse_parameter(raw: &str, element: &str) -> WsResult<ExtensionParameter> {
    let invalid =
        || WsError::handshake_failed(format!("invalid extension parameter in header: {element}"));

    let (name, value) = match raw.split_once('=') {
        None => (raw, None),
        Some((name, value)) => (name.trim(), Some(value.trim())),
    };
    if !is_token(name) {
        return Err(invalid());
    }

    let value = match value {
        None => None,
        Some(v) if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') => {
            let mut unquoted = String::with_capacity(v.len() - 2);
            let mut chars = v[1..v.len() - 1].chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    unquoted.push(chars.next().ok_or_else(invalid)?);
                } else {
                    unquoted.push(c);
                }
            }
            Some(unquoted)
        }
        Some(v) if is_token(v) => Some(v.to_string()),
        Some(_) => return Err(invalid()),
    };

    Ok(ExtensionParameter::new(name, value))
}

fn split_unquoted(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if in_quotes && c == '\\' {
            escaped = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        } else if c == separator && !in_quotes {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// Per-connection property bag shared by the extensions of one connection.
#[derive(Default)]
pub struct ExtensionContext {
    properties: HashMap<String, Box<dyn Any + Send>>,
}

impl ExtensionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning whether a previous value was replaced.
    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) -> bool {
        self.properties.insert(key.into(), Box::new(value)).is_some()
    }

    /// Borrow a value of type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.properties.get(key).and_then(|v| v.downcast_ref())
    }

    /// Mutably borrow a value of type `T`.
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.properties.get_mut(key).and_then(|v| v.downcast_mut())
    }

    /// Remove a value of type `T`.
    ///
    /// A value stored under `key` with a different type is left in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.properties.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        self.properties
            .remove(key)
            .and_then(|v| v.downcast().ok())
            .map(|v| *v)
    }

    /// Whether a value is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether the context is empty.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Drop every stored value.
    pub fn clear(&mut self) {
        self.properties.clear();
    }
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("keys", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An extension that transforms frames.
///
/// One instance may serve many connections; per-connection state belongs in
/// the [`ExtensionContext`].
pub trait ExtendedExtension: Send + Sync {
    /// Transform an inbound frame.
    fn process_incoming(&self, ctx: &mut ExtensionContext, frame: &Frame) -> WsResult<Frame>;

    /// Transform an outbound frame.
    fn process_outgoing(&self, ctx: &mut ExtensionContext, frame: &Frame) -> WsResult<Frame>;

    /// Inspect the parameters the server answered with.
    fn on_handshake_response(
        &self,
        _ctx: &mut ExtensionContext,
        _parameters: &[ExtensionParameter],
    ) -> WsResult<()> {
        Ok(())
    }

    /// Release per-connection state. Called once when the connection closes.
    fn destroy(&self, _ctx: &mut ExtensionContext) {}
}

/// A configured or negotiated extension.
#[derive(Clone)]
pub struct Extension {
    descriptor: ExtensionDescriptor,
    extended: Option<Arc<dyn ExtendedExtension>>,
}

impl Extension {
    /// An extension that is only announced, never applied to frames.
    pub fn plain(descriptor: ExtensionDescriptor) -> Self {
        Self {
            descriptor,
            extended: None,
        }
    }

    /// An extension that transforms frames.
    pub fn extended(descriptor: ExtensionDescriptor, extension: Arc<dyn ExtendedExtension>) -> Self {
        Self {
            descriptor,
            extended: Some(extension),
        }
    }

    /// Extension name.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Descriptor as offered (or as answered, once negotiated).
    pub fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }

    /// The frame transformer, if any.
    pub fn extended_extension(&self) -> Option<&Arc<dyn ExtendedExtension>> {
        self.extended.as_ref()
    }

    /// Whether this extension transforms frames.
    pub fn is_extended(&self) -> bool {
        self.extended.is_some()
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("descriptor", &self.descriptor)
            .field("extended", &self.is_extended())
            .finish()
    }
}

/// Select the extensions the server accepted.
///
/// The result keeps the client's configured order; each kept extension takes
/// the server's parameters. Extended extensions see those parameters through
/// `on_handshake_response`; a failing hook is logged and the extension kept.
pub fn negotiate(
    configured: &[Extension],
    answered: &[ExtensionDescriptor],
    ctx: &mut ExtensionContext,
) -> Vec<Extension> {
    let mut negotiated = Vec::new();

    for extension in configured {
        let Some(server) = answered.iter().find(|d| d.same_extension(extension.descriptor())) else {
            continue;
        };

        if let Some(extended) = extension.extended_extension() {
            if let Err(err) = extended.on_handshake_response(ctx, server.parameters()) {
                warn!(extension = extension.name(), error = %err, "Extension rejected handshake response parameters");
            }
        }

        negotiated.push(Extension {
            descriptor: server.clone(),
            extended: extension.extended.clone(),
        });
    }

    negotiated
}

/// Ordered chain of negotiated extensions for one connection.
#[derive(Debug, Default)]
pub struct ExtensionPipeline {
    extensions: Vec<Extension>,
    destroyed: bool,
}

impl ExtensionPipeline {
    /// Create a pipeline in negotiated order.
    pub fn new(extensions: Vec<Extension>) -> Self {
        Self {
            extensions,
            destroyed: false,
        }
    }

    /// Negotiated extensions.
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Whether no extension was negotiated.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Run `frame` through every extended extension, in order.
    ///
    /// A failing extension is skipped and the frame continues as it was.
    pub fn apply_incoming(&self, ctx: &mut ExtensionContext, frame: Frame) -> Frame {
        let mut frame = frame;
        for (name, extension) in self.extended() {
            match extension.process_incoming(ctx, &frame) {
                Ok(processed) => frame = processed,
                Err(err) => {
                    debug!(extension = name, error = %err, "Incoming extension hook failed");
                }
            }
        }
        frame
    }

    /// Run an outbound `frame` through every extended extension, in order.
    pub fn apply_outgoing(&self, ctx: &mut ExtensionContext, frame: Frame) -> Frame {
        let mut frame = frame;
        for (name, extension) in self.extended() {
            match extension.process_outgoing(ctx, &frame) {
                Ok(processed) => frame = processed,
                Err(err) => {
                    debug!(extension = name, error = %err, "Outgoing extension hook failed");
                }
            }
        }
        frame
    }

    /// Call `destroy` on every extended extension. Later calls do nothing.
    pub fn destroy(&mut self, ctx: &mut ExtensionContext) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        for (_, extension) in self.extended() {
            extension.destroy(ctx);
        }
    }

    fn extended(&self) -> impl Iterator<Item = (&str, &Arc<dyn ExtendedExtension>)> {
        self.extensions
            .iter()
            .filter_map(|e| e.extended_extension().map(|x| (e.name(), x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Suffix(&'static str);

    impl ExtendedExtension for Suffix {
        fn process_incoming(&self, ctx: &mut ExtensionContext, frame: &Frame) -> WsResult<Frame> {
            let seen = ctx.get::<usize>("seen").copied().unwrap_or(0);
            ctx.insert("seen", seen + 1);
            let mut payload = frame.payload.to_vec();
            payload.extend_from_slice(self.0.as_bytes());
            Ok(Frame::text(payload))
        }

        fn process_outgoing(&self, _ctx: &mut ExtensionContext, frame: &Frame) -> WsResult<Frame> {
            Ok(frame.clone())
        }
    }

    struct Failing;

    impl ExtendedExtension for Failing {
        fn process_incoming(&self, _: &mut ExtensionContext, _: &Frame) -> WsResult<Frame> {
            Err(WsError::extension("failing", "always"))
        }

        fn process_outgoing(&self, _: &mut ExtensionContext, _: &Frame) -> WsResult<Frame> {
            Err(WsError::extension("failing", "always"))
        }

        fn on_handshake_response(
            &self,
            _: &mut ExtensionContext,
            _: &[ExtensionParameter],
        ) -> WsResult<()> {
            Err(WsError::extension("failing", "bad parameters"))
        }
    }

    #[derive(Default)]
    struct CountingDestroy(AtomicUsize);

    impl ExtendedExtension for CountingDestroy {
        fn process_incoming(&self, _: &mut ExtensionContext, frame: &Frame) -> WsResult<Frame> {
            Ok(frame.clone())
        }

        fn process_outgoing(&self, _: &mut ExtensionContext, frame: &Frame) -> WsResult<Frame> {
            Ok(frame.clone())
        }

        fn destroy(&self, _: &mut ExtensionContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_parse_simple_header() {
        let parsed = parse_extensions_header(["permessage-deflate; client_max_window_bits, foo"])
            .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name(), "permessage-deflate");
        assert_eq!(parsed[0].parameters()[0].name(), "client_max_window_bits");
        assert_eq!(parsed[0].parameters()[0].value(), None);
        assert_eq!(parsed[1].name(), "foo");
    }

    #[test]
    fn test_parse_multiple_header_lines_and_quotes() {
        let parsed =
            parse_extensions_header(["a; x=10", r#"b; y="hello, world"; z="q\"uote""#]).unwrap();
        assert_eq!(parsed[0].parameters()[0].value(), Some("10"));
        assert_eq!(parsed[1].parameters()[0].value(), Some("hello, world"));
        assert_eq!(parsed[1].parameters()[1].value(), Some("q\"uote"));
    }

    #[test]
    fn test_parse_rejects_bad_name() {
        assert!(parse_extensions_header(["; x=1"]).is_err());
        assert!(parse_extensions_header(["a; =1"]).is_err());
    }

    #[test]
    fn test_render_header() {
        let descriptors = vec![
            ExtensionDescriptor::new("a").with_parameter("x", Some("10")),
            ExtensionDescriptor::new("b")
                .with_parameter("flag", None)
                .with_parameter("y", Some("two words")),
        ];
        let header = render_extensions_header(&descriptors);
        assert_eq!(header, r#"a; x=10, b; flag; y="two words""#);
        assert_eq!(parse_extensions_header([header.as_str()]).unwrap(), descriptors);
    }

    #[test]
    fn test_context_typed_access() {
        let mut ctx = ExtensionContext::new();
        assert!(!ctx.insert("window", 15u8));
        assert_eq!(ctx.get::<u8>("window"), Some(&15));
        assert_eq!(ctx.get::<u16>("window"), None);
        *ctx.get_mut::<u8>("window").unwrap() = 9;
        assert_eq!(ctx.remove::<u16>("window"), None);
        assert_eq!(ctx.remove::<u8>("window"), Some(9));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_negotiate_keeps_client_order() {
        let configured = vec![
            Extension::plain(ExtensionDescriptor::new("A")),
            Extension::plain(ExtensionDescriptor::new("B")),
        ];
        let mut ctx = ExtensionContext::new();

        let only_b = negotiate(&configured, &[ExtensionDescriptor::new("B")], &mut ctx);
        assert_eq!(only_b.iter().map(Extension::name).collect::<Vec<_>>(), ["B"]);

        let reversed = negotiate(
            &configured,
            &[ExtensionDescriptor::new("B"), ExtensionDescriptor::new("A")],
            &mut ctx,
        );
        assert_eq!(reversed.iter().map(Extension::name).collect::<Vec<_>>(), ["A", "B"]);
    }

    #[test]
    fn test_negotiate_is_case_sensitive_and_takes_server_params() {
        let configured = vec![Extension::plain(
            ExtensionDescriptor::new("deflate").with_parameter("bits", Some("15")),
        )];
        let mut ctx = ExtensionContext::new();

        assert!(negotiate(&configured, &[ExtensionDescriptor::new("Deflate")], &mut ctx).is_empty());

        let answered = [ExtensionDescriptor::new("deflate").with_parameter("bits", Some("10"))];
        let negotiated = negotiate(&configured, &answered, &mut ctx);
        assert_eq!(negotiated[0].descriptor(), &answered[0]);
    }

    #[test]
    fn test_negotiate_keeps_extension_when_hook_fails() {
        let configured = vec![Extension::extended(
            ExtensionDescriptor::new("failing"),
            Arc::new(Failing),
        )];
        let mut ctx = ExtensionContext::new();
        let negotiated = negotiate(&configured, &[ExtensionDescriptor::new("failing")], &mut ctx);
        assert_eq!(negotiated.len(), 1);
        assert!(negotiated[0].is_extended());
    }

    #[test]
    fn test_pipeline_applies_in_order_and_skips_failures() {
        let pipeline = ExtensionPipeline::new(vec![
            Extension::extended(ExtensionDescriptor::new("one"), Arc::new(Suffix("1"))),
            Extension::plain(ExtensionDescriptor::new("plain")),
            Extension::extended(ExtensionDescriptor::new("failing"), Arc::new(Failing)),
            Extension::extended(ExtensionDescriptor::new("two"), Arc::new(Suffix("2"))),
        ]);
        let mut ctx = ExtensionContext::new();

        let frame = pipeline.apply_incoming(&mut ctx, Frame::text("x"));
        assert_eq!(&frame.payload[..], b"x12");
        assert_eq!(ctx.get::<usize>("seen"), Some(&2));

        let out = pipeline.apply_outgoing(&mut ctx, Frame::text("y"));
        assert_eq!(&out.payload[..], b"y");
    }

    #[test]
    fn test_pipeline_destroy_runs_once() {
        let counter = Arc::new(CountingDestroy::default());
        let mut pipeline = ExtensionPipeline::new(vec![Extension::extended(
            ExtensionDescriptor::new("counted"),
            counter.clone(),
        )]);
        let mut ctx = ExtensionContext::new();

        pipeline.destroy(&mut ctx);
        pipeline.destroy(&mut ctx);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
