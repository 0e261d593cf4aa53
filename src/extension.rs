//! Extension pipeline
//!
//! Extensions are per-connection frame transformers negotiated through
//! `Sec-WebSocket-Extensions`. Each one keeps its state in the connection's
//! [`ExtensionContext`]; the pipeline owns that context, runs the chain in
//! the order required by the connection side, and destroys the context once.
//!
//! A failing extension never takes the connection down: the error is logged
//! and the frame continues with the value it had before that extension ran.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::frame::Frame;

/// A `name[=value]` extension parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name
    pub name: String,
    /// Parameter value, if any
    pub value: Option<String>,
}

impl ExtensionParam {
    /// Create a parameter with a value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Create a parameter without a value
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

impl fmt::Display for ExtensionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            None => f.write_str(&self.name),
            Some(v) if v.bytes().all(is_token_byte) && !v.is_empty() => {
                write!(f, "{}={}", self.name, v)
            }
            Some(v) => {
                write!(f, "{}=\"", self.name)?;
                for c in v.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str("\"")
            }
        }
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// One extension entry of a `Sec-WebSocket-Extensions` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension token
    pub name: String,
    /// Parameters in header order
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Create an offer without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, param: ExtensionParam) -> Self {
        self.params.push(param);
        self
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for p in &self.params {
            write!(f, "; {}", p)?;
        }
        Ok(())
    }
}

/// Render a list of extensions as a single header value
pub fn format_extensions(offers: &[ExtensionOffer]) -> String {
    offers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Name,
    ParamName,
    ParamValue,
    Quoted,
    QuotedEscape,
    AfterQuoted,
    Error,
}

#[derive(Default)]
struct OfferScratch {
    name: String,
    param_name: String,
    param_value: String,
    params: Vec<ExtensionParam>,
}

impl OfferScratch {
    fn push_param(&mut self, value: Option<String>) {
        let name = self.param_name.trim().to_owned();
        self.param_name.clear();
        self.param_value.clear();
        if !name.is_empty() {
            self.params.push(ExtensionParam { name, value });
        }
    }

    fn finish(&mut self, out: &mut Vec<ExtensionOffer>) {
        let name = self.name.trim().to_owned();
        let params = std::mem::take(&mut self.params);
        self.name.clear();
        self.param_name.clear();
        self.param_value.clear();
        if !name.is_empty() {
            out.push(ExtensionOffer { name, params });
        }
    }

    fn discard(&mut self) {
        *self = Self::default();
    }
}

/// Parse `Sec-WebSocket-Extensions` header values
///
/// Accepts comma separated offers, `;` separated parameters, and quoted
/// values with backslash escapes. A malformed offer is skipped and parsing
/// resumes at the next comma.
pub fn parse_extensions<'a, I>(headers: I) -> Vec<ExtensionOffer>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = Vec::new();

    for header in headers {
        let mut state = ParseState::Name;
        let mut scratch = OfferScratch::default();

        for c in header.chars() {
            state = match (state, c) {
                (ParseState::Name, ';') => ParseState::ParamName,
                (ParseState::Name, ',') => {
                    scratch.finish(&mut out);
                    ParseState::Name
                }
                (ParseState::Name, '=') => ParseState::Error,
                (ParseState::Name, c) => {
                    scratch.name.push(c);
                    ParseState::Name
                }

                (ParseState::ParamName, ';') => {
                    scratch.push_param(None);
                    ParseState::ParamName
                }
                (ParseState::ParamName, ',') => {
                    scratch.push_param(None);
                    scratch.finish(&mut out);
                    ParseState::Name
                }
                (ParseState::ParamName, '=') => ParseState::ParamValue,
                (ParseState::ParamName, c) => {
                    scratch.param_name.push(c);
                    ParseState::ParamName
                }

                (ParseState::ParamValue, '"') => {
                    if scratch.param_value.trim().is_empty() {
                        scratch.param_value.clear();
                        ParseState::Quoted
                    } else {
                        ParseState::Error
                    }
                }
                (ParseState::ParamValue, ';') => {
                    let value = scratch.param_value.trim().to_owned();
                    scratch.push_param(Some(value));
                    ParseState::ParamName
                }
                (ParseState::ParamValue, ',') => {
                    let value = scratch.param_value.trim().to_owned();
                    scratch.push_param(Some(value));
                    scratch.finish(&mut out);
                    ParseState::Name
                }
                (ParseState::ParamValue, '=') => ParseState::Error,
                (ParseState::ParamValue, c) => {
                    scratch.param_value.push(c);
                    ParseState::ParamValue
                }

                (ParseState::Quoted, '"') => {
                    let value = scratch.param_value.clone();
                    scratch.push_param(Some(value));
                    ParseState::AfterQuoted
                }
                (ParseState::Quoted, '\\') => ParseState::QuotedEscape,
                (ParseState::Quoted, c) => {
                    scratch.param_value.push(c);
                    ParseState::Quoted
                }
                (ParseState::QuotedEscape, c) => {
                    scratch.param_value.push(c);
                    ParseState::Quoted
                }

                (ParseState::AfterQuoted, ',') => {
                    scratch.finish(&mut out);
                    ParseState::Name
                }
                (ParseState::AfterQuoted, ';') => ParseState::ParamName,
                (ParseState::AfterQuoted, c) if c.is_whitespace() => ParseState::AfterQuoted,
                (ParseState::AfterQuoted, _) => ParseState::Error,

                (ParseState::Error, ',') => {
                    tracing::debug!(header, "skipping malformed extension offer");
                    scratch.discard();
                    ParseState::Name
                }
                (ParseState::Error, _) => ParseState::Error,
            };
        }

        match state {
            ParseState::Error | ParseState::Quoted | ParseState::QuotedEscape => {
                tracing::debug!(header, "unable to parse extension offer");
            }
            ParseState::ParamName => {
                scratch.push_param(None);
                scratch.finish(&mut out);
            }
            ParseState::ParamValue => {
                let value = scratch.param_value.trim().to_owned();
                scratch.push_param(Some(value));
                scratch.finish(&mut out);
            }
            ParseState::Name | ParseState::AfterQuoted => scratch.finish(&mut out),
        }
    }

    out
}

/// Per-connection property map handed to every extension call
#[derive(Default)]
pub struct ExtensionContext {
    properties: HashMap<String, Box<dyn Any + Send>>,
}

impl ExtensionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a property, replacing any previous value
    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.properties.insert(key.into(), Box::new(value));
    }

    /// Borrow a property of the given type
    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.properties.get(key)?.downcast_ref()
    }

    /// Mutably borrow a property of the given type
    pub fn get_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.properties.get_mut(key)?.downcast_mut()
    }

    /// Remove a property
    pub fn remove(&mut self, key: &str) -> bool {
        self.properties.remove(key).is_some()
    }

    /// Whether the property exists
    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Number of stored properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether no properties are stored
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("keys", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A negotiated frame transformer
pub trait Extension: Send + Sync {
    /// Extension token used in `Sec-WebSocket-Extensions`
    fn name(&self) -> &str;

    /// RSV bits (as in the first header byte) this extension may set
    fn reserved_rsv(&self) -> u8 {
        0
    }

    /// Transform an incoming frame
    fn process_incoming(&self, ctx: &mut ExtensionContext, frame: &Frame) -> Result<Frame>;

    /// Transform an outgoing frame
    fn process_outgoing(&self, ctx: &mut ExtensionContext, frame: &Frame) -> Result<Frame>;

    /// Parameters a client offers in its upgrade request
    fn offer(&self) -> ExtensionOffer {
        ExtensionOffer::new(self.name())
    }

    /// Server side: answer a client's offer
    ///
    /// Returns the parameters to put in the response, or `None` to decline.
    fn on_extension_negotiation(
        &self,
        _ctx: &mut ExtensionContext,
        _requested: &[ExtensionParam],
    ) -> Option<Vec<ExtensionParam>> {
        Some(Vec::new())
    }

    /// Client side: accept the parameters the server answered with
    fn on_handshake_response(
        &self,
        _ctx: &mut ExtensionContext,
        _response: &[ExtensionParam],
    ) -> Result<()> {
        Ok(())
    }

    /// Release per-connection state
    fn destroy(&self, _ctx: &mut ExtensionContext) {}
}

/// Shared handle to an extension implementation
pub type SharedExtension = Arc<dyn Extension>;

/// Ordered chain of negotiated extensions for one connection
pub struct ExtensionPipeline {
    extensions: Vec<SharedExtension>,
    client: bool,
    reserved: u8,
    context: Mutex<ExtensionContext>,
    destroyed: AtomicBool,
}

impl ExtensionPipeline {
    /// Build a pipeline from extensions in `Sec-WebSocket-Extensions` order
    pub fn new(extensions: Vec<SharedExtension>, context: ExtensionContext, client: bool) -> Self {
        let reserved = extensions
            .iter()
            .fold(0u8, |bits, ext| bits | ext.reserved_rsv());
        Self {
            extensions,
            client,
            reserved,
            context: Mutex::new(context),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Pipeline with no extensions
    pub fn empty(client: bool) -> Self {
        Self::new(Vec::new(), ExtensionContext::new(), client)
    }

    /// Whether no extension was negotiated
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Names of the negotiated extensions in header order
    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    /// RSV bits reserved by any negotiated extension
    #[inline]
    pub fn reserved_rsv(&self) -> u8 {
        self.reserved
    }

    /// Run incoming transforms: header order on a server, reversed on a client
    pub fn incoming(&self, frame: Frame) -> Frame {
        if self.extensions.is_empty() {
            return frame;
        }
        let mut ctx = self.context.lock();
        if self.client {
            run_chain(self.extensions.iter().rev(), &mut ctx, frame, Direction::Incoming)
        } else {
            run_chain(self.extensions.iter(), &mut ctx, frame, Direction::Incoming)
        }
    }

    /// Run outgoing transforms: reversed on a server, header order on a client
    pub fn outgoing(&self, frame: Frame) -> Frame {
        if self.extensions.is_empty() {
            return frame;
        }
        let mut ctx = self.context.lock();
        if self.client {
            run_chain(self.extensions.iter(), &mut ctx, frame, Direction::Outgoing)
        } else {
            run_chain(self.extensions.iter().rev(), &mut ctx, frame, Direction::Outgoing)
        }
    }

    /// Destroy every extension's state. Only the first call has an effect.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ctx = self.context.lock();
        for ext in &self.extensions {
            ext.destroy(&mut ctx);
        }
    }

    /// Whether [`destroy`](Self::destroy) already ran
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Run `f` with the shared context
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ExtensionContext) -> R) -> R {
        f(&mut self.context.lock())
    }
}

impl fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPipeline")
            .field("extensions", &self.names())
            .field("client", &self.client)
            .finish()
    }
}

impl Drop for ExtensionPipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Incoming,
    Outgoing,
}

fn run_chain<'a>(
    chain: impl Iterator<Item = &'a SharedExtension>,
    ctx: &mut ExtensionContext,
    mut frame: Frame,
    direction: Direction,
) -> Frame {
    for ext in chain {
        let result = match direction {
            Direction::Incoming => ext.process_incoming(ctx, &frame),
            Direction::Outgoing => ext.process_outgoing(ctx, &frame),
        };
        match result {
            Ok(next) => frame = next,
            Err(err) => {
                tracing::debug!(extension = ext.name(), %err, "extension failed, keeping frame");
            }
        }
    }
    frame
}
