//! WebSocket opening handshake (RFC 6455 §4)
//!
//! HTTP heads are parsed with `httparse` into owned [`UpgradeRequest`] /
//! [`UpgradeResponse`] values. [`ServerHandshake`] validates a request and
//! answers it, negotiating the subprotocol and extensions through a
//! [`NegotiationPolicy`]. [`ClientHandshake`] builds the request and checks
//! the server's answer. Every failure is an [`Error::Handshake`] carrying the
//! HTTP status to report.

use std::fmt::Write as _;
use std::sync::Arc;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::extension::{
    ExtensionContext, ExtensionOffer, SharedExtension, format_extensions, parse_extensions,
};
use crate::mask::fill_random;
use crate::{DEFAULT_MAX_HANDSHAKE_SIZE, WS_GUID, WS_VERSION};

/// `Sec-WebSocket-Key`
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
/// `Sec-WebSocket-Accept`
pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
/// `Sec-WebSocket-Version`
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
/// `Sec-WebSocket-Protocol`
pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
/// `Sec-WebSocket-Extensions`
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";

const MAX_HEADERS: usize = 64;

/// Ordered, case-insensitive header list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every header with this name by a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.append(name, value);
    }

    /// First value of a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn from_httparse(headers: &[httparse::Header<'_>]) -> Result<Self> {
        let mut out = Headers::new();
        for header in headers {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::handshake(400, "invalid header value"))?;
            out.append(header.name, value.trim());
        }
        Ok(out)
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for (name, value) in &self.0 {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

/// An HTTP upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request method
    pub method: String,
    /// Request target, including the query string
    pub path: String,
    /// Request headers
    pub headers: Headers,
}

impl UpgradeRequest {
    /// Serialize the request head
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        self.headers.write_to(&mut buf);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Path without the query string
    pub fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or("/")
    }

    /// Query string, if any
    pub fn query(&self) -> Option<&str> {
        self.path.split_once('?').map(|(_, q)| q)
    }
}

/// An HTTP response to an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Response headers
    pub headers: Headers,
}

impl UpgradeResponse {
    /// Create a response with no headers
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    /// Serialize the response head
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        let _ = write!(
            StatusLine(&mut buf),
            "HTTP/1.1 {} {}\r\n",
            self.status,
            self.reason
        );
        self.headers.write_to(&mut buf);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Response sent when a handshake error rejects the upgrade
    pub fn rejection(err: &Error) -> Self {
        let status = err.http_status().unwrap_or(400);
        let mut response = Self::new(status, reason_phrase(status));
        if status == 426 {
            response.headers.append(SEC_WEBSOCKET_VERSION, WS_VERSION);
        }
        response.headers.append("Content-Length", "0");
        response.headers.append("Connection", "close");
        response
    }
}

struct StatusLine<'a>(&'a mut BytesMut);

impl std::fmt::Write for StatusLine<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.put_slice(s.as_bytes());
        Ok(())
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

/// Parse an HTTP request head
///
/// Returns the request and the number of bytes consumed, or `None` when the
/// head is incomplete.
pub fn parse_request(buf: &[u8], max_size: usize) -> Result<Option<(UpgradeRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if len > max_size {
                return Err(Error::handshake(400, "request head too large"));
            }
            let request = UpgradeRequest {
                method: req.method.unwrap_or("").to_owned(),
                path: req.path.unwrap_or("/").to_owned(),
                headers: Headers::from_httparse(req.headers)?,
            };
            Ok(Some((request, len)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_size {
                return Err(Error::handshake(400, "request head too large"));
            }
            Ok(None)
        }
        Err(_) => Err(Error::handshake(400, "failed to parse HTTP request")),
    }
}

/// Parse an HTTP response head
pub fn parse_response(buf: &[u8], max_size: usize) -> Result<Option<(UpgradeResponse, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if len > max_size {
                return Err(Error::handshake(400, "response head too large"));
            }
            let response = UpgradeResponse {
                status: res.code.unwrap_or(0),
                reason: res.reason.unwrap_or("").to_owned(),
                headers: Headers::from_httparse(res.headers)?,
            };
            Ok(Some((response, len)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_size {
                return Err(Error::handshake(400, "response head too large"));
            }
            Ok(None)
        }
        Err(_) => Err(Error::handshake(400, "failed to parse HTTP response")),
    }
}

/// Compute `Sec-WebSocket-Accept`: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a random 16-byte `Sec-WebSocket-Key`
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn header_has_token(value: Option<&str>, token: &str) -> bool {
    value.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

fn split_list(values: impl Iterator<Item = impl AsRef<str>>) -> Vec<String> {
    values
        .flat_map(|v| {
            v.as_ref()
                .split(',')
                .map(|s| s.trim().to_owned())
                .collect::<Vec<_>>()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Server-side decisions taken during negotiation
pub trait NegotiationPolicy: Send + Sync {
    /// Whether a request from this origin may upgrade
    fn check_origin(&self, _origin: Option<&str>) -> bool {
        true
    }

    /// Pick the subprotocol: by default the first requested one the server supports
    fn select_subprotocol(&self, supported: &[String], requested: &[String]) -> Option<String> {
        requested
            .iter()
            .find(|r| supported.iter().any(|s| s == *r))
            .cloned()
    }

    /// Pair requested offers with installed extensions
    ///
    /// By default every offer whose name matches an installed extension is
    /// tried in request order; an extension is accepted at most once.
    fn select_extensions(
        &self,
        installed: &[SharedExtension],
        requested: &[ExtensionOffer],
    ) -> Vec<(SharedExtension, ExtensionOffer)> {
        let mut picked: Vec<(SharedExtension, ExtensionOffer)> = Vec::new();
        for offer in requested {
            if picked.iter().any(|(e, _)| e.name() == offer.name) {
                continue;
            }
            if let Some(ext) = installed.iter().find(|e| e.name() == offer.name) {
                picked.push((Arc::clone(ext), offer.clone()));
            }
        }
        picked
    }
}

/// Default policy: accept any origin, first-match subprotocol and extensions
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNegotiation;

impl NegotiationPolicy for DefaultNegotiation {}

/// Policy that only accepts a fixed set of origins
#[derive(Debug, Clone)]
pub struct AllowedOrigins(pub Vec<String>);

impl NegotiationPolicy for AllowedOrigins {
    fn check_origin(&self, origin: Option<&str>) -> bool {
        origin.is_some_and(|o| self.0.iter().any(|allowed| allowed.eq_ignore_ascii_case(o)))
    }
}

/// Outcome of a successful server negotiation
pub struct ServerNegotiated {
    /// 101 response to write back
    pub response: UpgradeResponse,
    /// Request target including the query string
    pub path: String,
    /// Origin header, if sent
    pub origin: Option<String>,
    /// Agreed subprotocol
    pub subprotocol: Option<String>,
    /// Accepted extensions in response header order
    pub extensions: Vec<SharedExtension>,
}

impl std::fmt::Debug for ServerNegotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerNegotiated")
            .field("path", &self.path)
            .field("origin", &self.origin)
            .field("subprotocol", &self.subprotocol)
            .field(
                "extensions",
                &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Server half of the handshake
#[derive(Clone)]
pub struct ServerHandshake {
    subprotocols: Vec<String>,
    extensions: Vec<SharedExtension>,
    policy: Arc<dyn NegotiationPolicy>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    /// Server accepting no subprotocol and no extension
    pub fn new() -> Self {
        Self {
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            policy: Arc::new(DefaultNegotiation),
        }
    }

    /// Supported subprotocols
    pub fn subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Install an extension the server may accept
    pub fn extension(mut self, extension: SharedExtension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Replace the negotiation policy
    pub fn policy(mut self, policy: Arc<dyn NegotiationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Validate an upgrade request and build the 101 response
    ///
    /// `ctx` is the new connection's extension context; accepted extensions
    /// initialise their state in it.
    pub fn negotiate(
        &self,
        request: &UpgradeRequest,
        ctx: &mut ExtensionContext,
    ) -> Result<ServerNegotiated> {
        if !request.method.eq_ignore_ascii_case("GET") {
            return Err(Error::handshake(400, "method must be GET"));
        }
        let headers = &request.headers;
        if !headers
            .get("Upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
        {
            return Err(Error::handshake(400, "missing Upgrade: websocket"));
        }
        // Some browsers send "Connection: keep-alive, Upgrade"
        if !header_has_token(headers.get("Connection"), "upgrade") {
            return Err(Error::handshake(400, "missing Connection: Upgrade"));
        }
        if headers.get("Host").is_none_or(|h| h.trim().is_empty()) {
            return Err(Error::handshake(400, "missing Host header"));
        }
        match headers.get(SEC_WEBSOCKET_VERSION) {
            Some(v) if v.trim() == WS_VERSION => {}
            _ => return Err(Error::handshake(426, "unsupported WebSocket version")),
        }
        let key = headers
            .get(SEC_WEBSOCKET_KEY)
            .ok_or_else(|| Error::handshake(400, "missing Sec-WebSocket-Key"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(key.trim())
            .map_err(|_| Error::handshake(400, "malformed Sec-WebSocket-Key"))?;
        if decoded.len() != 16 {
            return Err(Error::handshake(400, "Sec-WebSocket-Key must be 16 bytes"));
        }

        let origin = headers
            .get("Origin")
            .or_else(|| headers.get("Sec-WebSocket-Origin"))
            .map(str::to_owned);
        if !self.policy.check_origin(origin.as_deref()) {
            return Err(Error::handshake(403, "origin not allowed"));
        }

        let mut response = UpgradeResponse::new(101, reason_phrase(101));
        response.headers.append("Upgrade", "websocket");
        response.headers.append("Connection", "Upgrade");
        response
            .headers
            .append(SEC_WEBSOCKET_ACCEPT, generate_accept_key(key.trim()));

        let requested_protocols = split_list(headers.get_all(SEC_WEBSOCKET_PROTOCOL));
        let subprotocol = if requested_protocols.is_empty() {
            None
        } else {
            self.policy
                .select_subprotocol(&self.subprotocols, &requested_protocols)
        };
        if let Some(p) = &subprotocol {
            response.headers.append(SEC_WEBSOCKET_PROTOCOL, p.clone());
        }

        let offers = parse_extensions(headers.get_all(SEC_WEBSOCKET_EXTENSIONS));
        let mut accepted = Vec::new();
        let mut answered = Vec::new();
        for (ext, offer) in self.policy.select_extensions(&self.extensions, &offers) {
            if let Some(params) = ext.on_extension_negotiation(ctx, &offer.params) {
                answered.push(ExtensionOffer {
                    name: offer.name,
                    params,
                });
                accepted.push(ext);
            }
        }
        if !answered.is_empty() {
            response
                .headers
                .append(SEC_WEBSOCKET_EXTENSIONS, format_extensions(&answered));
        }

        tracing::debug!(
            path = %request.path,
            subprotocol = ?subprotocol,
            extensions = answered.len(),
            "upgrade request accepted"
        );

        Ok(ServerNegotiated {
            response,
            path: request.path.clone(),
            origin,
            subprotocol,
            extensions: accepted,
        })
    }
}

/// Outcome of a successful client handshake
pub struct ClientNegotiated {
    /// Subprotocol chosen by the server
    pub subprotocol: Option<String>,
    /// Accepted extensions in response header order
    pub extensions: Vec<SharedExtension>,
}

impl std::fmt::Debug for ClientNegotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientNegotiated")
            .field("subprotocol", &self.subprotocol)
            .field(
                "extensions",
                &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Client half of the handshake
#[derive(Clone)]
pub struct ClientHandshake {
    host: String,
    port: Option<u16>,
    secure: bool,
    path: String,
    origin: Option<String>,
    subprotocols: Vec<String>,
    extensions: Vec<SharedExtension>,
    key: String,
}

impl ClientHandshake {
    /// Handshake for `host` and request target `path` (may include a query)
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            host: host.into(),
            port: None,
            secure: false,
            path: if path.is_empty() { "/".into() } else { path },
            origin: None,
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            key: generate_key(),
        }
    }

    /// Parse a `ws://` or `wss://` URI
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (secure, rest) = if let Some(rest) = uri.strip_prefix("ws://") {
            (false, rest)
        } else if let Some(rest) = uri.strip_prefix("wss://") {
            (true, rest)
        } else {
            return Err(Error::handshake(400, "URI scheme must be ws or wss"));
        };

        let (authority, path) = match rest.find(['/', '?']) {
            Some(i) if rest.as_bytes()[i] == b'?' => (&rest[..i], format!("/{}", &rest[i..])),
            Some(i) => (&rest[..i], rest[i..].to_owned()),
            None => (rest, "/".to_owned()),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.contains(']') => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| Error::handshake(400, "invalid port in URI"))?;
                (h, Some(port))
            }
            _ => (authority, None),
        };
        if host.is_empty() {
            return Err(Error::handshake(400, "URI has no host"));
        }

        let mut handshake = Self::new(host, path).secure(secure);
        handshake.port = port;
        Ok(handshake)
    }

    /// Explicit port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Whether the transport is TLS (affects default port elision)
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Origin header value
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Requested subprotocols in preference order
    pub fn subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Offer an extension
    pub fn extension(mut self, extension: SharedExtension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Generated `Sec-WebSocket-Key`
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Host name without port
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Request target
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the URI asked for `wss`
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Port to connect to
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 443 } else { 80 })
    }

    /// `Host` header value; the port is omitted when it is 80 or 443
    pub fn host_header(&self) -> String {
        match self.port {
            Some(p) if p != 80 && p != 443 => format!("{}:{}", self.host, p),
            _ => self.host.clone(),
        }
    }

    /// Build the upgrade request
    pub fn request(&self) -> UpgradeRequest {
        let mut headers = Headers::new();
        headers.append("Host", self.host_header());
        headers.append("Upgrade", "websocket");
        headers.append("Connection", "Upgrade");
        headers.append(SEC_WEBSOCKET_KEY, self.key.clone());
        headers.append(SEC_WEBSOCKET_VERSION, WS_VERSION);
        if let Some(origin) = &self.origin {
            headers.append("Origin", origin.clone());
        }
        if !self.subprotocols.is_empty() {
            headers.append(SEC_WEBSOCKET_PROTOCOL, self.subprotocols.join(", "));
        }
        if !self.extensions.is_empty() {
            let offers: Vec<_> = self.extensions.iter().map(|e| e.offer()).collect();
            headers.append(SEC_WEBSOCKET_EXTENSIONS, format_extensions(&offers));
        }
        UpgradeRequest {
            method: "GET".into(),
            path: self.path.clone(),
            headers,
        }
    }

    /// Validate the server's response and finish extension negotiation
    pub fn validate_response(
        &self,
        response: &UpgradeResponse,
        ctx: &mut ExtensionContext,
    ) -> Result<ClientNegotiated> {
        let status = response.status;
        if status != 101 {
            return Err(Error::handshake(
                status,
                format!("expected 101 Switching Protocols, got {}", status),
            ));
        }
        let headers = &response.headers;
        if !headers
            .get("Upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
        {
            return Err(Error::handshake(status, "invalid Upgrade header"));
        }
        if !header_has_token(headers.get("Connection"), "upgrade") {
            return Err(Error::handshake(status, "invalid Connection header"));
        }
        let accept = headers
            .get(SEC_WEBSOCKET_ACCEPT)
            .ok_or_else(|| Error::handshake(status, "missing Sec-WebSocket-Accept"))?;
        if accept.trim() != generate_accept_key(&self.key) {
            return Err(Error::handshake(status, "invalid Sec-WebSocket-Accept"));
        }

        let subprotocol = headers.get(SEC_WEBSOCKET_PROTOCOL).map(str::to_owned);
        if let Some(p) = &subprotocol {
            if !self.subprotocols.iter().any(|s| s == p) {
                return Err(Error::handshake(
                    status,
                    format!("server selected unrequested subprotocol {}", p),
                ));
            }
        }

        let mut extensions = Vec::new();
        for answer in parse_extensions(headers.get_all(SEC_WEBSOCKET_EXTENSIONS)) {
            let ext = self
                .extensions
                .iter()
                .find(|e| e.name() == answer.name)
                .ok_or_else(|| {
                    Error::handshake(
                        status,
                        format!("server accepted unrequested extension {}", answer.name),
                    )
                })?;
            ext.on_handshake_response(ctx, &answer.params)
                .map_err(|err| {
                    Error::handshake(
                        status,
                        format!("extension {} rejected the response: {}", answer.name, err),
                    )
                })?;
            extensions.push(Arc::clone(ext));
        }

        Ok(ClientNegotiated {
            subprotocol,
            extensions,
        })
    }
}

/// Read a full head from a buffer, returning the parsed value and leftovers
pub(crate) fn split_head<T>(
    buf: &mut BytesMut,
    parse: impl FnOnce(&[u8], usize) -> Result<Option<(T, usize)>>,
    max_size: Option<usize>,
) -> Result<Option<T>> {
    match parse(buf, max_size.unwrap_or(DEFAULT_MAX_HANDSHAKE_SIZE))? {
        Some((value, consumed)) => {
            let _ = buf.split_to(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
