//! # sockudo-ws-engine: RFC 6455 protocol engine
//!
//! A transport-agnostic WebSocket engine. It owns everything between raw
//! bytes and application callbacks, and leaves sockets to the caller:
//!
//! - **Framing**: incremental frame parser that resumes across reads,
//!   encoder, masking
//! - **Fragmentation**: continuation tracking in both directions, control
//!   frames interleaved between fragments
//! - **Extensions**: negotiated frame transformation pipeline with
//!   permessage-deflate (RFC 7692)
//! - **Handshake**: server and client upgrade negotiation, subprotocol and
//!   extension selection
//! - **Sessions**: per-connection send state, close handshake, message
//!   buffering and dispatch to whole, partial or streaming handlers
//! - **Engine**: registry of upgraded connections and broadcast
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_ws_engine::prelude::*;
//!
//! let engine = Engine::builder()
//!     .handlers(Handlers::new().on_text(|session, text| {
//!         let _ = session.send_text(&text);
//!     }))
//!     .build();
//!
//! // With the `tokio-runtime` feature:
//! sockudo_ws_engine::transport::serve_connection(&engine, tcp_stream).await?;
//!
//! // Or drive it by hand:
//! let upgraded = engine.upgrade(&request, writer)?;
//! // write upgraded.response, then
//! let mut connection = upgraded.connection;
//! connection.open()?;
//! connection.feed(&bytes_from_peer)?;
//! ```

use std::time::Duration;

pub mod buffer;
pub mod connection;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extension;
pub mod fragment;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod session;
pub mod utf8;
pub mod writer;

#[cfg(feature = "permessage-deflate")]
pub mod deflate;

#[cfg(feature = "tokio-runtime")]
pub mod transport;

pub use connection::{Connection, ConnectionBuilder, ConnectionState};
pub use engine::{Engine, EngineBuilder, Upgraded};
pub use error::{CloseReason, Error, Result};
pub use extension::{Extension, ExtensionContext, ExtensionOffer, ExtensionParam};
pub use frame::{Frame, OpCode};
pub use handshake::{ClientHandshake, ServerHandshake, UpgradeRequest, UpgradeResponse};
pub use protocol::Role;
pub use session::{ConnectionId, Handlers, Session};
pub use writer::{SendFuture, Writer};

#[cfg(feature = "permessage-deflate")]
pub use deflate::{DeflateConfig, PerMessageDeflate};

/// Default receive buffer size (64KB)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum frame header size (2 + 8 + 4 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 7-bit length field; also the control frame limit
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload that fits the 16-bit extended length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this engine speaks
pub const WS_VERSION: &str = "13";

/// How long a send waits for a fragmented message to finish
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(3000);

/// Upper bound on an HTTP upgrade head
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8192;

/// Engine configuration
///
/// # Example
///
/// ```
/// use sockudo_ws_engine::Config;
///
/// let config = Config::builder()
///     .max_frame_size(1024 * 1024)
///     .max_text_message_buffer_size(4 * 1024 * 1024)
///     .require_masked_frames(true)
///     .build();
/// assert_eq!(config.max_frame_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest accepted frame payload (default: 16MB)
    pub max_frame_size: usize,
    /// Limit for a buffered text message (default: 64MB)
    pub max_text_message_buffer_size: usize,
    /// Limit for a buffered binary message (default: 64MB)
    pub max_binary_message_buffer_size: usize,
    /// How long a whole-message send waits for a streamed one (default: 3s)
    pub send_timeout: Duration,
    /// Close with 1002 when a client frame arrives unmasked, or a server frame
    /// masked (default: false)
    pub require_masked_frames: bool,
    /// Broadcast fans out across threads above this many sessions (default: 1024)
    pub broadcast_parallel_threshold: usize,
    /// Sessions per broadcast worker (default: 256)
    pub broadcast_chunk_size: usize,
    /// Largest HTTP upgrade head accepted (default: 8KB)
    pub max_handshake_size: usize,
    /// Offer or accept permessage-deflate (default: None)
    #[cfg(feature = "permessage-deflate")]
    pub compression: Option<DeflateConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_text_message_buffer_size: 64 * 1024 * 1024,
            max_binary_message_buffer_size: 64 * 1024 * 1024,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            require_masked_frames: false,
            broadcast_parallel_threshold: 1024,
            broadcast_chunk_size: 256,
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            #[cfg(feature = "permessage-deflate")]
            compression: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum frame payload size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the buffered text message limit
    pub fn max_text_message_buffer_size(mut self, size: usize) -> Self {
        self.config.max_text_message_buffer_size = size;
        self
    }

    /// Set the buffered binary message limit
    pub fn max_binary_message_buffer_size(mut self, size: usize) -> Self {
        self.config.max_binary_message_buffer_size = size;
        self
    }

    /// Set both message buffer limits
    pub fn max_message_size(self, size: usize) -> Self {
        self.max_text_message_buffer_size(size)
            .max_binary_message_buffer_size(size)
    }

    /// Set the send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// Enforce the RFC masking direction on incoming frames
    pub fn require_masked_frames(mut self, required: bool) -> Self {
        self.config.require_masked_frames = required;
        self
    }

    /// Set the session count above which broadcast runs in parallel
    pub fn broadcast_parallel_threshold(mut self, sessions: usize) -> Self {
        self.config.broadcast_parallel_threshold = sessions;
        self
    }

    /// Set how many sessions one broadcast worker handles
    pub fn broadcast_chunk_size(mut self, sessions: usize) -> Self {
        self.config.broadcast_chunk_size = sessions.max(1);
        self
    }

    /// Set the upgrade head size limit
    pub fn max_handshake_size(mut self, size: usize) -> Self {
        self.config.max_handshake_size = size;
        self
    }

    /// Enable permessage-deflate
    #[cfg(feature = "permessage-deflate")]
    pub fn compression(mut self, deflate: DeflateConfig) -> Self {
        self.config.compression = Some(deflate);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::connection::{Connection, ConnectionState};
    pub use crate::engine::{Engine, Upgraded};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::handshake::{ClientHandshake, ServerHandshake, UpgradeRequest};
    pub use crate::protocol::Role;
    pub use crate::session::{Handlers, Session};
    pub use crate::writer::{SendFuture, Writer};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.send_timeout, Duration::from_millis(3000));
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert!(!config.require_masked_frames);
    }

    #[test]
    fn test_builder_sets_both_message_limits() {
        let config = Config::builder().max_message_size(1024).build();
        assert_eq!(config.max_text_message_buffer_size, 1024);
        assert_eq!(config.max_binary_message_buffer_size, 1024);
    }

    #[test]
    fn test_broadcast_chunk_size_never_zero() {
        let config = Config::builder().broadcast_chunk_size(0).build();
        assert_eq!(config.broadcast_chunk_size, 1);
    }
}
