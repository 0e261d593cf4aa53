//! Per-Message Deflate Extension (RFC 7692)
//!
//! [`PerMessageDeflate`] is an [`Extension`] that reserves RSV1. The first
//! frame of a compressed message carries RSV1; its continuations do not, so
//! the per-direction "current message is compressed" flag lives in the
//! connection's [`ExtensionContext`] together with the zlib streams.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionContext, ExtensionOffer, ExtensionParam};
use crate::frame::{Frame, OpCode, RSV1};

/// Extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Trailer removed after compressing a message and restored before inflating it
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Smallest window zlib accepts for raw deflate streams
pub const MIN_WINDOW_BITS: u8 = 9;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

const CONTEXT_KEY: &str = "permessage-deflate.state";

/// Configuration for the permessage-deflate extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Server's maximum LZ77 window bits
    pub server_max_window_bits: u8,
    /// Client's maximum LZ77 window bits
    pub client_max_window_bits: u8,
    /// Server resets its compressor after each message
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after each message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9)
    pub compression_level: u32,
    /// Single-frame messages shorter than this are sent uncompressed
    pub compression_threshold: usize,
    /// Upper bound on the inflated size of one frame
    pub max_inflated_frame_size: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 6,
            compression_threshold: 32,
            max_inflated_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl DeflateConfig {
    /// Config tuned for low memory usage
    pub fn low_memory() -> Self {
        Self {
            server_max_window_bits: 10,
            client_max_window_bits: 10,
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            compression_level: 1,
            compression_threshold: 64,
            ..Self::default()
        }
    }

    /// Config tuned for best compression
    pub fn best_compression() -> Self {
        Self {
            compression_level: 9,
            compression_threshold: 16,
            ..Self::default()
        }
    }
}

/// Parameters agreed during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedDeflate {
    /// Server's window bits
    pub server_max_window_bits: u8,
    /// Client's window bits
    pub client_max_window_bits: u8,
    /// Server resets its compressor after each message
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after each message
    pub client_no_context_takeover: bool,
}

impl Default for NegotiatedDeflate {
    fn default() -> Self {
        Self {
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
        }
    }
}

impl NegotiatedDeflate {
    /// Parameters to put in a response or offer, omitting defaults
    pub fn to_params(&self) -> Vec<ExtensionParam> {
        let mut params = Vec::new();
        if self.server_no_context_takeover {
            params.push(ExtensionParam::flag("server_no_context_takeover"));
        }
        if self.client_no_context_takeover {
            params.push(ExtensionParam::flag("client_no_context_takeover"));
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            params.push(ExtensionParam::new(
                "server_max_window_bits",
                self.server_max_window_bits.to_string(),
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            params.push(ExtensionParam::new(
                "client_max_window_bits",
                self.client_max_window_bits.to_string(),
            ));
        }
        params
    }
}

fn parse_window_bits(param: &ExtensionParam) -> Result<u8> {
    let value = param
        .value
        .as_deref()
        .ok_or_else(|| Error::handshake(400, format!("{} requires a value", param.name)))?;
    let bits: u8 = value
        .parse()
        .map_err(|_| Error::handshake(400, format!("invalid {} value", param.name)))?;
    if !(8..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::handshake(
            400,
            format!("{} out of range (8-15)", param.name),
        ));
    }
    Ok(bits)
}

fn flag(param: &ExtensionParam) -> Result<()> {
    if param.value.is_some() {
        return Err(Error::handshake(
            400,
            format!("{} must not have a value", param.name),
        ));
    }
    Ok(())
}

/// Deflate compressor for outgoing messages
pub struct DeflateEncoder {
    compress: Compress,
    no_context_takeover: bool,
}

impl DeflateEncoder {
    /// Create a new raw-deflate encoder
    pub fn new(window_bits: u8, no_context_takeover: bool, level: u32) -> Self {
        let bits = window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            compress: Compress::new_with_window_bits(Compression::new(level), false, bits),
            no_context_takeover,
        }
    }

    /// Compress one frame's worth of a message
    ///
    /// Every call ends with a sync flush; the final frame of a message has
    /// the resulting `00 00 ff ff` trailer stripped.
    pub fn compress(&mut self, data: &[u8], last: bool) -> Result<Bytes> {
        let mut output = Vec::with_capacity(data.len() / 2 + 64);
        let start_in = self.compress.total_in();

        for _ in 0..100_000 {
            if output.capacity() - output.len() < 64 {
                output.reserve(output.capacity().max(4096));
            }
            let consumed = (self.compress.total_in() - start_in) as usize;
            let status = self
                .compress
                .compress_vec(&data[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {}", e)))?;

            let consumed = (self.compress.total_in() - start_in) as usize;
            let flushed = output.len() < output.capacity();
            if (consumed >= data.len() && flushed) || matches!(status, Status::StreamEnd) {
                if last {
                    if output.ends_with(&DEFLATE_TRAILER) {
                        output.truncate(output.len() - DEFLATE_TRAILER.len());
                    }
                    if self.no_context_takeover {
                        self.compress.reset();
                    }
                }
                return Ok(Bytes::from(output));
            }
        }

        Err(Error::Compression(
            "compression took too many iterations".into(),
        ))
    }

    /// Reset the compression context
    pub fn reset(&mut self) {
        self.compress.reset();
    }
}

/// Deflate decompressor for incoming messages
pub struct DeflateDecoder {
    decompress: Decompress,
    no_context_takeover: bool,
    max_size: usize,
}

impl DeflateDecoder {
    /// Create a new raw-deflate decoder
    pub fn new(window_bits: u8, no_context_takeover: bool, max_size: usize) -> Self {
        let bits = window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            decompress: Decompress::new_with_window_bits(false, bits),
            no_context_takeover,
            max_size,
        }
    }

    /// Inflate one frame's worth of a message
    ///
    /// The trailer is restored before inflating the final frame.
    pub fn decompress(&mut self, data: &[u8], last: bool) -> Result<Bytes> {
        let input: std::borrow::Cow<'_, [u8]> = if last {
            let mut owned = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
            owned.extend_from_slice(data);
            owned.extend_from_slice(&DEFLATE_TRAILER);
            owned.into()
        } else {
            data.into()
        };

        let mut output = Vec::with_capacity(data.len().saturating_mul(4).max(1024));
        let start_in = self.decompress.total_in();
        let mut result = Err(Error::Compression(
            "decompression took too many iterations".into(),
        ));

        for _ in 0..100_000 {
            if output.capacity() == output.len() {
                if output.len() >= self.max_size {
                    return Err(Error::MessageTooBig);
                }
                output.reserve(output.capacity().max(4096));
            }
            let consumed = (self.decompress.total_in() - start_in) as usize;
            let produced_before = output.len();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {}", e)))?;

            if output.len() > self.max_size {
                return Err(Error::MessageTooBig);
            }

            let consumed_now = (self.decompress.total_in() - start_in) as usize;
            let stalled = consumed_now == consumed && output.len() == produced_before;
            let drained = consumed_now >= input.len() && output.len() < output.capacity();
            if drained || stalled || matches!(status, Status::StreamEnd) {
                result = Ok(Bytes::from(output));
                break;
            }
        }

        if last && self.no_context_takeover {
            self.decompress.reset(false);
        }
        result
    }

    /// Reset the decompression context
    pub fn reset(&mut self) {
        self.decompress.reset(false);
    }
}

/// Per-connection deflate state kept in the extension context
struct DeflateState {
    encoder: DeflateEncoder,
    decoder: DeflateDecoder,
    threshold: usize,
    inflating: bool,
    deflating: bool,
}

/// permessage-deflate as a pipeline extension
#[derive(Debug, Clone)]
pub struct PerMessageDeflate {
    config: DeflateConfig,
}

impl PerMessageDeflate {
    /// Create the extension with the given local preferences
    pub fn new(config: DeflateConfig) -> Self {
        Self { config }
    }

    /// Local preferences
    pub fn config(&self) -> &DeflateConfig {
        &self.config
    }

    /// Server side: compute the response to a client offer
    pub fn negotiate_server(&self, requested: &[ExtensionParam]) -> Result<NegotiatedDeflate> {
        let mut agreed = NegotiatedDeflate {
            server_no_context_takeover: self.config.server_no_context_takeover,
            client_no_context_takeover: self.config.client_no_context_takeover,
            server_max_window_bits: self.config.server_max_window_bits,
            client_max_window_bits: MAX_WINDOW_BITS,
        };
        let mut client_window_supported = false;

        for param in requested {
            match param.name.as_str() {
                "server_no_context_takeover" => {
                    flag(param)?;
                    agreed.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    flag(param)?;
                    agreed.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let bits = parse_window_bits(param)?;
                    agreed.server_max_window_bits = agreed.server_max_window_bits.min(bits);
                }
                "client_max_window_bits" => {
                    client_window_supported = true;
                    if param.value.is_some() {
                        agreed.client_max_window_bits = parse_window_bits(param)?;
                    }
                }
                other => {
                    return Err(Error::handshake(
                        400,
                        format!("unknown permessage-deflate parameter {}", other),
                    ));
                }
            }
        }

        if agreed.server_max_window_bits < MIN_WINDOW_BITS {
            return Err(Error::handshake(400, "server_max_window_bits below 9"));
        }
        if client_window_supported {
            agreed.client_max_window_bits = agreed
                .client_max_window_bits
                .min(self.config.client_max_window_bits)
                .max(MIN_WINDOW_BITS);
        }
        Ok(agreed)
    }

    /// Client side: validate the server's response against our offer
    pub fn negotiate_client(&self, response: &[ExtensionParam]) -> Result<NegotiatedDeflate> {
        let mut agreed = NegotiatedDeflate::default();
        for param in response {
            match param.name.as_str() {
                "server_no_context_takeover" => {
                    flag(param)?;
                    agreed.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    flag(param)?;
                    agreed.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    agreed.server_max_window_bits = parse_window_bits(param)?;
                }
                "client_max_window_bits" => {
                    let bits = parse_window_bits(param)?;
                    if bits > self.config.client_max_window_bits {
                        return Err(Error::handshake(
                            400,
                            "server raised client_max_window_bits",
                        ));
                    }
                    agreed.client_max_window_bits = bits;
                }
                other => {
                    return Err(Error::handshake(
                        400,
                        format!("unknown permessage-deflate parameter {}", other),
                    ));
                }
            }
        }
        if self.config.client_no_context_takeover {
            agreed.client_no_context_takeover = true;
        }
        Ok(agreed)
    }

    fn install(&self, ctx: &mut ExtensionContext, agreed: &NegotiatedDeflate, client: bool) {
        let (own_bits, own_reset, peer_bits, peer_reset) = if client {
            (
                agreed.client_max_window_bits,
                agreed.client_no_context_takeover,
                agreed.server_max_window_bits,
                agreed.server_no_context_takeover,
            )
        } else {
            (
                agreed.server_max_window_bits,
                agreed.server_no_context_takeover,
                agreed.client_max_window_bits,
                agreed.client_no_context_takeover,
            )
        };
        ctx.insert(
            CONTEXT_KEY,
            DeflateState {
                encoder: DeflateEncoder::new(own_bits, own_reset, self.config.compression_level),
                decoder: DeflateDecoder::new(
                    peer_bits,
                    peer_reset,
                    self.config.max_inflated_frame_size,
                ),
                threshold: self.config.compression_threshold,
                inflating: false,
                deflating: false,
            },
        );
        tracing::debug!(?agreed, client, "permessage-deflate installed");
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn reserved_rsv(&self) -> u8 {
        RSV1
    }

    fn process_incoming(&self, ctx: &mut ExtensionContext, frame: &Frame) -> Result<Frame> {
        if frame.is_control() {
            return Ok(frame.clone());
        }
        let state = ctx
            .get_mut::<DeflateState>(CONTEXT_KEY)
            .ok_or_else(|| Error::extension(EXTENSION_NAME, "not negotiated"))?;

        if frame.opcode() != OpCode::Continuation {
            state.inflating = frame.rsv1();
        }
        if !state.inflating {
            return Ok(frame.clone());
        }

        let result = state.decoder.decompress(frame.payload(), frame.fin());
        if frame.fin() {
            state.inflating = false;
        }
        let inflated = result?;
        Ok(frame.to_builder().rsv1(false).payload(inflated).build())
    }

    fn process_outgoing(&self, ctx: &mut ExtensionContext, frame: &Frame) -> Result<Frame> {
        if frame.is_control() {
            return Ok(frame.clone());
        }
        let state = ctx
            .get_mut::<DeflateState>(CONTEXT_KEY)
            .ok_or_else(|| Error::extension(EXTENSION_NAME, "not negotiated"))?;

        let first = frame.opcode() != OpCode::Continuation;
        if first {
            // Fragmented messages are always compressed since their total size is unknown
            state.deflating = !frame.fin() || frame.payload().len() >= state.threshold;
        }
        if !state.deflating {
            return Ok(frame.clone());
        }

        let result = state.encoder.compress(frame.payload(), frame.fin());
        if frame.fin() {
            state.deflating = false;
        }
        let compressed = result?;
        Ok(frame.to_builder().rsv1(first).payload(compressed).build())
    }

    fn offer(&self) -> ExtensionOffer {
        let mut offer = ExtensionOffer::new(EXTENSION_NAME);
        if self.config.client_max_window_bits < MAX_WINDOW_BITS {
            offer = offer.with_param(ExtensionParam::new(
                "client_max_window_bits",
                self.config.client_max_window_bits.to_string(),
            ));
        } else {
            offer = offer.with_param(ExtensionParam::flag("client_max_window_bits"));
        }
        if self.config.server_max_window_bits < MAX_WINDOW_BITS {
            offer = offer.with_param(ExtensionParam::new(
                "server_max_window_bits",
                self.config.server_max_window_bits.to_string(),
            ));
        }
        if self.config.server_no_context_takeover {
            offer = offer.with_param(ExtensionParam::flag("server_no_context_takeover"));
        }
        if self.config.client_no_context_takeover {
            offer = offer.with_param(ExtensionParam::flag("client_no_context_takeover"));
        }
        offer
    }

    fn on_extension_negotiation(
        &self,
        ctx: &mut ExtensionContext,
        requested: &[ExtensionParam],
    ) -> Option<Vec<ExtensionParam>> {
        match self.negotiate_server(requested) {
            Ok(agreed) => {
                self.install(ctx, &agreed, false);
                Some(agreed.to_params())
            }
            Err(err) => {
                tracing::debug!(%err, "declining permessage-deflate offer");
                None
            }
        }
    }

    fn on_handshake_response(
        &self,
        ctx: &mut ExtensionContext,
        response: &[ExtensionParam],
    ) -> Result<()> {
        let agreed = self.negotiate_client(response)?;
        self.install(ctx, &agreed, true);
        Ok(())
    }

    fn destroy(&self, ctx: &mut ExtensionContext) {
        ctx.remove(CONTEXT_KEY);
    }
}
