//! Frame masking (RFC 6455 §5.3) and masking-key generation
//!
//! Masking is a plain XOR of every payload byte with `key[i % 4]`, so the
//! same call masks and unmasks. Keys come from a pluggable
//! [`MaskGenerator`]; the default draws from the OS RNG (`getrandom`
//! feature) and falls back to `fastrand` when only that feature is enabled.

use std::sync::Arc;

/// Apply a WebSocket mask in place
///
/// XORs `data` with the repeating 4-byte `mask`. Applying the same mask
/// twice restores the original bytes.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    let wide = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ wide;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Every full chunk covered a multiple of 4 bytes, so the tail restarts at key[0]
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Apply a mask starting `offset` bytes into the key stream
///
/// Used when a payload is unmasked in several pieces.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let offset = offset & 3;
    if offset == 0 {
        apply_mask(data, mask);
        return;
    }

    let rotated = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    apply_mask(data, rotated);
}

/// Source of masking keys for client frames
pub trait MaskGenerator: Send + Sync {
    /// Produce the next 4-byte masking key
    fn next_mask(&self) -> [u8; 4];
}

/// Shared handle to a masking-key generator
pub type SharedMaskGenerator = Arc<dyn MaskGenerator>;

/// Default generator backed by the crate's configured RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomMaskGenerator;

impl MaskGenerator for RandomMaskGenerator {
    #[inline]
    fn next_mask(&self) -> [u8; 4] {
        generate_mask()
    }
}

/// Generator that always returns the same key. Useful for deterministic tests
/// and for peers that must reproduce captured traffic.
#[derive(Debug, Clone, Copy)]
pub struct FixedMaskGenerator(pub [u8; 4]);

impl MaskGenerator for FixedMaskGenerator {
    fn next_mask(&self) -> [u8; 4] {
        self.0
    }
}

/// Default shared generator
pub fn default_mask_generator() -> SharedMaskGenerator {
    Arc::new(RandomMaskGenerator)
}

/// Generate a random masking key.
///
/// If both RNG features are enabled `getrandom` wins.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut buf = [0u8; 4];
    fill_random(&mut buf);
    buf
}

/// Fill `buf` with random bytes from the configured RNG
#[cfg(feature = "getrandom")]
pub fn fill_random(buf: &mut [u8]) {
    if let Err(err) = getrandom::getrandom(buf) {
        tracing::warn!(%err, "OS RNG unavailable, falling back to clock-seeded generator");
        fill_from_clock(buf);
    }
}

/// Fill `buf` with random bytes from the configured RNG
#[cfg(all(feature = "fastrand", not(feature = "getrandom")))]
pub fn fill_random(buf: &mut [u8]) {
    fastrand::fill(buf);
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom")))]
pub fn fill_random(_buf: &mut [u8]) {
    compile_error!("At least one RNG feature must be enabled: getrandom or fastrand");
}

#[cfg(feature = "getrandom")]
fn fill_from_clock(buf: &mut [u8]) {
    let mut seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;

    for chunk in buf.chunks_mut(8) {
        // xorshift64
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let bytes = seed.to_ne_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}
