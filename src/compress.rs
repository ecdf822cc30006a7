//! Pluggable compression for diff payloads and whole-buffer transfers.
//!
//! Three modes, matching `spec.md` §4.3: [`CompressionMode::None`] (a plain
//! copy, so callers never special-case "no compression" at call sites),
//! [`CompressionMode::Lz4`] (an LZ4 frame, via `lz4_flex`, the teacher's own
//! dependency), and [`CompressionMode::Zstd`] (level 5, via the `zstd`
//! crate — not part of the teacher's stack, pulled in from the pack because
//! nothing in the teacher covers it; see `DESIGN.md`).
//!
//! [`CompContext`] holds the per-worker-thread codec state that benefits
//! from reuse across calls (currently only the zstd bulk compressor/
//! decompressor, which own an internal context struct worth not
//! reallocating per call). One `CompContext` belongs to exactly one worker.

use crate::error::{Result, SfdError};

/// Which codec to use for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    #[cfg(feature = "lz4")]
    Lz4,
    #[cfg(feature = "zstd")]
    Zstd,
}

impl Default for CompressionMode {
    fn default() -> Self {
        #[cfg(feature = "zstd")]
        {
            CompressionMode::Zstd
        }
        #[cfg(all(not(feature = "zstd"), feature = "lz4"))]
        {
            CompressionMode::Lz4
        }
        #[cfg(all(not(feature = "zstd"), not(feature = "lz4")))]
        {
            CompressionMode::None
        }
    }
}

/// Fixed zstd compression level. Not exposed as a tunable: the teacher
/// doesn't expose per-call knobs for its own codecs either (see
/// `transport/shm/ring.rs`), and one level is enough for this engine's
/// traffic shape (small, frequent diffs rather than large one-shot blobs).
const ZSTD_LEVEL: i32 = 5;

/// Per-worker codec state, reused across many `compress`/`decompress` calls
/// to avoid re-initializing the zstd context every time.
pub struct CompContext {
    #[cfg(feature = "zstd")]
    zstd_compressor: zstd::bulk::Compressor<'static>,
    #[cfg(feature = "zstd")]
    zstd_decompressor: zstd::bulk::Decompressor<'static>,
}

impl CompContext {
    pub fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(feature = "zstd")]
            zstd_compressor: zstd::bulk::Compressor::new(ZSTD_LEVEL)
                .map_err(|e| SfdError::codec("zstd_compressor_new", e.to_string()))?,
            #[cfg(feature = "zstd")]
            zstd_decompressor: zstd::bulk::Decompressor::new()
                .map_err(|e| SfdError::codec("zstd_decompressor_new", e.to_string()))?,
        })
    }
}

impl Default for CompContext {
    /// Infallible fallback for contexts built eagerly (e.g. one per spawned
    /// worker thread at pool startup); falls back to an empty no-codec
    /// context if zstd initialization somehow fails, since `None` and `Lz4`
    /// never use this state.
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            #[cfg(feature = "zstd")]
            zstd_compressor: zstd::bulk::Compressor::new(ZSTD_LEVEL)
                .expect("zstd compressor with a fixed valid level cannot fail"),
            #[cfg(feature = "zstd")]
            zstd_decompressor: zstd::bulk::Decompressor::new()
                .expect("zstd decompressor with no options cannot fail"),
        })
    }
}

/// Upper bound on the compressed size of a `max_input`-byte payload under
/// `mode`. Deliberately conservative (input size plus a fixed slop term)
/// rather than calling into each crate's own bound function, since this
/// crate can't be built against the exact crate versions to confirm their
/// signatures; a generous static bound costs a little memory and nothing
/// else.
pub fn compress_bufsize(mode: CompressionMode, max_input: usize) -> usize {
    match mode {
        CompressionMode::None => max_input,
        #[cfg(feature = "lz4")]
        CompressionMode::Lz4 => max_input + max_input / 16 + 256,
        #[cfg(feature = "zstd")]
        CompressionMode::Zstd => max_input + max_input / 8 + 512,
    }
}

/// Compress `src` into `dst`, returning the number of bytes written.
/// Empty input always produces zero output, regardless of mode.
pub fn compress(ctx: &mut CompContext, mode: CompressionMode, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    if src.is_empty() {
        return Ok(0);
    }
    match mode {
        CompressionMode::None => {
            if dst.len() < src.len() {
                return Err(SfdError::invariant("compress: dst too small for None mode"));
            }
            dst[..src.len()].copy_from_slice(src);
            Ok(src.len())
        }
        #[cfg(feature = "lz4")]
        CompressionMode::Lz4 => {
            // lz4_flex's frame encoder owns its own internal buffering; we
            // reconstruct one per call rather than keep it in `ctx`, since
            // it only borrows the destination for its lifetime and there's
            // no meaningful state to amortize across calls the way zstd's
            // context has.
            use std::io::Write;
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(dst.len()));
            encoder
                .write_all(src)
                .map_err(|e| SfdError::codec("lz4_compress", e.to_string()))?;
            let encoded = encoder
                .finish()
                .map_err(|e| SfdError::codec("lz4_compress_finish", e.to_string()))?;
            if encoded.len() > dst.len() {
                return Err(SfdError::codec("lz4_compress", "output exceeds dst capacity"));
            }
            dst[..encoded.len()].copy_from_slice(&encoded);
            Ok(encoded.len())
        }
        #[cfg(feature = "zstd")]
        CompressionMode::Zstd => ctx
            .zstd_compressor
            .compress_to_buffer(src, dst)
            .map_err(|e| SfdError::codec("zstd_compress", e.to_string())),
    }
}

/// Decompress `src` into `dst`, returning the number of bytes written.
pub fn decompress(ctx: &mut CompContext, mode: CompressionMode, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    if src.is_empty() {
        return Ok(0);
    }
    match mode {
        CompressionMode::None => {
            if dst.len() < src.len() {
                return Err(SfdError::invariant("decompress: dst too small for None mode"));
            }
            dst[..src.len()].copy_from_slice(src);
            Ok(src.len())
        }
        #[cfg(feature = "lz4")]
        CompressionMode::Lz4 => {
            use std::io::Read;
            // FrameDecoder wants a Read sink rather than a fixed buffer;
            // read incrementally straight into dst.
            let mut decoder = lz4_flex::frame::FrameDecoder::new(src);
            let mut written = 0usize;
            loop {
                if written == dst.len() {
                    break;
                }
                let n = decoder
                    .read(&mut dst[written..])
                    .map_err(|e| SfdError::codec("lz4_decompress", e.to_string()))?;
                if n == 0 {
                    break;
                }
                written += n;
            }
            Ok(written)
        }
        #[cfg(feature = "zstd")]
        CompressionMode::Zstd => ctx
            .zstd_decompressor
            .decompress_to_buffer(src, dst)
            .map_err(|e| SfdError::codec("zstd_decompress", e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_mode_round_trips() {
        let mut ctx = CompContext::new().unwrap();
        let src = b"the quick brown fox jumps over the lazy dog";
        let mut comp = vec![0u8; compress_bufsize(CompressionMode::None, src.len())];
        let n = compress(&mut ctx, CompressionMode::None, src, &mut comp).unwrap();
        let mut out = vec![0u8; src.len()];
        let m = decompress(&mut ctx, CompressionMode::None, &comp[..n], &mut out).unwrap();
        assert_eq!(&out[..m], src);
    }

    #[test]
    fn empty_input_short_circuits() {
        let mut ctx = CompContext::new().unwrap();
        let mut dst = vec![0u8; 16];
        assert_eq!(compress(&mut ctx, CompressionMode::None, &[], &mut dst).unwrap(), 0);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_round_trips_compressible_data() {
        let mut ctx = CompContext::new().unwrap();
        let src = vec![7u8; 8192];
        let mut comp = vec![0u8; compress_bufsize(CompressionMode::Zstd, src.len())];
        let n = compress(&mut ctx, CompressionMode::Zstd, &src, &mut comp).unwrap();
        assert!(n < src.len());
        let mut out = vec![0u8; src.len()];
        let m = decompress(&mut ctx, CompressionMode::Zstd, &comp[..n], &mut out).unwrap();
        assert_eq!(&out[..m], &src[..]);
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn lz4_round_trips_compressible_data() {
        let mut ctx = CompContext::new().unwrap();
        let src = vec![3u8; 8192];
        let mut comp = vec![0u8; compress_bufsize(CompressionMode::Lz4, src.len())];
        let n = compress(&mut ctx, CompressionMode::Lz4, &src, &mut comp).unwrap();
        let mut out = vec![0u8; src.len()];
        let m = decompress(&mut ctx, CompressionMode::Lz4, &comp[..n], &mut out).unwrap();
        assert_eq!(&out[..m], &src[..]);
    }
}
