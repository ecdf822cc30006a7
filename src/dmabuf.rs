//! DMA-BUF (GPU buffer) support, kept behind a pluggable backend trait.
//!
//! This crate has no business linking against a specific GPU driver stack
//! (gbm, libdrm, vaapi), so `shadow_fd` depends only on the narrow
//! [`DmabufHandle`]/[`DmabufBackend`] seam defined here, the same way the
//! teacher isolates its transport-specific code behind `TransportSelection`
//! (see `transport/shm/policy.rs`) instead of calling into a concrete
//! transport directly.

use crate::error::{Result, SfdError};

/// Fixed-function video codec a DMA-BUF's contents may be encoded with,
/// when the buffer is being mirrored as compressed video rather than as
/// raw pixel diffs (`spec.md` §4.4, "Non-goals" scopes the encoder/decoder
/// implementations out, but the tag itself is part of the wire contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    None,
    H264,
    Vp9,
    Av1,
}

/// Per-plane layout of one DMA-BUF, as exported by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    pub offset: u32,
    pub stride: u32,
}

/// Format/geometry metadata carried on the wire for a DMA-BUF shadow fd.
/// Opaque to this crate beyond what's needed to size buffers and validate
/// a transfer is self-consistent; content semantics belong to the backend.
#[derive(Debug, Clone)]
pub struct DmabufSliceData {
    pub width: u32,
    pub height: u32,
    pub format_fourcc: u32,
    pub modifier: u64,
    pub planes: Vec<PlaneLayout>,
    pub codec: VideoCodec,
}

/// Fixed-size on-wire encoding of a [`DmabufSliceData`] header, prepended to
/// the first transfer of a newly observed DMA-BUF shadow fd so the peer can
/// allocate a matching buffer before any diff is meaningful (`spec.md` §4.6).
/// Stride/offset slots beyond `planes.len()` are zero-padded; `num_planes`
/// says how many are real.
pub const DMABUF_HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4 * 4 + 4 * 4 + 8 + 1;

const MAX_PLANES: usize = 4;

impl DmabufSliceData {
    pub fn nplanes(&self) -> usize {
        self.planes.len()
    }

    /// Encode this geometry as the fixed-size header prepended to a DMA-BUF
    /// shadow fd's first transfer.
    pub fn encode_header(&self) -> [u8; DMABUF_HEADER_LEN] {
        let mut buf = [0u8; DMABUF_HEADER_LEN];
        let mut pos = 0;
        let mut put_u32 = |buf: &mut [u8], v: u32| {
            buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
            pos += 4;
        };
        put_u32(&mut buf, self.width);
        put_u32(&mut buf, self.height);
        put_u32(&mut buf, self.format_fourcc);
        put_u32(&mut buf, self.planes.len() as u32);
        for i in 0..MAX_PLANES {
            put_u32(&mut buf, self.planes.get(i).map(|p| p.stride).unwrap_or(0));
        }
        for i in 0..MAX_PLANES {
            put_u32(&mut buf, self.planes.get(i).map(|p| p.offset).unwrap_or(0));
        }
        buf[pos..pos + 8].copy_from_slice(&self.modifier.to_le_bytes());
        pos += 8;
        buf[pos] = (self.codec != VideoCodec::None) as u8;
        buf
    }

    /// Decode a header from the front of `buf`, returning the value and the
    /// number of bytes consumed (always [`DMABUF_HEADER_LEN`] on success).
    /// `using_video` is a single bit on the wire, so a decoded header can
    /// only recover "some video codec" vs. `VideoCodec::None`, not which
    /// concrete codec — a real encoder trait would need to carry that
    /// separately, out of scope here.
    pub fn decode_header(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < DMABUF_HEADER_LEN {
            return Err(SfdError::invariant("dmabuf: header truncated"));
        }
        let rd = |b: &[u8]| u32::from_le_bytes(b[..4].try_into().unwrap());
        let mut pos = 0;
        let width = rd(&buf[pos..]);
        pos += 4;
        let height = rd(&buf[pos..]);
        pos += 4;
        let format_fourcc = rd(&buf[pos..]);
        pos += 4;
        let num_planes = (rd(&buf[pos..]) as usize).min(MAX_PLANES);
        pos += 4;
        let mut strides = [0u32; MAX_PLANES];
        for s in &mut strides {
            *s = rd(&buf[pos..]);
            pos += 4;
        }
        let mut offsets = [0u32; MAX_PLANES];
        for o in &mut offsets {
            *o = rd(&buf[pos..]);
            pos += 4;
        }
        let modifier = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let using_video = buf[pos] != 0;
        pos += 1;
        let planes = (0..num_planes).map(|i| PlaneLayout { offset: offsets[i], stride: strides[i] }).collect();
        let codec = if using_video { VideoCodec::H264 } else { VideoCodec::None };
        Ok((DmabufSliceData { width, height, format_fourcc, modifier, planes, codec }, pos))
    }
}

/// A mapped read-only view of a DMA-BUF's contents, valid for as long as
/// this handle lives. Dropped to unmap.
pub trait DmabufHandle: Send {
    /// The mapped byte contents, read-only. Backends that require an
    /// explicit begin/end-cpu-access fence do so inside this call and its
    /// `Drop`.
    fn as_bytes(&self) -> &[u8];

    fn slice_data(&self) -> &DmabufSliceData;
}

/// A mapped read-write view, used when applying a diff directly to a BO's
/// live contents. Dropped to unmap.
pub trait DmabufHandleMut: Send {
    fn as_bytes_mut(&mut self) -> &mut [u8];

    fn slice_data(&self) -> &DmabufSliceData;
}

/// Import/export boundary for DMA-BUF file descriptors. An implementation
/// wraps a concrete allocator (gbm, dumb-buffer, or a test double); this
/// crate only ever talks to this trait.
pub trait DmabufBackend: Send + Sync {
    /// Import a DMA-BUF fd and map it for CPU reads. The fd is borrowed for
    /// the duration of the call; ownership stays with the caller.
    fn import_and_map(
        &self,
        fd: std::os::unix::io::RawFd,
        slice_data: &DmabufSliceData,
    ) -> Result<Box<dyn DmabufHandle>>;

    /// Import and map the same DMA-BUF for writes, used by `apply_update`
    /// to patch a diff directly into an existing shadow fd's BO.
    fn import_and_map_mut(
        &self,
        fd: std::os::unix::io::RawFd,
        slice_data: &DmabufSliceData,
    ) -> Result<Box<dyn DmabufHandleMut>>;

    /// Allocate a brand-new DMA-BUF matching `slice_data`, filled with
    /// `contents`, and return its fd alongside a writable mapping of it
    /// (`spec.md` §4.7's create-from-update path for an unseen remote id).
    fn make_dmabuf(
        &self,
        slice_data: &DmabufSliceData,
        contents: &[u8],
    ) -> Result<(std::os::unix::io::RawFd, Box<dyn DmabufHandleMut>)>;

    /// Whether this backend can losslessly decode `codec`; used by
    /// `collect_update`/`apply_update` to decide whether a DMA-BUF transfer
    /// must fall back to `VideoCodec::None` (raw, diffable) for this peer.
    fn supports_codec(&self, codec: VideoCodec) -> bool;
}
