//! A single shadow fd: the mirrored, diffable state kept for one file
//! descriptor that crossed the protocol boundary.
//!
//! `MmapHandle` follows the teacher's RAII-wrapped-mmap pattern exactly
//! (see `transport/shm/segment.rs::ShmSegment`): a thin owning wrapper
//! around a raw pointer and length, checked against `libc::MAP_FAILED` at
//! construction and unmapped in `Drop`, with `unsafe impl Send` justified
//! the same way theirs is — the pointer addresses process-shared memory
//! with no thread affinity, only single-writer-at-a-time access enforced
//! by this crate's own locking above it.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::damage::DamageRegion;
use crate::dmabuf::DmabufSliceData;
use crate::error::{Result, SfdError};

/// Which kind of resource a `ShadowFd` mirrors. Determines which of the
/// category-specific fields in `ShadowFd` are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdCategory {
    File,
    Pipe,
    Dmabuf,
}

/// An owning `mmap` region. Unmapped on drop.
pub struct MmapHandle {
    ptr: NonNull<u8>,
    len: usize,
}

/// # Safety
/// The mapping addresses shared memory with no thread affinity; callers
/// above this type are responsible for serializing concurrent access.
unsafe impl Send for MmapHandle {}

impl MmapHandle {
    /// Map `len` bytes of `fd` for shared read/write access starting at
    /// file offset 0.
    pub fn map(fd: RawFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(SfdError::invariant("MmapHandle::map: zero-length mapping"));
        }
        // SAFETY: fd and len are caller-supplied; mmap's return value is
        // checked against MAP_FAILED before being trusted as a pointer.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(SfdError::os("mmap", std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(raw as *mut u8)
            .ok_or_else(|| SfdError::invariant("mmap returned a null pointer"))?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len were validated at construction and the mapping
        // lives as long as self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see as_slice; &mut self guarantees exclusive access at
        // the Rust level, matching this crate's own external locking.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapHandle {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping created in `map`.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            log::error!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// A byte buffer that grows geometrically and never shrinks, for pipe I/O
/// where reuse across many small reads/writes matters more than returning
/// memory promptly.
#[derive(Debug, Default)]
pub struct GrowBuffer {
    data: Vec<u8>,
    /// Logical length currently holding live data; `data.len()` may exceed
    /// this once the buffer has grown past a previous high-water mark.
    len: usize,
}

impl GrowBuffer {
    pub fn with_floor(floor: usize) -> Self {
        Self { data: Vec::with_capacity(floor), len: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ensure at least `extra` bytes of spare capacity beyond the current
    /// logical length, doubling capacity as needed, then return that spare
    /// region as a mutable slice for the caller to fill (e.g. with `read`).
    pub fn reserve_tail(&mut self, extra: usize) -> &mut [u8] {
        let needed = self.len + extra;
        if self.data.len() < needed {
            let mut new_cap = self.data.len().max(1);
            while new_cap < needed {
                new_cap *= 2;
            }
            self.data.resize(new_cap, 0);
        }
        &mut self.data[self.len..self.len + extra]
    }

    /// Commit `n` bytes of a previously reserved tail as live data.
    pub fn commit(&mut self, n: usize) {
        self.len += n;
    }

    /// Drop the first `n` bytes of live data, shifting the remainder down.
    pub fn consume_front(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let dst = self.reserve_tail(bytes.len());
        dst.copy_from_slice(bytes);
        self.commit(bytes.len());
    }
}

/// Dual reference count lifecycle for a shadow fd (`spec.md` §4.5): a
/// shadow fd is kept alive while either count is nonzero, and destroyed
/// the instant both reach zero, provided it has ever been claimed by an
/// owner (`has_owner`). An fd translated but never attached to a message
/// still in flight is not destroyed prematurely by a transient zero.
#[derive(Debug, Default)]
pub struct RefCounts {
    pub protocol: i32,
    pub transfer: i32,
    pub has_owner: bool,
}

impl RefCounts {
    pub fn is_unreferenced(&self) -> bool {
        self.has_owner && self.protocol <= 0 && self.transfer <= 0
    }
}

/// FILE-category mirrored state: a local mapping, the mirror used to
/// compute diffs against, and accumulated damage.
///
/// `mirror` is `None` until the first `collect_update`/`apply_update` pass
/// populates it with the whole buffer; its presence is how a peer tells a
/// first (whole-contents) transfer apart from a later diff, since both ship
/// as an ordinary sequence of blocks (`spec.md` §9).
pub struct FileState {
    pub local_map: MmapHandle,
    pub mirror: Option<Vec<u8>>,
    pub damage: DamageRegion,
}

/// Which direction a PIPE shadow fd's locally-owned end faces, determined
/// from the registered fd's `O_ACCMODE` (`spec.md` §4.4). A receiver
/// creating a shadow fd from an incoming transfer flips this: the sender's
/// "app reads from its end" is the receiver's "app writes to its end".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    /// Input, read-only: the local app reads; this side's private fd is the
    /// write end fed from network data.
    Ir,
    /// Input, write-only: the local app writes; this side's private fd is
    /// the read end drained onto the network.
    Iw,
    /// Read-write: a `socketpair` fd, not a `pipe(2)` fd; both directions
    /// flow through the same private fd.
    Rw,
}

impl PipeKind {
    pub fn flipped(self) -> Self {
        match self {
            PipeKind::Ir => PipeKind::Iw,
            PipeKind::Iw => PipeKind::Ir,
            PipeKind::Rw => PipeKind::Rw,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            PipeKind::Ir => 0,
            PipeKind::Iw => 1,
            PipeKind::Rw => 2,
        }
    }

    pub(crate) fn from_u8(b: u8) -> Self {
        match b {
            1 => PipeKind::Iw,
            2 => PipeKind::Rw,
            _ => PipeKind::Ir,
        }
    }
}

/// PIPE-category state: nonblocking read/write ends and their staging
/// buffers.
pub struct PipeState {
    pub kind: PipeKind,
    pub read_fd: Option<RawFd>,
    pub write_fd: Option<RawFd>,
    pub recv_buf: GrowBuffer,
    pub send_buf: GrowBuffer,
    /// Set once this side's own end has closed (`read_readable_pipe` saw
    /// EOF draining it, or the owner closed it directly).
    pub pipe_lclosed: bool,
    /// Set once the peer's `apply_update` has told us, via `special.pipeclose`,
    /// that its own end closed.
    pub pipe_rclosed: bool,
    /// One-shot flag: true until the first `collect_update` pass announces
    /// this pipe's existence to the peer, even if it has no data yet
    /// (`spec.md` §4.6).
    pub pipe_onlyhere: bool,
    /// Transient poll-state set by `pipe_pump::mark_pipe_object_statuses`
    /// each time events are drained; not meaningful between poll calls.
    pub pipe_readable: bool,
    pub pipe_writable: bool,
}

/// DMABUF-category state: geometry plus the mirror used for diffing raw
/// pixel contents (video-encoded transfers bypass the mirror entirely).
///
/// `mirror` follows the same `None`-until-first-transfer convention as
/// `FileState::mirror`.
pub struct DmabufState {
    pub slice_data: DmabufSliceData,
    pub mirror: Option<Vec<u8>>,
    pub damage: DamageRegion,
}

pub enum CategoryState {
    File(FileState),
    Pipe(PipeState),
    Dmabuf(DmabufState),
}

/// A single shadow fd: the engine's per-resource unit of work.
pub struct ShadowFd {
    pub local_fd: RawFd,
    pub remote_id: i32,
    pub category: FdCategory,
    pub refcounts: RefCounts,
    pub state: CategoryState,
}

/// Initial refcounts for every freshly constructed shadow fd (`spec.md`
/// §4.4/§4.5): the allocation itself holds one transfer reference (it was
/// just built to go out on, or just arrived in, a transfer), no protocol
/// reference yet, and `has_owner` stays false until `incref_protocol` claims
/// it. Destroying an unclaimed sfd at a transient zero would be wrong — it
/// hasn't been handed to anything yet.
fn initial_refcounts() -> RefCounts {
    RefCounts { protocol: 0, transfer: 1, has_owner: false }
}

impl ShadowFd {
    pub fn new_file(local_fd: RawFd, remote_id: i32, local_map: MmapHandle) -> Self {
        Self {
            local_fd,
            remote_id,
            category: FdCategory::File,
            refcounts: initial_refcounts(),
            state: CategoryState::File(FileState { local_map, mirror: None, damage: DamageRegion::Everything }),
        }
    }

    pub fn new_pipe(
        local_fd: RawFd,
        remote_id: i32,
        kind: PipeKind,
        read_fd: Option<RawFd>,
        write_fd: Option<RawFd>,
    ) -> Self {
        Self {
            local_fd,
            remote_id,
            category: FdCategory::Pipe,
            refcounts: initial_refcounts(),
            state: CategoryState::Pipe(PipeState {
                kind,
                read_fd,
                write_fd,
                recv_buf: GrowBuffer::with_floor(crate::config::PIPE_RECV_INITIAL_CAPACITY),
                send_buf: GrowBuffer::with_floor(crate::config::PIPE_SEND_FLOOR),
                pipe_lclosed: false,
                pipe_rclosed: false,
                pipe_onlyhere: true,
                pipe_readable: false,
                pipe_writable: false,
            }),
        }
    }

    pub fn new_dmabuf(local_fd: RawFd, remote_id: i32, slice_data: DmabufSliceData) -> Self {
        Self {
            local_fd,
            remote_id,
            category: FdCategory::Dmabuf,
            refcounts: initial_refcounts(),
            state: CategoryState::Dmabuf(DmabufState { slice_data, mirror: None, damage: DamageRegion::Everything }),
        }
    }

    /// Claim ownership of this shadow fd on behalf of the protocol layer.
    /// The only way `has_owner` ever becomes true (`spec.md` §4.5): a sfd
    /// that nothing has claimed yet is kept alive even at zero refs.
    pub fn incref_protocol(&mut self) {
        self.refcounts.protocol += 1;
        self.refcounts.has_owner = true;
    }

    pub fn decref_protocol(&mut self) {
        self.refcounts.protocol -= 1;
    }

    pub fn incref_transfer(&mut self) {
        self.refcounts.transfer += 1;
    }

    pub fn decref_transfer(&mut self) {
        self.refcounts.transfer -= 1;
    }

    pub fn is_unreferenced(&self) -> bool {
        self.refcounts.is_unreferenced()
    }
}

impl Drop for ShadowFd {
    fn drop(&mut self) {
        if let CategoryState::Pipe(p) = &self.state {
            for fd in [p.read_fd, p.write_fd].into_iter().flatten() {
                // SAFETY: fd is owned exclusively by this shadow fd.
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_buffer_doubles_and_preserves_data() {
        let mut g = GrowBuffer::with_floor(4);
        g.append(b"hello");
        assert_eq!(g.as_slice(), b"hello");
        g.append(b" world");
        assert_eq!(g.as_slice(), b"hello world");
    }

    #[test]
    fn grow_buffer_consume_front_shifts_remainder() {
        let mut g = GrowBuffer::with_floor(4);
        g.append(b"abcdef");
        g.consume_front(3);
        assert_eq!(g.as_slice(), b"def");
    }

    #[test]
    fn refcounts_require_owner_before_unreferenced() {
        let mut rc = RefCounts::default();
        assert!(!rc.is_unreferenced());
        rc.protocol = 1;
        rc.transfer = 1;
        assert!(!rc.is_unreferenced());
        rc.protocol = 0;
        rc.transfer = 0;
        assert!(!rc.is_unreferenced(), "never owned, so a transient zero must not count");
        rc.has_owner = true;
        assert!(rc.is_unreferenced());
    }

    #[test]
    fn mmap_handle_rejects_zero_length() {
        assert!(MmapHandle::map(-1, 0).is_err());
    }

    #[test]
    fn new_pipe_starts_with_one_transfer_ref_and_no_owner() {
        let shadow = ShadowFd::new_pipe(-1, 1, PipeKind::Ir, None, None);
        assert_eq!(shadow.refcounts.transfer, 1);
        assert_eq!(shadow.refcounts.protocol, 0);
        assert!(!shadow.refcounts.has_owner);
        assert!(!shadow.is_unreferenced(), "not owned yet, even though transfer=1 > 0 anyway");
    }

    #[test]
    fn incref_protocol_is_the_only_thing_that_latches_has_owner() {
        let mut shadow = ShadowFd::new_pipe(-1, 1, PipeKind::Iw, None, None);
        assert!(!shadow.refcounts.has_owner);
        shadow.incref_protocol();
        assert!(shadow.refcounts.has_owner);
        assert_eq!(shadow.refcounts.protocol, 1);
    }

    #[test]
    fn pipe_kind_flip_swaps_ir_iw_and_fixes_rw() {
        assert_eq!(PipeKind::Ir.flipped(), PipeKind::Iw);
        assert_eq!(PipeKind::Iw.flipped(), PipeKind::Ir);
        assert_eq!(PipeKind::Rw.flipped(), PipeKind::Rw);
    }
}
