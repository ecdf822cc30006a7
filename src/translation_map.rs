//! The registry mapping local fds to shadow fds and back to their remote
//! ids, plus the reference-counting lifecycle that decides when a shadow
//! fd is destroyed.
//!
//! Grounded on the teacher's `slab/segment` bookkeeping
//! (`transport/shm/segment.rs` keeps a parallel `HashMap`-style registry
//! keyed by an opaque id); the same pattern applies here with two keys
//! instead of one, since a shadow fd must be looked up by either side of
//! the translation.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::error::{Result, SfdError};
use crate::shadow_fd::ShadowFd;
use crate::worker_pool::WorkerPool;

/// Owns every live shadow fd for one proxy connection, indexed both by the
/// local fd it mirrors and by the remote id the protocol uses to address
/// it.
pub struct TranslationMap {
    by_local_fd: HashMap<RawFd, i32>,
    by_remote_id: HashMap<i32, ShadowFd>,
    next_remote_id: i32,
    id_step: i32,
    pool: WorkerPool,
}

/// Which side of the connection this map mints ids for. Each side uses a
/// disjoint sign so ids minted independently by client and server can
/// never collide once combined on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl TranslationMap {
    pub fn new(worker_count: usize, side: Side) -> Self {
        let (next_remote_id, id_step) = match side {
            Side::Client => (1, 1),
            Side::Server => (-1, -1),
        };
        Self {
            by_local_fd: HashMap::new(),
            by_remote_id: HashMap::new(),
            next_remote_id,
            id_step,
            pool: WorkerPool::new(worker_count),
        }
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Borrow the worker pool and one shadow fd simultaneously. Splitting
    /// this out as one method (rather than two separate calls on `&mut
    /// self`) is what lets `planner::collect_update` dispatch a parallel
    /// FILE diff against `self.pool` while also holding a mutable borrow of
    /// the shadow fd being collected — the two fields are disjoint, but
    /// that's only visible to the borrow checker from inside this impl.
    pub fn worker_pool_and_shadow_mut(&mut self, remote_id: i32) -> (&WorkerPool, Option<&mut ShadowFd>) {
        (&self.pool, self.by_remote_id.get_mut(&remote_id))
    }

    /// Register a newly observed local fd, assigning it a fresh remote id.
    /// Fails if `local_fd` is already translated (`spec.md` invariant: a
    /// local fd maps to at most one shadow fd at a time).
    pub fn translate_local_fd(
        &mut self,
        local_fd: RawFd,
        build: impl FnOnce(i32) -> ShadowFd,
    ) -> Result<i32> {
        if self.by_local_fd.contains_key(&local_fd) {
            return Err(SfdError::invariant(format!(
                "translate_local_fd: local fd {local_fd} already translated"
            )));
        }
        let remote_id = self.next_remote_id;
        self.next_remote_id += self.id_step;
        let shadow = build(remote_id);
        self.by_local_fd.insert(local_fd, remote_id);
        self.by_remote_id.insert(remote_id, shadow);
        Ok(remote_id)
    }

    /// Register a shadow fd created on the receiving side of a transfer,
    /// keyed by the remote id the sender assigned to it. There is no local
    /// fd yet if this is a FILE/DMABUF transfer that hasn't been attached
    /// to shared memory.
    pub fn register_remote(&mut self, remote_id: i32, shadow: ShadowFd) -> Result<()> {
        if self.by_remote_id.contains_key(&remote_id) {
            return Err(SfdError::invariant(format!(
                "register_remote: remote id {remote_id} already registered"
            )));
        }
        if shadow.local_fd >= 0 {
            self.by_local_fd.insert(shadow.local_fd, remote_id);
        }
        self.by_remote_id.insert(remote_id, shadow);
        Ok(())
    }

    pub fn lookup_by_local_fd(&self, local_fd: RawFd) -> Option<&ShadowFd> {
        self.by_local_fd.get(&local_fd).and_then(|id| self.by_remote_id.get(id))
    }

    pub fn lookup_by_local_fd_mut(&mut self, local_fd: RawFd) -> Option<&mut ShadowFd> {
        let id = *self.by_local_fd.get(&local_fd)?;
        self.by_remote_id.get_mut(&id)
    }

    pub fn lookup_by_remote_id(&self, remote_id: i32) -> Option<&ShadowFd> {
        self.by_remote_id.get(&remote_id)
    }

    pub fn lookup_by_remote_id_mut(&mut self, remote_id: i32) -> Option<&mut ShadowFd> {
        self.by_remote_id.get_mut(&remote_id)
    }

    pub fn incref_protocol(&mut self, remote_id: i32) -> Result<()> {
        self.get_mut(remote_id)?.incref_protocol();
        Ok(())
    }

    pub fn decref_protocol(&mut self, remote_id: i32) -> Result<()> {
        self.get_mut(remote_id)?.decref_protocol();
        self.destroy_if_unreferenced(remote_id);
        Ok(())
    }

    pub fn incref_transfer(&mut self, remote_id: i32) -> Result<()> {
        self.get_mut(remote_id)?.incref_transfer();
        Ok(())
    }

    pub fn decref_transfer(&mut self, remote_id: i32) -> Result<()> {
        self.get_mut(remote_id)?.decref_transfer();
        self.destroy_if_unreferenced(remote_id);
        Ok(())
    }

    fn get_mut(&mut self, remote_id: i32) -> Result<&mut ShadowFd> {
        self.by_remote_id
            .get_mut(&remote_id)
            .ok_or_else(|| SfdError::invariant(format!("unknown remote id {remote_id}")))
    }

    /// Destroy the shadow fd for `remote_id` if both reference counts have
    /// dropped to zero and it was ever actually owned. Removing it from
    /// `by_local_fd` first, then `by_remote_id`, matches the destruction
    /// order `spec.md` §4.5 calls out: a lookup racing the destruction by
    /// local fd should never briefly see a remote-id entry with no local
    /// counterpart.
    pub fn destroy_if_unreferenced(&mut self, remote_id: i32) -> bool {
        let unreferenced = self
            .by_remote_id
            .get(&remote_id)
            .map(ShadowFd::is_unreferenced)
            .unwrap_or(false);
        if !unreferenced {
            return false;
        }
        let local_fd = self.by_remote_id.get(&remote_id).map(|s| s.local_fd);
        if let Some(local_fd) = local_fd {
            if local_fd >= 0 {
                self.by_local_fd.remove(&local_fd);
            }
        }
        self.by_remote_id.remove(&remote_id);
        true
    }

    pub fn len(&self) -> usize {
        self.by_remote_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_remote_id.is_empty()
    }
}
