//! A persistent thread pool for parallel diff-and-compress work.
//!
//! Grounded on the teacher's own wakeup protocol (`wake.rs`): rather than a
//! channel or semaphore per task, a generation counter (`task_id`) is
//! bumped under a `parking_lot::Mutex`, broadcast with a `Condvar`, and
//! each worker remembers the last generation it serviced (`last_task_id`)
//! so a wakeup that arrives before the worker finishes parking is never
//! lost. Workers are spawned once at pool construction and parked between
//! dispatches; there is no per-task thread spawn.
//!
//! A dispatch hands each worker a disjoint byte sub-range of a shared diff
//! buffer to write into, addressed through raw pointers rather than safe
//! borrows: the pool's threads are long-lived and outlive any single
//! dispatch's borrow, so the task data can't be expressed as a borrowed
//! reference with a lifetime tied to one `dispatch` call without making
//! every call `scope`-bound, which the teacher's own pool avoids for the
//! same reason (see `wake.rs`'s raw-pointer task slots).

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::compress::CompContext;
use crate::damage::DamageRegion;
use crate::error::Result;

/// One worker's slice of a diff dispatch: a block range of `base`/`changed`
/// to scan, and the sub-range of the output buffer to write into.
pub struct DiffTask {
    pub base_ptr: *mut u8,
    pub base_len: usize,
    pub changed_ptr: *const u8,
    pub changed_len: usize,
    pub damage: DamageRegion,
    pub copy_domain: (usize, usize),
    pub out_ptr: *mut u8,
    pub out_len: usize,
    /// Filled in by the worker once it completes.
    pub written: usize,
    pub error: Option<crate::error::SfdError>,
}

/// # Safety
/// Each dispatched `DiffTask`'s pointer ranges are disjoint from every
/// other task dispatched in the same round (the planner guarantees this
/// per `spec.md`'s worker-disjointness property), and the dispatching
/// thread blocks until all workers finish before the underlying memory is
/// touched again.
unsafe impl Send for DiffTask {}

struct Slot {
    task: Option<DiffTask>,
    done: bool,
}

struct Shared {
    mutex: Mutex<SharedState>,
    condvar: Condvar,
}

struct SharedState {
    /// Bumped once per dispatch round; workers compare against their own
    /// `last_task_id` to detect new work without missing a wakeup.
    task_id: u64,
    shutdown: bool,
    slots: Vec<Slot>,
}

/// A persistent pool of worker threads for parallel `construct_diff`
/// dispatch. One pool is shared by a whole `TranslationMap`.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    /// Worker index 0 always executes inline on the calling thread and
    /// never gets a spawned thread; `handles.len() == worker_count - 1`.
    worker_count: usize,
}

impl WorkerPool {
    /// Spawn `worker_count - 1` OS threads (index 0 runs inline at
    /// dispatch time). `worker_count == 1` spawns nothing.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let nslots = worker_count;
        let shared = Arc::new(Shared {
            mutex: Mutex::new(SharedState {
                task_id: 0,
                shutdown: false,
                slots: (0..nslots).map(|_| Slot { task: None, done: true }).collect(),
            }),
            condvar: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(worker_count.saturating_sub(1));
        for idx in 1..worker_count {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("shadowfd-worker-{idx}"))
                .spawn(move || worker_loop(shared, idx))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { shared, handles, worker_count }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Dispatch `tasks` (one per worker index, `tasks.len() <=
    /// worker_count`) and block until every one completes. Worker index 0's
    /// task, if present, runs inline on the calling thread rather than
    /// through the condvar protocol, since no wakeup is needed to run code
    /// that's already running.
    pub fn dispatch(&self, mut tasks: Vec<DiffTask>) -> Vec<DiffTask> {
        assert!(tasks.len() <= self.worker_count);

        let inline_task = if !tasks.is_empty() { Some(tasks.remove(0)) } else { None };
        let nspawned_tasks = tasks.len();

        {
            let mut state = self.shared.mutex.lock();
            state.task_id += 1;
            let mut tasks = tasks.into_iter();
            for (i, slot) in state.slots.iter_mut().enumerate().skip(1) {
                if i <= nspawned_tasks {
                    slot.task = tasks.next();
                    slot.done = false;
                } else {
                    slot.task = None;
                    slot.done = true;
                }
            }
            self.shared.condvar.notify_all();
        }

        let mut results = Vec::new();
        if let Some(mut task) = inline_task {
            run_diff_task(&mut task);
            results.push(task);
        }

        let mut state = self.shared.mutex.lock();
        loop {
            let pending = state.slots.iter().skip(1).any(|s| !s.done);
            if !pending {
                break;
            }
            self.shared.condvar.wait(&mut state);
        }
        for slot in state.slots.iter_mut().skip(1).take(nspawned_tasks) {
            if let Some(done_task) = slot.task.take() {
                results.push(done_task);
            }
        }
        results
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.mutex.lock();
            state.shutdown = true;
            state.task_id += 1;
        }
        self.shared.condvar.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, idx: usize) {
    let mut last_task_id = 0u64;
    loop {
        let mut task = {
            let mut state = shared.mutex.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if state.task_id != last_task_id && state.slots[idx].task.is_some() {
                    break;
                }
                if state.task_id != last_task_id {
                    // Woken for a round with nothing assigned to this slot.
                    last_task_id = state.task_id;
                    continue;
                }
                shared.condvar.wait(&mut state);
            }
            last_task_id = state.task_id;
            state.slots[idx].task.take().expect("slot marked ready but task missing")
        };

        run_diff_task(&mut task);

        let mut state = shared.mutex.lock();
        state.slots[idx].done = true;
        state.slots[idx].task = Some(task);
        drop(state);
        shared.condvar.notify_all();
    }
}

fn run_diff_task(task: &mut DiffTask) {
    // SAFETY: the pointer ranges in `task` were established by the
    // dispatcher to be disjoint from every other in-flight task and valid
    // for the duration of this call.
    let base = unsafe { std::slice::from_raw_parts_mut(task.base_ptr, task.base_len) };
    let changed = unsafe { std::slice::from_raw_parts(task.changed_ptr, task.changed_len) };
    let out = unsafe { std::slice::from_raw_parts_mut(task.out_ptr, task.out_len) };
    match crate::diff::construct_diff(base, changed, &task.damage, task.copy_domain, out) {
        Ok(n) => task.written = n,
        Err(e) => task.error = Some(e),
    }
}

/// Per-thread compression context, one per worker index including the
/// inline-executing index 0. Owned by whoever drives dispatch (typically
/// the `TranslationMap`), not by the pool itself, since compression needs
/// differ per call site.
pub fn new_comp_contexts(worker_count: usize) -> Result<Vec<CompContext>> {
    (0..worker_count).map(|_| CompContext::new()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_of_one_spawns_no_threads() {
        let pool = WorkerPool::new(1);
        assert_eq!(pool.worker_count(), 1);
        assert!(pool.handles.is_empty());
    }

    #[test]
    fn pool_shuts_down_cleanly() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.handles.len(), 2);
        drop(pool);
    }
}
