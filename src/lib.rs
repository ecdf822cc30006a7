//! Shadow-fd mirroring engine.
//!
//! This crate implements the data-plane side of a transparent protocol
//! proxy that passes file descriptors (shared-memory files, pipes,
//! DMA-BUFs) across a Unix-domain socket: when a client hands the proxy a
//! fd, the proxy creates a matching fd on the other side and keeps the two
//! in sync by periodically diffing the original against a mirror, sending
//! only the compressed bytes that changed.
//!
//! # Quick start
//!
//! ```no_run
//! use shadowfd::config::ProxyConfig;
//! use shadowfd::translation_map::{Side, TranslationMap};
//!
//! let config = ProxyConfig::builder().build();
//! let mut map = TranslationMap::new(config.worker_count(), Side::Client);
//! // ... translate fds as they arrive on the protocol socket, then each
//! // tick call `planner::collect_update` / `planner::apply_update`.
//! ```
//!
//! # Architecture
//!
//! ```text
//!        local fd                                   remote id
//!           |                                            |
//!           v                                            v
//!   +---------------+   collect_update   +------------------------+
//!   |  ShadowFd      | -----------------> |  Transfer (wire)       |
//!   |  (mirror, dmg) |   (diff+compress)  |  header + block bytes  |
//!   +---------------+                    +------------------------+
//!           ^                                            |
//!           |              apply_update                  |
//!           +---------------------------------------------
//! ```
//!
//! A [`translation_map::TranslationMap`] owns every live `ShadowFd` for one
//! connection and the [`worker_pool::WorkerPool`] that parallelizes the
//! diff+compress work across them. [`planner`] drives one synchronization
//! round; [`pipe_pump`] handles the PIPE category's nonblocking I/O
//! separately, since pipes move bytes directly rather than through the
//! diff codec.
//!
//! # Key types
//!
//! | Type | Role |
//! |---|---|
//! | [`shadow_fd::ShadowFd`] | One mirrored fd: category, refcounts, mirror/damage state |
//! | [`translation_map::TranslationMap`] | Registry of every live shadow fd, by local fd and remote id |
//! | [`damage::DamageRegion`] | What's changed since the last sync |
//! | [`diff::construct_diff`] / [`diff::apply_diff`] | The block-diff wire codec |
//! | [`compress::CompressionMode`] | None / LZ4 / Zstd payload compression |
//! | [`worker_pool::WorkerPool`] | Persistent threads for parallel diffing |
//! | [`transfer::Transfer`] | The wire record shipped per shadow fd per round |
//!
//! # Modules
//!
//! - [`config`] — tunables and the `ProxyConfig` builder
//! - [`error`] — the `SfdError` taxonomy
//! - [`damage`] — damage-region tracking
//! - [`diff`] — the block-diff codec
//! - [`compress`] — pluggable compression
//! - [`transfer`] — wire encoding for a round's payload
//! - [`dmabuf`] — the pluggable DMA-BUF import/map boundary
//! - [`shadow_fd`] — `ShadowFd`, `MmapHandle`, `GrowBuffer`
//! - [`worker_pool`] — the persistent diff/compress thread pool
//! - [`translation_map`] — the fd/remote-id registry and refcount lifecycle
//! - [`planner`] — `collect_update` / `apply_update`
//! - [`pipe_pump`] — nonblocking pipe I/O, integrated with `mio`

pub mod compress;
pub mod config;
pub mod damage;
pub mod diff;
pub mod dmabuf;
pub mod error;
pub mod pipe_pump;
pub mod planner;
pub mod shadow_fd;
pub mod transfer;
pub mod translation_map;
pub mod worker_pool;

pub use error::{Result, SfdError};
