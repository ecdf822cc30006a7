//! Error taxonomy for the shadow-fd engine.
//!
//! Mirrors the teacher's manual `Display`/`Error` style (see
//! `transport/shm/mod.rs::ShmError`) rather than `thiserror`/`anyhow`: no
//! macro-derived errors anywhere in this crate's ancestry, so we don't
//! introduce one here either.
//!
//! Four kinds, matching the design's error-handling section: an OS failure
//! (syscall returned an error), a codec failure (compress/decompress
//! rejected its input), an invariant violation (misaligned domain, bad diff
//! header, negative refcount, type mismatch), and an unrecoverable failure
//! (unknown fd type, a DMA-BUF unmap that can't be trusted anymore). None of
//! these ever unwind past `collect_update`/`apply_update`: those functions
//! log and move on, by design, so one broken fd never stops the others from
//! being forwarded.

use std::fmt;
use std::io;

/// Error produced by an internal operation of the shadow-fd engine.
#[derive(Debug)]
pub enum SfdError {
    /// A POSIX/OS call failed (`mmap`, `open`, `pipe`, `shm_open`, ...).
    Os { op: &'static str, source: io::Error },
    /// A compression or decompression codec rejected its input.
    Codec { op: &'static str, detail: String },
    /// A data-model invariant was violated (misaligned domain, bad diff
    /// header, negative refcount, category mismatch, oversized decode).
    Invariant { detail: String },
    /// A failure severe enough that the shadow fd is left permanently inert.
    Unrecoverable { detail: String },
}

impl SfdError {
    pub fn os(op: &'static str, source: io::Error) -> Self {
        Self::Os { op, source }
    }

    pub fn codec(op: &'static str, detail: impl Into<String>) -> Self {
        Self::Codec { op, detail: detail.into() }
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant { detail: detail.into() }
    }

    pub fn unrecoverable(detail: impl Into<String>) -> Self {
        Self::Unrecoverable { detail: detail.into() }
    }

    /// Log this error at the severity its kind calls for. Does not consume
    /// or alter control flow: callers decide what happens next.
    pub fn log(&self) {
        match self {
            Self::Os { op, source } => log::error!("{op}: OS failure: {source}"),
            Self::Codec { op, detail } => log::warn!("{op}: codec failure: {detail}"),
            Self::Invariant { detail } => log::error!("invariant violation: {detail}"),
            Self::Unrecoverable { detail } => log::error!("unrecoverable: {detail}"),
        }
    }
}

impl fmt::Display for SfdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os { op, source } => write!(f, "{op}: {source}"),
            Self::Codec { op, detail } => write!(f, "{op}: codec failure: {detail}"),
            Self::Invariant { detail } => write!(f, "invariant violation: {detail}"),
            Self::Unrecoverable { detail } => write!(f, "unrecoverable: {detail}"),
        }
    }
}

impl std::error::Error for SfdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SfdError>;
