//! Block-granular binary diff codec.
//!
//! The format is a stream of `(header, payload)` pairs, each header packing
//! a half-open block range `[nfrom, nto)` into one 64-bit little-endian
//! word (`nfrom` in the high 32 bits, `nto` in the low 32 bits), followed
//! by exactly `nto - nfrom` 8-byte payload blocks holding the new contents.
//! The stream is self-delimiting given its total length: once fewer than 8
//! bytes remain, whatever is left (0 to 7 bytes) is a literal replacement
//! for the buffer's final unaligned tail, present only when that tail
//! actually changed.
//!
//! Two entry points: [`construct_diff`] builds a diff between `base` and
//! `changed`, and simultaneously advances `base` in place to match
//! `changed` (within the scanned domain) so the mirror stays current
//! without a second pass. [`apply_diff`] is its inverse, applied to the
//! peer's copy of `base`.

use crate::damage::DamageRegion;
use crate::error::{Result, SfdError};

/// Diff granularity, in bytes. Re-exported from [`crate::config`] for
/// convenience since this module is the one place it really matters.
pub use crate::config::BLOCK_SIZE;

/// Tolerance for fragmenting a single edit into many small headers: a run
/// keeps absorbing up to this many consecutive matching blocks as long as
/// there is a further mismatch within reach.
pub use crate::config::DIFF_WINDOW_BLOCKS as WINDOW;

/// Sentinel meaning "no restriction, carry on to the end of the buffer".
pub const COPY_DOMAIN_FULL: usize = usize::MAX;

/// Worst-case diff buffer capacity for a buffer of `size` bytes processed
/// by up to `worker_count` workers (one extra header's worth of slack per
/// worker, per the worker-disjointness contract in `spec.md` §4.2/§5).
pub fn max_diff_capacity(size: usize, worker_count: usize) -> usize {
    size + BLOCK_SIZE * worker_count.max(1)
}

fn read_u64_le(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[..8].try_into().unwrap())
}

fn write_u64_le(buf: &mut [u8], value: u64) {
    buf[..8].copy_from_slice(&value.to_le_bytes());
}

fn block_eq(base: &[u8], changed: &[u8], block: usize) -> bool {
    let s = block * BLOCK_SIZE;
    base[s..s + BLOCK_SIZE] == changed[s..s + BLOCK_SIZE]
}

/// `[copy_domain_start, copy_domain_end)` restricted to bytes, converted to
/// a block-index range and clipped to `[0, nblocks)`. `copy_domain_end ==
/// COPY_DOMAIN_FULL` means "to the end of the buffer". Both ends must
/// already be block-aligned (the caller's responsibility per spec.md §4.2);
/// misalignment is tolerated by silently realigning outward, matching the
/// "copy-domain alignment" design note.
fn copy_domain_to_blocks(
    copy_domain: (usize, usize),
    nblocks: usize,
) -> (usize, usize) {
    let (start, end) = copy_domain;
    let lo = (start / BLOCK_SIZE).min(nblocks);
    let hi = if end == COPY_DOMAIN_FULL {
        nblocks
    } else {
        // Round up: tolerate a misaligned end by including its partial block.
        ((end + BLOCK_SIZE - 1) / BLOCK_SIZE).min(nblocks)
    };
    if hi < lo {
        (lo, lo)
    } else {
        (lo, hi)
    }
}

/// Build the diff between `base` and `changed` restricted to `damage`
/// intersected with `copy_domain`, writing it into `diff_out`. Mutates
/// `base` in place so it matches `changed` within the scanned domain.
/// Returns the number of bytes written to `diff_out`.
///
/// `base` and `changed` must be the same length. `copy_domain` must be
/// 8-aligned at both ends, or `(.., COPY_DOMAIN_FULL)` to mean "to the end".
pub fn construct_diff(
    base: &mut [u8],
    changed: &[u8],
    damage: &DamageRegion,
    copy_domain: (usize, usize),
    diff_out: &mut [u8],
) -> Result<usize> {
    if base.len() != changed.len() {
        return Err(SfdError::invariant("construct_diff: base/changed length mismatch"));
    }
    let size = base.len();
    let nblocks = size / BLOCK_SIZE;
    let (cd_lo, cd_hi) = copy_domain_to_blocks(copy_domain, nblocks);

    let mut pos = 0usize;
    if cd_hi > cd_lo {
        for (range_lo, range_hi) in damage.to_merged_ranges(size) {
            let block_lo = (range_lo / BLOCK_SIZE).max(cd_lo);
            let block_hi = ((range_hi + BLOCK_SIZE - 1) / BLOCK_SIZE).min(cd_hi);
            if block_hi <= block_lo {
                continue;
            }
            pos += scan_range(base, changed, block_lo, block_hi, &mut diff_out[pos..])?;
        }
    }

    // Trailing unaligned tail, only reachable if the copy domain actually
    // extends past the last full block.
    let domain_end = copy_domain.1;
    let covers_tail = domain_end == COPY_DOMAIN_FULL || domain_end > BLOCK_SIZE * nblocks;
    if covers_tail && size > BLOCK_SIZE * nblocks {
        let tail_start = BLOCK_SIZE * nblocks;
        let tail_in_damage = match damage {
            DamageRegion::Everything => true,
            DamageRegion::Intervals(_) => damage
                .to_merged_ranges(size)
                .iter()
                .any(|&(lo, hi)| lo < size && hi > tail_start),
        };
        if tail_in_damage && base[tail_start..] != changed[tail_start..] {
            let ntrailing = size - tail_start;
            if pos + ntrailing > diff_out.len() {
                return Err(SfdError::invariant("construct_diff: diff_out overflow on tail"));
            }
            diff_out[pos..pos + ntrailing].copy_from_slice(&changed[tail_start..]);
            base[tail_start..].copy_from_slice(&changed[tail_start..]);
            pos += ntrailing;
        }
    }

    Ok(pos)
}

/// Scan one block range `[block_lo, block_hi)`, emitting `(header, payload)`
/// runs into `out`, and returns bytes written.
fn scan_range(
    base: &mut [u8],
    changed: &[u8],
    block_lo: usize,
    block_hi: usize,
    out: &mut [u8],
) -> Result<usize> {
    let mut pos = 0usize;
    let mut i = block_lo;
    while i < block_hi {
        if block_eq(base, changed, i) {
            i += 1;
            continue;
        }
        let run_start = i;
        let mut last_diff = i;
        let mut j = i + 1;
        loop {
            if j >= block_hi {
                break;
            }
            if !block_eq(base, changed, j) {
                last_diff = j;
                j += 1;
                continue;
            }
            // Run of matches starting at j: tolerate up to WINDOW of them if
            // a further mismatch follows within reach.
            let match_start = j;
            let mut k = j;
            while k < block_hi && block_eq(base, changed, k) && (k - match_start) < WINDOW {
                k += 1;
            }
            if k < block_hi && !block_eq(base, changed, k) {
                last_diff = k;
                j = k + 1;
            } else {
                break;
            }
        }
        let run_end = last_diff + 1;

        let header = ((run_start as u64) << 32) | (run_end as u64);
        if pos + BLOCK_SIZE > out.len() {
            return Err(SfdError::invariant("construct_diff: diff_out overflow on header"));
        }
        write_u64_le(&mut out[pos..], header);
        pos += BLOCK_SIZE;

        let payload_bytes = (run_end - run_start) * BLOCK_SIZE;
        if pos + payload_bytes > out.len() {
            return Err(SfdError::invariant("construct_diff: diff_out overflow on payload"));
        }
        let src = &changed[run_start * BLOCK_SIZE..run_end * BLOCK_SIZE];
        out[pos..pos + payload_bytes].copy_from_slice(src);
        base[run_start * BLOCK_SIZE..run_end * BLOCK_SIZE].copy_from_slice(src);
        pos += payload_bytes;

        i = run_end;
    }
    Ok(pos)
}

/// Apply a diff produced by [`construct_diff`] to `base`, in place.
pub fn apply_diff(base: &mut [u8], diff: &[u8]) -> Result<()> {
    let nblocks = base.len() / BLOCK_SIZE;
    let mut pos = 0usize;
    while diff.len() - pos >= BLOCK_SIZE {
        let header = read_u64_le(&diff[pos..]);
        let nfrom = (header >> 32) as usize;
        let nto = (header & 0xffff_ffff) as usize;
        pos += BLOCK_SIZE;

        if nfrom >= nto || nto > nblocks {
            return Err(SfdError::invariant(format!(
                "apply_diff: bad header nfrom={nfrom} nto={nto} nblocks={nblocks}"
            )));
        }
        let payload_bytes = (nto - nfrom) * BLOCK_SIZE;
        if diff.len() - pos < payload_bytes {
            return Err(SfdError::invariant("apply_diff: payload exceeds remaining diff"));
        }
        base[nfrom * BLOCK_SIZE..nto * BLOCK_SIZE]
            .copy_from_slice(&diff[pos..pos + payload_bytes]);
        pos += payload_bytes;
    }

    let remaining = diff.len() - pos;
    if remaining > 0 {
        let tail_start = nblocks * BLOCK_SIZE;
        if remaining > base.len() - tail_start {
            return Err(SfdError::invariant("apply_diff: oversized trailing tail"));
        }
        base[tail_start..tail_start + remaining].copy_from_slice(&diff[pos..pos + remaining]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage::ExtInterval;

    fn mk(size: usize, fill: u8) -> Vec<u8> {
        vec![fill; size]
    }

    #[test]
    fn no_damage_produces_empty_diff() {
        let mut base = mk(64, 0);
        let changed = base.clone();
        let damage = DamageRegion::default();
        let mut out = vec![0u8; max_diff_capacity(64, 1)];
        let n = construct_diff(&mut base, &changed, &damage, (0, COPY_DOMAIN_FULL), &mut out)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn single_block_edit_round_trips() {
        let size = 4096;
        let mut base = mk(size, 0);
        let base_before = base.clone();
        let mut changed = base.clone();
        changed[800..808].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut damage = DamageRegion::default();
        damage.add(ExtInterval::contiguous(800, 8));

        let mut out = vec![0u8; max_diff_capacity(size, 1)];
        let n = construct_diff(&mut base, &changed, &damage, (0, COPY_DOMAIN_FULL), &mut out)
            .unwrap();

        // header (8 bytes, nfrom=100,nto=101) + one payload block.
        assert_eq!(n, 16);
        let header = read_u64_le(&out);
        assert_eq!(header >> 32, 100);
        assert_eq!(header & 0xffff_ffff, 101);

        // base mutated in place to match changed.
        assert_eq!(base, changed);

        let mut peer = base_before;
        apply_diff(&mut peer, &out[..n]).unwrap();
        assert_eq!(peer, changed);
    }

    #[test]
    fn gap_within_window_coalesces_into_one_header() {
        let size = 4096;
        let mut base = mk(size, 0);
        let mut changed = base.clone();
        changed[800..808].copy_from_slice(&[1; 8]);
        changed[816..824].copy_from_slice(&[2; 8]);

        let mut damage = DamageRegion::default();
        damage.add(ExtInterval::contiguous(800, 8));
        damage.add(ExtInterval::contiguous(816, 8));

        let mut out = vec![0u8; max_diff_capacity(size, 1)];
        let n = construct_diff(&mut base, &changed, &damage, (0, COPY_DOMAIN_FULL), &mut out)
            .unwrap();

        let header = read_u64_le(&out);
        assert_eq!(header >> 32, 100);
        assert_eq!(header & 0xffff_ffff, 103);
        // header + 3 payload blocks.
        assert_eq!(n, 8 + 3 * 8);
    }

    #[test]
    fn gap_beyond_window_splits_into_two_headers() {
        let size = 4096;
        let mut base = mk(size, 0);
        let mut changed = base.clone();
        // Blocks 100 and 106: a gap of 5 matching blocks (101..106),
        // exceeding the 4-block window.
        changed[800..808].copy_from_slice(&[1; 8]);
        changed[848..856].copy_from_slice(&[2; 8]);

        let mut damage = DamageRegion::Everything;
        let mut out = vec![0u8; max_diff_capacity(size, 1)];
        let n = construct_diff(&mut base, &changed, &damage, (0, COPY_DOMAIN_FULL), &mut out)
            .unwrap();
        assert_eq!(n, 16 + 16); // two independent (header, 1 block) runs
        damage.reset();
        let mut peer = mk(size, 0);
        apply_diff(&mut peer, &out[..n]).unwrap();
        assert_eq!(peer, changed);
    }

    #[test]
    fn trailing_unaligned_tail_is_literal() {
        let size = 13; // not a multiple of 8
        let mut base = mk(size, 0);
        let mut changed = base.clone();
        changed[8..13].copy_from_slice(&[9, 9, 9, 9, 9]);

        let damage = DamageRegion::Everything;
        let mut out = vec![0u8; max_diff_capacity(size, 1)];
        let n = construct_diff(&mut base, &changed, &damage, (0, COPY_DOMAIN_FULL), &mut out)
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out[..5], &changed[8..13]);

        let mut peer = mk(size, 0);
        apply_diff(&mut peer, &out[..n]).unwrap();
        assert_eq!(peer, changed);
    }

    #[test]
    fn unchanged_tail_emits_nothing() {
        let size = 13;
        let mut base = mk(size, 5);
        let changed = base.clone();
        let damage = DamageRegion::Everything;
        let mut out = vec![0u8; max_diff_capacity(size, 1)];
        let n = construct_diff(&mut base, &changed, &damage, (0, COPY_DOMAIN_FULL), &mut out)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn copy_domain_restricts_scan() {
        let size = 4096;
        let mut base = mk(size, 0);
        let mut changed = base.clone();
        changed[800..808].copy_from_slice(&[1; 8]); // block 100, inside [0, 2048)
        changed[3000..3008].copy_from_slice(&[2; 8]); // block 375, outside [0, 2048)

        let damage = DamageRegion::Everything;
        let mut out = vec![0u8; max_diff_capacity(size, 1)];
        let n = construct_diff(&mut base, &changed, &damage, (0, 2048), &mut out).unwrap();
        assert_eq!(n, 16);
        // Byte 3000 untouched by the restricted construct_diff call.
        assert_eq!(base[3000], 0);
    }

    #[test]
    fn invalid_header_is_invariant_error() {
        let mut base = mk(64, 0);
        let bad_header = (10u64 << 32) | 5; // nfrom >= nto
        let mut diff = vec![0u8; 8];
        write_u64_le(&mut diff, bad_header);
        let err = apply_diff(&mut base, &diff).unwrap_err();
        matches!(err, SfdError::Invariant { .. });
    }
}
