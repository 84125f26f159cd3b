//! Raw call-stack collection.
//!
//! Everything here walks the frame-pointer chain: no unwind tables, no
//! allocation when the caller provides the buffer. That is what makes the
//! fault path usable from inside a signal handler.

use std::sync::OnceLock;

use tracing::warn;

/// Hard upper bound on frames any walk will collect.
pub const MAX_DEPTH: usize = 4096;

const WORD: usize = size_of::<usize>();

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> usize {
    let fp: usize;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    fp
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> usize {
    let fp: usize;
    unsafe {
        core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    fp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) fn read_frame_pointer() -> usize {
    0
}

/// Walks the chain rooted at `fp`, dropping the first `skip` return
/// addresses and writing the rest into `out`. With `bounds` set, every frame
/// record must lie inside `[lo, hi)` before it is dereferenced; that is how
/// the fault path walks a foreign stack without risking a second fault.
fn walk(mut fp: usize, skip: usize, out: &mut [usize], bounds: Option<(usize, usize)>) -> usize {
    let mut seen = 0usize;
    let mut count = 0usize;
    while count < out.len() && seen < MAX_DEPTH {
        if fp == 0 || fp % WORD != 0 {
            break;
        }
        if let Some((lo, hi)) = bounds
            && (fp < lo || fp.saturating_add(2 * WORD) > hi)
        {
            break;
        }
        // Frame record layout shared by x86_64 and aarch64:
        // [fp] = previous frame pointer, [fp + WORD] = return address.
        let next = unsafe { *(fp as *const usize) };
        let ret = unsafe { *((fp as *const usize).add(1)) };
        if ret == 0 {
            break;
        }
        if seen >= skip {
            out[count] = ret;
            count += 1;
        }
        seen += 1;
        // The chain must grow towards higher addresses; anything else is a
        // corrupt or foreign record.
        if next <= fp {
            break;
        }
        fp = next;
    }
    count
}

/// Walks a frame chain that does not belong to the current call stack, e.g.
/// the frame pointer recovered from a fault context. Allocation-free and
/// async-signal-safe; `bounds` should cover the stack the chain lives on.
pub fn walk_frame_chain(fp: usize, out: &mut [usize], bounds: Option<(usize, usize)>) -> usize {
    walk(fp, 0, out, bounds)
}

/// Collects return addresses of the current thread into `out` without
/// allocating. Frame 0 is this function's caller; `skip` drops frames from
/// there.
#[inline(never)]
pub fn collect_into(out: &mut [usize], skip: usize) -> usize {
    walk(read_frame_pointer(), skip, out, None)
}

/// Allocating variant of [`collect_into`], capped at `max_depth` frames.
#[inline(never)]
pub fn collect_return_addresses(skip: usize, max_depth: usize) -> Vec<usize> {
    let mut out = vec![0usize; max_depth.min(MAX_DEPTH)];
    let count = walk(read_frame_pointer(), skip, &mut out, None);
    out.truncate(count);
    out
}

#[inline(never)]
fn probe_inner(out: &mut [usize; 8]) -> usize {
    collect_into(out, 0)
}

#[inline(never)]
fn probe_outer(out: &mut [usize; 8]) -> usize {
    probe_inner(out)
}

/// Checks once per process whether the walk can see caller frames. Builds
/// that omit frame pointers stop the chain immediately; captures then come
/// back shallow or empty and we say so once instead of erroring on every
/// capture.
pub fn frame_pointers_usable() -> bool {
    static PROBE: OnceLock<bool> = OnceLock::new();
    *PROBE.get_or_init(|| {
        let mut out = [0usize; 8];
        let depth = probe_outer(&mut out);
        let usable = depth >= 2;
        if !usable {
            warn!(
                frames = depth,
                "frame-pointer walk cannot see caller frames; backtraces will be shallow or empty"
            );
        }
        usable
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn chain_inner() -> Vec<usize> {
        collect_return_addresses(0, 64)
    }

    #[inline(never)]
    fn chain_mid() -> Vec<usize> {
        chain_inner()
    }

    #[inline(never)]
    fn chain_outer() -> Vec<usize> {
        chain_mid()
    }

    #[test]
    fn collects_nested_callers() {
        let ips = chain_outer();
        assert!(
            ips.len() >= 3,
            "expected at least inner/mid/outer frames, got {}",
            ips.len()
        );
        assert!(ips.iter().all(|&ip| ip != 0));
    }

    #[test]
    fn skip_drops_innermost_frames() {
        let full = collect_return_addresses(0, 64);
        let skipped = collect_return_addresses(1, 64);
        assert_eq!(skipped.len(), full.len() - 1);
        assert_eq!(skipped.first(), full.get(1));
    }

    #[test]
    fn collect_into_is_bounded() {
        let mut out = [0usize; 2];
        let count = collect_into(&mut out, 0);
        assert_eq!(count, 2);
    }

    #[test]
    fn bounded_walk_follows_synthetic_chain() {
        // Two hand-built frame records: the first links to the second, the
        // second terminates the chain with a null back pointer.
        let mut arena = [0usize; 8];
        let base = arena.as_ptr() as usize;
        arena[0] = base + 4 * WORD;
        arena[1] = 0x1111;
        arena[4] = 0;
        arena[5] = 0x2222;

        let mut out = [0usize; 4];
        let count = walk_frame_chain(base, &mut out, Some((base, base + 8 * WORD)));
        assert_eq!(count, 2);
        assert_eq!(out[0], 0x1111);
        assert_eq!(out[1], 0x2222);
    }

    #[test]
    fn bounded_walk_stops_at_bounds() {
        let mut arena = [0usize; 4];
        let base = arena.as_ptr() as usize;
        // Points outside the window, so only the first record is read.
        arena[0] = base + 0x1000;
        arena[1] = 0x1111;

        let mut out = [0usize; 4];
        let count = walk_frame_chain(base, &mut out, Some((base, base + 4 * WORD)));
        assert_eq!(count, 1);
        assert_eq!(out[0], 0x1111);
    }

    #[test]
    fn misaligned_root_collects_nothing() {
        let mut out = [0usize; 4];
        assert_eq!(walk_frame_chain(0x1001, &mut out, Some((0x1000, 0x2000))), 0);
        assert_eq!(walk_frame_chain(0, &mut out, None), 0);
    }

    #[test]
    fn probe_reports_usable_chain() {
        // Test profiles keep frame pointers; the probe must agree.
        assert!(frame_pointers_usable());
    }
}
