//! Memory-budget driven block sizing.

use crate::prelude::*;

/// Smallest block size the occupied/virtual passes will iterate with.
pub const BLKMIN: usize = 4;

/// Half-open ranges `[p0, p1)` covering `[start, stop)` with at most `step` elements each.
///
/// ```norun
/// let ranges = prange(0, 10, 4).collect::<Vec<_>>();
/// assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);
/// ```
pub fn prange(start: usize, stop: usize, step: usize) -> impl Iterator<Item = (usize, usize)> {
    assert!(step > 0, "block size must be positive");
    (start..stop).step_by(step).map(move |p0| (p0, (p0 + step).min(stop)))
}

/// Resident memory of the current process in MB (10^6 bytes), the unit of `max_memory`.
///
/// Returns zero if the process cannot be inspected; block sizing then assumes the full budget is
/// available.
pub fn current_memory_mb() -> f64 {
    let sys_info = sysinfo::System::new_all();
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    match sys_info.process(pid) {
        Some(process) => process.memory() as f64 / 1.0e6,
        None => 0.0,
    }
}

/// Block size for a pass whose working set grows by `per_row_cost` f64 elements per row.
///
/// Never returns less than `minimum`; a budget already exhausted by the resident set degrades to
/// `minimum` instead of failing.
pub fn calc_blksize(max_memory: f64, per_row_cost: f64, minimum: usize) -> usize {
    let mem_avail = max_memory - current_memory_mb();
    blksize_from_avail(mem_avail, per_row_cost, minimum)
}

pub(crate) fn blksize_from_avail(mem_avail: f64, per_row_cost: f64, minimum: usize) -> usize {
    if mem_avail <= 0.0 || per_row_cost <= 0.0 {
        debug!("memory budget exhausted ({mem_avail:.1} MB available), block size clamped to {minimum}");
        return minimum.max(1);
    }
    let nrow = (mem_avail * 1.0e6 / 8.0 / per_row_cost).floor();
    // saturate instead of overflowing on tiny cost estimates
    let nrow = if nrow >= usize::MAX as f64 { usize::MAX } else { nrow as usize };
    nrow.max(minimum).max(1)
}

/// Block size of a pass: the forced `flags.blksize` if given, otherwise [`calc_blksize`] over
/// `flags.max_memory`.
pub fn resolve_blksize(flags: &GradFlags, per_row_cost: f64, minimum: usize) -> usize {
    match flags.blksize {
        Some(blksize) => blksize.max(1),
        None => calc_blksize(flags.max_memory, per_row_cost, minimum),
    }
}

/// Shell-granular blocking of the shell range `[start, stop)`.
///
/// Yields `(shl0, shl1, nao_in_block)`. Shells are grouped until adding the next one would
/// exceed `blksize` AO functions; a single shell larger than `blksize` forms its own block.
pub fn shell_prange(ao_loc: &[usize], start: usize, stop: usize, blksize: usize) -> Vec<(usize, usize, usize)> {
    assert!(stop < ao_loc.len(), "shell range {start}..{stop} exceeds basis with {} shells", ao_loc.len() - 1);
    let mut ranges = vec![];
    let mut ib0 = start;
    let mut nao_blk = 0;
    for ib in start..stop {
        let now = ao_loc[ib + 1] - ao_loc[ib];
        if nao_blk + now > blksize && nao_blk > 0 {
            ranges.push((ib0, ib, nao_blk));
            ib0 = ib;
            nao_blk = 0;
        }
        nao_blk += now;
    }
    if ib0 < stop {
        ranges.push((ib0, stop, nao_blk));
    }
    ranges
}
