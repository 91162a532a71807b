//! Static work partitioning for the photometry batch.
//!
//! The batch is a flat list of compute units. Units are split into one
//! contiguous range per worker, sized up front, and each worker writes into
//! its own disjoint output slice. Results land in fixed slots, so the output
//! is bit-identical for any worker count.

use std::ops::Range;

/// Split `n` units into `threads` contiguous ranges.
///
/// Every range gets `n / threads` units; the remainder is appended in full
/// to the last range. `threads` is clamped to at least 1.
pub fn partition(n: usize, threads: usize) -> Vec<Range<usize>> {
    let threads = threads.max(1);
    let base = n / threads;
    let mut ranges = Vec::with_capacity(threads);
    for worker in 0..threads {
        let start = worker * base;
        let end = if worker == threads - 1 {
            n
        } else {
            start + base
        };
        ranges.push(start..end);
    }
    ranges
}

/// Run `unit_fn` over every output slot, partitioned across `threads`
/// workers.
///
/// Each worker owns the disjoint sub-slice of `outputs` matching its range
/// and calls `unit_fn` with the global slot index. Workers share nothing
/// mutable, so results are deterministic regardless of `threads`.
pub fn run_partitioned<T, F>(outputs: &mut [T], threads: usize, unit_fn: F)
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let ranges = partition(outputs.len(), threads);

    std::thread::scope(|scope| {
        let mut rest = outputs;
        let mut offset = 0;
        for range in &ranges {
            let (slice, tail) = rest.split_at_mut(range.len());
            rest = tail;
            let start = offset;
            offset += range.len();
            let unit_fn = &unit_fn;
            scope.spawn(move || {
                for (local, slot) in slice.iter_mut().enumerate() {
                    *slot = unit_fn(start + local);
                }
            });
        }
    });
}
