//! Split/merge algebra over one holder's record locks.
//!
//! Input and output are sorted by `start`, pairwise disjoint, and never hold
//! two contiguous records of the same type. A request always replaces
//! whatever the same holder had in its span, whatever the previous type was.

use super::{FileLockType, PlockRecord};

/// Apply `request` to `current` and return the new record set.
///
/// `FileLockType::UnLock` releases `[start, end]`; `Read`/`Write` release the
/// span first and then insert the request, merging it with same-type
/// neighbours. A record grown by such a merge carries the request's pid.
pub fn update_locks(current: Vec<PlockRecord>, request: PlockRecord) -> Vec<PlockRecord> {
    let mut out = Vec::with_capacity(current.len() + 2);
    for rec in current {
        if rec.end < request.start || rec.start > request.end {
            out.push(rec);
            continue;
        }
        // rec.start < request.start implies request.start > 0
        if rec.start < request.start {
            out.push(PlockRecord {
                end: request.start - 1,
                ..rec
            });
        }
        // rec.end > request.end implies request.end < u64::MAX
        if rec.end > request.end {
            out.push(PlockRecord {
                start: request.end + 1,
                ..rec
            });
        }
    }
    if request.lock_type != FileLockType::UnLock {
        out.push(request);
    }
    out.sort_by_key(|r| r.start);
    let mut merged = merge_adjacent(out);
    if request.lock_type != FileLockType::UnLock {
        if let Some(rec) = merged
            .iter_mut()
            .find(|r| r.start <= request.start && request.end <= r.end)
        {
            rec.pid = request.pid;
        }
    }
    merged
}

/// Merge contiguous records of equal type.
fn merge_adjacent(sorted: Vec<PlockRecord>) -> Vec<PlockRecord> {
    let mut out: Vec<PlockRecord> = Vec::with_capacity(sorted.len());
    for rec in sorted {
        match out.last_mut() {
            Some(last)
                if last.lock_type == rec.lock_type
                    && last.end.checked_add(1) == Some(rec.start) =>
            {
                last.end = rec.end;
            }
            _ => out.push(rec),
        }
    }
    out
}

/// True when `records` is sorted, disjoint and fully merged.
pub fn is_normalized(records: &[PlockRecord]) -> bool {
    records.iter().all(|r| r.start <= r.end && r.lock_type != FileLockType::UnLock)
        && records.windows(2).all(|w| {
            w[0].end < w[1].start
                && !(w[0].lock_type == w[1].lock_type && w[0].end + 1 == w[1].start)
        })
}
