//! Cross-holder conflict rules.
//!
//! Read/read never conflicts; anything involving a write conflicts when the
//! ranges intersect. Callers pass only *other* holders' locks, so a holder
//! never conflicts with itself. Scans are linear and any conflicting lock is
//! an acceptable answer, so the iteration order of the input does not matter.

use super::{FileLockRange, FileLockType, FlockType, PlockRecord};

/// Whether a request of `lock_type` over `range` conflicts with `held`.
pub fn conflicts_with(lock_type: FileLockType, range: &FileLockRange, held: &PlockRecord) -> bool {
    if lock_type == FileLockType::UnLock || held.lock_type == FileLockType::UnLock {
        return false;
    }
    (lock_type == FileLockType::Write || held.lock_type == FileLockType::Write)
        && range.overlaps(&held.range())
}

/// First record in `held` conflicting with the request, if any.
pub fn find_conflict<'a, I>(
    lock_type: FileLockType,
    range: &FileLockRange,
    held: I,
) -> Option<&'a PlockRecord>
where
    I: IntoIterator<Item = &'a PlockRecord>,
{
    held.into_iter()
        .find(|rec| conflicts_with(lock_type, range, rec))
}

/// Whole-file variant: the range is the whole file, so only the types matter.
///
/// `others` must not contain the requester's own lock.
pub fn flock_conflicts<I>(lock_type: FlockType, others: I) -> bool
where
    I: IntoIterator<Item = FlockType>,
{
    let mut others = others.into_iter();
    match lock_type {
        FlockType::Read => others.any(|t| t == FlockType::Write),
        FlockType::Write => others.next().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_read_never_conflicts() {
        let held = PlockRecord::new(FileLockType::Read, 1, 0, 99);
        assert!(!conflicts_with(FileLockType::Read, &FileLockRange::new(0, 99), &held));
    }

    #[test]
    fn test_write_overlap_conflicts() {
        let held = PlockRecord::new(FileLockType::Write, 1, 0, 99);
        assert!(conflicts_with(FileLockType::Write, &FileLockRange::new(50, 149), &held));
        assert!(conflicts_with(FileLockType::Read, &FileLockRange::new(99, 99), &held));
        assert!(!conflicts_with(FileLockType::Write, &FileLockRange::new(100, 149), &held));
    }

    #[test]
    fn test_find_conflict_any_order() {
        let held = vec![
            PlockRecord::new(FileLockType::Read, 1, 0, 9),
            PlockRecord::new(FileLockType::Write, 2, 20, 29),
        ];
        let range = FileLockRange::new(5, 25);
        let fwd = find_conflict(FileLockType::Read, &range, &held);
        let rev = find_conflict(FileLockType::Read, &range, held.iter().rev());
        assert_eq!(fwd.map(|r| r.pid), Some(2));
        assert_eq!(rev.map(|r| r.pid), Some(2));
        assert!(find_conflict(FileLockType::Write, &range, &held).is_some());
        assert!(find_conflict(FileLockType::Read, &FileLockRange::new(10, 19), &held).is_none());
    }

    #[test]
    fn test_flock_rules() {
        assert!(!flock_conflicts(FlockType::Read, [FlockType::Read, FlockType::Read]));
        assert!(flock_conflicts(FlockType::Read, [FlockType::Read, FlockType::Write]));
        assert!(flock_conflicts(FlockType::Write, [FlockType::Read]));
        assert!(!flock_conflicts(FlockType::Write, []));
    }
}
