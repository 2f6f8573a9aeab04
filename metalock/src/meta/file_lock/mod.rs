//! POSIX file lock model shared by every metadata backend.
//!
//! Two lock families live here:
//! - whole-file `flock(2)` locks: one [`FlockType`] per holder;
//! - `fcntl(2)` record locks: a sorted, disjoint list of [`PlockRecord`]s per holder.
//!
//! A holder is the `(sid, owner)` pair, see [`LockHolder`].
//!
//! Submodules:
//! - `codec`: the persisted record blob format
//! - `range`: split/merge algebra over one holder's records
//! - `conflict`: cross-holder conflict rules
pub mod codec;
pub mod conflict;
pub mod range;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a lock holder: the mount session plus the caller supplied owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockHolder {
    pub sid: u64,
    pub owner: u64,
}

impl LockHolder {
    pub fn new(sid: u64, owner: u64) -> Self {
        Self { sid, owner }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sid, self.owner)
    }
}

/// Requested or reported lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileLockType {
    Read,
    Write,
    UnLock,
}

/// Whole-file lock type as persisted in the flock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlockType {
    Read,
    Write,
}

impl FlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            FlockType::Read => "R",
            FlockType::Write => "W",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "R" => Some(FlockType::Read),
            "W" => Some(FlockType::Write),
            _ => None,
        }
    }
}

impl TryFrom<FileLockType> for FlockType {
    type Error = FileLockType;

    fn try_from(value: FileLockType) -> Result<Self, Self::Error> {
        match value {
            FileLockType::Read => Ok(FlockType::Read),
            FileLockType::Write => Ok(FlockType::Write),
            FileLockType::UnLock => Err(value),
        }
    }
}

impl From<FlockType> for FileLockType {
    fn from(value: FlockType) -> Self {
        match value {
            FlockType::Read => FileLockType::Read,
            FlockType::Write => FileLockType::Write,
        }
    }
}

/// Inclusive byte range. `end == u64::MAX` means "to end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileLockRange {
    pub start: u64,
    pub end: u64,
}

impl FileLockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn whole_file() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn overlaps(&self, other: &FileLockRange) -> bool {
        self.end >= other.start && self.start <= other.end
    }
}

/// One byte-range lock held by a holder.
///
/// `pid` is informational: it is reported back by `getlk` but never
/// consulted when deciding conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlockRecord {
    pub lock_type: FileLockType,
    pub pid: u32,
    pub start: u64,
    pub end: u64,
}

impl PlockRecord {
    pub fn new(lock_type: FileLockType, pid: u32, start: u64, end: u64) -> Self {
        Self {
            lock_type,
            pid,
            start,
            end,
        }
    }

    pub fn range(&self) -> FileLockRange {
        FileLockRange {
            start: self.start,
            end: self.end,
        }
    }
}

/// `getlk` input: "would this lock be granted to `owner`?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLockQuery {
    pub owner: u64,
    pub lock_type: FileLockType,
    pub range: FileLockRange,
}

/// `getlk` output: the first conflicting lock, or `UnLock` with a zeroed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLockInfo {
    pub lock_type: FileLockType,
    pub range: FileLockRange,
    pub pid: u32,
}

impl FileLockInfo {
    pub fn unlocked() -> Self {
        Self {
            lock_type: FileLockType::UnLock,
            range: FileLockRange { start: 0, end: 0 },
            pid: 0,
        }
    }
}

/// Whole-file lock as reported by `list_locks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlockInfo {
    pub holder: LockHolder,
    pub lock_type: FlockType,
}

/// Record locks of one holder as reported by `list_locks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlockInfo {
    pub holder: LockHolder,
    pub records: Vec<PlockRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flock_type_text() {
        assert_eq!(FlockType::parse(FlockType::Read.as_str()), Some(FlockType::Read));
        assert_eq!(FlockType::parse("W "), Some(FlockType::Write));
        assert_eq!(FlockType::parse("X"), None);
        assert!(FlockType::try_from(FileLockType::UnLock).is_err());
    }

    #[test]
    fn test_range_overlap() {
        let a = FileLockRange::new(0, 99);
        assert!(a.overlaps(&FileLockRange::new(99, 200)));
        assert!(!a.overlaps(&FileLockRange::new(100, 200)));
        assert!(FileLockRange::whole_file().overlaps(&FileLockRange::new(u64::MAX, u64::MAX)));
        assert!(!FileLockRange::new(5, 4).is_valid());
    }
}
