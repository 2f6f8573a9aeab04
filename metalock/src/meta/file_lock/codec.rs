//! Persisted encoding of a holder's record locks.
//!
//! A blob is a plain concatenation of fixed-width records, big-endian:
//!
//! ```text
//! | type: u32 | pid: u32 | start: u64 | end: u64 |   (24 bytes)
//! ```
//!
//! Type codes are fixed (`0` read, `1` write) so that clients built for
//! different platforms agree on the stored bytes.

use bytes::{Buf, BufMut};

use super::{FileLockType, PlockRecord};
use crate::meta::store::MetaError;

pub const RECORD_SIZE: usize = 24;

const CODE_READ: u32 = 0;
const CODE_WRITE: u32 = 1;

fn type_code(lock_type: FileLockType) -> Result<u32, MetaError> {
    match lock_type {
        FileLockType::Read => Ok(CODE_READ),
        FileLockType::Write => Ok(CODE_WRITE),
        FileLockType::UnLock => Err(MetaError::InvalidArgument(
            "unlock record in persisted lock set".to_string(),
        )),
    }
}

/// Serialize records in the given order.
pub fn encode_records(records: &[PlockRecord]) -> Result<Vec<u8>, MetaError> {
    let mut buf = Vec::with_capacity(records.len() * RECORD_SIZE);
    for r in records {
        buf.put_u32(type_code(r.lock_type)?);
        buf.put_u32(r.pid);
        buf.put_u64(r.start);
        buf.put_u64(r.end);
    }
    Ok(buf)
}

/// Parse a blob written by [`encode_records`]. An empty blob is zero records.
pub fn decode_records(mut data: &[u8]) -> Result<Vec<PlockRecord>, MetaError> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(MetaError::CorruptedRecords { len: data.len() });
    }
    let total = data.len();
    let mut records = Vec::with_capacity(total / RECORD_SIZE);
    while data.has_remaining() {
        let lock_type = match data.get_u32() {
            CODE_READ => FileLockType::Read,
            CODE_WRITE => FileLockType::Write,
            _ => return Err(MetaError::CorruptedRecords { len: total }),
        };
        let pid = data.get_u32();
        let start = data.get_u64();
        let end = data.get_u64();
        records.push(PlockRecord {
            lock_type,
            pid,
            start,
            end,
        });
    }
    Ok(records)
}
