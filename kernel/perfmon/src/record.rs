//! Emitting trace records at a buffer cursor.
//!
//! These run in the PMI handler: no allocation, no blocking, just a store and
//! a cursor advance. The caller checks for space and keeps the cursor inside
//! the mapped buffer.

use core::mem::size_of;

use cpu_trace_types::{
    EventId,
    records::{PcRecord, RecordHeader, RecordKind, TickRecord, ValueRecord},
};

/// Size of the largest record. Used for worst-case space checks.
pub(crate) const MAX_RECORD_SIZE: usize = size_of::<PcRecord>();

fn header(kind: RecordKind, event_id: EventId, time: u64) -> RecordHeader {
    RecordHeader {
        kind: kind as u8,
        reserved_flags: 0,
        event_id,
        reserved: 0,
        time,
    }
}

/// Write a tick record at `next` and return the advanced cursor.
///
/// # Safety
///
/// `next` must be 8-byte aligned and point at [`size_of::<TickRecord>()`]
/// writable bytes.
pub(crate) unsafe fn write_tick(next: *mut u8, event_id: EventId, time: u64) -> *mut u8 {
    let record = TickRecord {
        header: header(RecordKind::Tick, event_id, time),
    };
    unsafe {
        next.cast::<TickRecord>().write(record);
        next.add(size_of::<TickRecord>())
    }
}

/// Write a value record at `next` and return the advanced cursor.
///
/// # Safety
///
/// `next` must be 8-byte aligned and point at [`size_of::<ValueRecord>()`]
/// writable bytes.
pub(crate) unsafe fn write_value(next: *mut u8, event_id: EventId, time: u64, value: u64) -> *mut u8 {
    let record = ValueRecord {
        header: header(RecordKind::Value, event_id, time),
        value,
    };
    unsafe {
        next.cast::<ValueRecord>().write(record);
        next.add(size_of::<ValueRecord>())
    }
}

/// Write a pc record at `next` and return the advanced cursor.
///
/// # Safety
///
/// `next` must be 8-byte aligned and point at [`size_of::<PcRecord>()`]
/// writable bytes.
pub(crate) unsafe fn write_pc(
    next: *mut u8,
    event_id: EventId,
    time: u64,
    aspace: u64,
    pc: u64,
) -> *mut u8 {
    let record = PcRecord {
        header: header(RecordKind::Pc, event_id, time),
        aspace,
        pc,
    };
    unsafe {
        next.cast::<PcRecord>().write(record);
        next.add(size_of::<PcRecord>())
    }
}
