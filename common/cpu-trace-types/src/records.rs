//! The per-CPU trace buffer layout.
//!
//! A buffer starts with a [`BufferHeader`] followed by a stream of records.
//! Every record starts with a [`RecordHeader`]; the header's `kind` selects
//! the record body. All records are a multiple of 8 bytes so that records are
//! naturally aligned as long as the buffer itself is.

use bytemuck::{Pod, Zeroable};

use crate::EventId;

pub const BUFFER_VERSION: u16 = 1;

/// Value of [`BufferHeader::arch`] for x86-64 buffers.
pub const BUFFER_ARCH_X86_64: u16 = 1;

/// Set in [`BufferHeader::flags`] when the buffer filled up. Once set, no
/// more records are written until the next session start.
pub const BUFFER_FLAG_FULL: u32 = 1 << 0;

/// Header at offset 0 of every trace buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferHeader {
    pub version: u16,
    pub arch: u16,
    pub flags: u32,
    /// Frequency of the timestamp in record headers.
    pub ticks_per_second: u64,
    /// Byte offset of the first unused byte. Updated whenever records are
    /// written.
    pub capture_end: u64,
}

/// Discriminator for the record body following a [`RecordHeader`].
///
/// The numeric assignments are part of the wire format and stable across
/// versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Tick = 1,
    Value = 2,
    Pc = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RecordHeader {
    pub kind: u8,
    pub reserved_flags: u8,
    pub event_id: EventId,
    pub reserved: u32,
    /// Timestamp in cycles of a monotonic cycle counter.
    pub time: u64,
}

/// The counter overflowed. The count is implied by the counter's configured
/// initial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TickRecord {
    pub header: RecordHeader,
}

/// A sampled counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ValueRecord {
    pub header: RecordHeader,
    pub value: u64,
}

/// The counter overflowed and the interrupted instruction pointer was
/// captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PcRecord {
    pub header: RecordHeader,
    /// The page-table root the CPU was running with, identifying the address
    /// space `pc` belongs to.
    pub aspace: u64,
    pub pc: u64,
}
