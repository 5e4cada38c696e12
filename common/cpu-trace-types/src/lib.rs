//! This crate contains the wire format shared between the kernel cpu-trace
//! core and the user-space driver: event ids, per-counter flags, the
//! configuration and properties structures, and the per-CPU trace buffer
//! layout.
//!
//! Everything in here is `repr(C)` and free of padding so that both sides can
//! treat the structures as plain bytes.
#![cfg_attr(not(test), no_std)]

use core::ops::Range;

use bit_field::BitField;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

pub mod config;
pub mod records;

/// Upper bound on fixed-function counter slots in the configuration.
pub const MAX_FIXED_COUNTERS: usize = 8;
/// Upper bound on programmable counter slots in the configuration.
pub const MAX_PROGRAMMABLE_COUNTERS: usize = 8;
/// Total counter slots. Used for the minimum trace buffer size.
pub const MAX_COUNTERS: usize = MAX_FIXED_COUNTERS + MAX_PROGRAMMABLE_COUNTERS;

/// An id the driver assigns to an event.
///
/// The kernel writes the id into every trace record emitted for the event,
/// but otherwise doesn't interpret it, with two exceptions: the id of a fixed
/// event selects the hardware fixed counter, and the id matching
/// [`config::PmuConfig::timebase_id`] marks the timebase event.
///
/// The group lives in bits 15..10, the event number in bits 9..0. Id 0 marks
/// an unused counter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct EventId(u16);

impl EventId {
    pub const NONE: Self = Self(0);

    const EVENT_BITS: Range<usize> = 0..10;
    const GROUP_BITS: Range<usize> = 10..16;

    /// Fixed-function counter events.
    pub const GROUP_FIXED: u16 = 1;
    /// Architectural events counted on programmable counters.
    pub const GROUP_ARCH: u16 = 2;
    /// Model-specific events counted on programmable counters.
    pub const GROUP_MODEL: u16 = 3;
    /// Miscellaneous events.
    pub const GROUP_MISC: u16 = 4;

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u16 {
        self.0
    }

    pub fn new(group: u16, event: u16) -> Self {
        let mut raw = 0u16;
        raw.set_bits(Self::EVENT_BITS, event);
        raw.set_bits(Self::GROUP_BITS, group);
        Self(raw)
    }

    pub fn group(self) -> u16 {
        self.0.get_bits(Self::GROUP_BITS)
    }

    pub fn event(self) -> u16 {
        self.0.get_bits(Self::EVENT_BITS)
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Instructions retired, fixed counter 0.
pub const FIXED_INSTRUCTIONS_RETIRED: EventId = EventId((EventId::GROUP_FIXED << 10) | 1);
/// Unhalted core cycles, fixed counter 1.
pub const FIXED_UNHALTED_CORE_CYCLES: EventId = EventId((EventId::GROUP_FIXED << 10) | 2);
/// Unhalted reference cycles, fixed counter 2.
pub const FIXED_UNHALTED_REFERENCE_CYCLES: EventId = EventId((EventId::GROUP_FIXED << 10) | 3);

bitflags! {
    /// Per-counter configuration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CounterFlags: u32 {
        /// Emit a pc record instead of a tick record when the counter
        /// overflows.
        const PC = 1 << 0;
        /// Don't arm the counter's interrupt. The counter is sampled whenever
        /// the timebase event fires.
        const TIMEBASE = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::EventId;

    #[test]
    fn test_event_id_encoding() {
        let id = EventId::new(EventId::GROUP_MODEL, 0x123);
        assert_eq!(id.group(), EventId::GROUP_MODEL);
        assert_eq!(id.event(), 0x123);
        assert_eq!(id.to_raw(), (3 << 10) | 0x123);
    }

    #[test]
    fn test_fixed_event_ids() {
        assert_eq!(super::FIXED_INSTRUCTIONS_RETIRED.group(), EventId::GROUP_FIXED);
        assert_eq!(super::FIXED_INSTRUCTIONS_RETIRED.event(), 1);
        assert_eq!(super::FIXED_UNHALTED_CORE_CYCLES.event(), 2);
        assert_eq!(super::FIXED_UNHALTED_REFERENCE_CYCLES.event(), 3);
    }

    #[test]
    fn test_none_is_unused() {
        assert!(EventId::NONE.is_none());
        assert!(!EventId::new(EventId::GROUP_FIXED, 1).is_none());
    }
}
