//! The configuration and properties structures exchanged with the driver.

use bytemuck::{Pod, Zeroable};

use crate::{EventId, MAX_FIXED_COUNTERS, MAX_PROGRAMMABLE_COUNTERS};

/// Hardware capabilities reported to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PmuProperties {
    pub pm_version: u32,
    pub num_fixed_counters: u32,
    pub num_programmable_counters: u32,
    pub fixed_counter_width: u32,
    pub programmable_counter_width: u32,
    /// Bitmap of architectural events the hardware doesn't support.
    pub unsupported_events: u32,
    /// Raw `IA32_PERF_CAPABILITIES` value, or 0 if the MSR isn't present.
    pub perf_capabilities: u32,
    pub reserved: u32,
}

/// A full session configuration, staged by the driver before start.
///
/// The counter tables are parallel arrays indexed by counter slot. Used slots
/// are front-packed: the first slot with a zero id ends the used range, and
/// every later slot must be entirely zero. The kernel validates all of this
/// against the discovered hardware capabilities before touching any control
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PmuConfig {
    /// Staged `IA32_PERF_GLOBAL_CTRL` value.
    pub global_ctrl: u64,
    /// Staged `IA32_FIXED_CTR_CTRL` value.
    pub fixed_ctrl: u64,
    /// Staged `IA32_DEBUGCTL` value.
    pub debug_ctrl: u64,
    /// Counters start from these values, and are reset to them on overflow.
    pub fixed_initial_value: [u64; MAX_FIXED_COUNTERS],
    pub programmable_initial_value: [u64; MAX_PROGRAMMABLE_COUNTERS],
    /// `IA32_PERFEVTSEL` values for the programmable counters.
    pub programmable_events: [u64; MAX_PROGRAMMABLE_COUNTERS],
    /// [`CounterFlags`](crate::CounterFlags) bits per counter.
    pub fixed_flags: [u32; MAX_FIXED_COUNTERS],
    pub programmable_flags: [u32; MAX_PROGRAMMABLE_COUNTERS],
    pub fixed_ids: [EventId; MAX_FIXED_COUNTERS],
    pub programmable_ids: [EventId; MAX_PROGRAMMABLE_COUNTERS],
    /// Id of the event serving as the shared timebase, or
    /// [`EventId::NONE`].
    pub timebase_id: EventId,
    pub reserved: [u16; 3],
}
