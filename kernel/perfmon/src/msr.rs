//! Intel performance monitoring MSR addresses and bit layouts.
//!
//! See Intel SDM Vol 3, chapter 18 "Performance Monitoring". Only the MSRs
//! the subsystem actually programs are listed.

/// First programmable counter. The counter MSR addresses are contiguous from
/// here.
pub const IA32_PMC0: u32 = 0xc1;
/// First event select register. Contiguous from here.
pub const IA32_PERFEVTSEL0: u32 = 0x186;

pub const IA32_PERF_CAPABILITIES: u32 = 0x345;

pub const IA32_FIXED_CTR_CTRL: u32 = 0x38d;
/// First fixed counter. Contiguous from here.
pub const IA32_FIXED_CTR0: u32 = 0x309;

pub const IA32_PERF_GLOBAL_STATUS: u32 = 0x38e;
pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38f;
/// Writing a bit clears the corresponding `IA32_PERF_GLOBAL_STATUS` bit.
/// Named OVF_CTRL before perfmon version 4.
pub const IA32_PERF_GLOBAL_STATUS_RESET: u32 = 0x390;

pub const IA32_DEBUGCTL: u32 = 0x1d9;

// IA32_PERF_GLOBAL_CTRL

pub fn global_ctrl_pmc_en(counter: u32) -> u64 {
    1 << counter
}

pub fn global_ctrl_fixed_en(counter: u32) -> u64 {
    1 << (32 + counter)
}

// IA32_PERF_GLOBAL_STATUS and IA32_PERF_GLOBAL_STATUS_RESET

pub fn status_pmc_ovf(counter: u32) -> u64 {
    1 << counter
}

pub fn status_fixed_ovf(counter: u32) -> u64 {
    1 << (32 + counter)
}

pub const STATUS_TRACE_TOPA_PMI: u64 = 1 << 55;
pub const STATUS_LBR_FRZ: u64 = 1 << 58;
pub const STATUS_CTR_FRZ: u64 = 1 << 59;
pub const STATUS_UNCORE_OVF: u64 = 1 << 61;
pub const STATUS_DS_BUFFER_OVF: u64 = 1 << 62;
pub const STATUS_COND_CHGD: u64 = 1 << 63;

// IA32_FIXED_CTR_CTRL. Four bits per counter: a two-bit enable field
// (os/user), the any-thread bit and the interrupt-enable bit.

pub fn fixed_ctrl_en(counter: u32) -> u64 {
    0b0011 << (4 * counter)
}

pub fn fixed_ctrl_any(counter: u32) -> u64 {
    0b0100 << (4 * counter)
}

pub fn fixed_ctrl_pmi(counter: u32) -> u64 {
    0b1000 << (4 * counter)
}

// IA32_DEBUGCTL

pub const DEBUGCTL_FREEZE_PERFMON_ON_PMI: u64 = 1 << 12;

// IA32_PERFEVTSEL

pub const PERFEVTSEL_EVENT_SELECT: u64 = 0xff;
pub const PERFEVTSEL_UMASK: u64 = 0xff << 8;
pub const PERFEVTSEL_USR: u64 = 1 << 16;
pub const PERFEVTSEL_OS: u64 = 1 << 17;
pub const PERFEVTSEL_E: u64 = 1 << 18;
pub const PERFEVTSEL_PC: u64 = 1 << 19;
pub const PERFEVTSEL_INT: u64 = 1 << 20;
pub const PERFEVTSEL_ANY: u64 = 1 << 21;
pub const PERFEVTSEL_EN: u64 = 1 << 22;
pub const PERFEVTSEL_INV: u64 = 1 << 23;
pub const PERFEVTSEL_CMASK: u64 = 0xff << 24;

/// The event select bits a caller is allowed to set. Everything the
/// architecture defines for version 4; reserved bits are rejected.
pub const PERFEVTSEL_WRITABLE_BITS: u64 = PERFEVTSEL_EVENT_SELECT
    | PERFEVTSEL_UMASK
    | PERFEVTSEL_USR
    | PERFEVTSEL_OS
    | PERFEVTSEL_E
    | PERFEVTSEL_PC
    | PERFEVTSEL_INT
    | PERFEVTSEL_ANY
    | PERFEVTSEL_EN
    | PERFEVTSEL_INV
    | PERFEVTSEL_CMASK;
