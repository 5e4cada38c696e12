//! One-shot discovery of the performance monitoring capabilities.
//!
//! Everything the validator later checks against comes from here: counter
//! counts and widths from CPUID leaf 0xa and the derived whitelists of
//! writable control register bits.

use bit_field::BitField;
use cpu_trace_types::{MAX_FIXED_COUNTERS, MAX_PROGRAMMABLE_COUNTERS};
use log::debug;

use crate::{hw::Hardware, msr};

/// We rely on the version 4 status/reset split and freeze semantics.
const MINIMUM_PERFMON_VERSION: u32 = 4;

const CPUID_FEATURE_INFO: u32 = 0x1;
const CPUID_PERFORMANCE_MONITORING: u32 = 0xa;
/// PDCM in CPUID.1:ECX, gates `IA32_PERF_CAPABILITIES`.
const FEATURE_PDCM_BIT: usize = 15;

/// Capabilities discovered at boot. Immutable afterwards.
pub(crate) struct PmuCaps {
    pub version: u32,
    pub num_programmable: u32,
    pub programmable_width: u32,
    pub max_programmable_value: u64,
    pub num_fixed: u32,
    pub fixed_width: u32,
    pub max_fixed_value: u64,
    pub unsupported_events: u32,
    pub perf_capabilities: u32,
    /// Enable bits for the present counters, the only legal
    /// `IA32_PERF_GLOBAL_CTRL` bits.
    pub global_ctrl_writable: u64,
    /// Enable/any/pmi bits for the present fixed counters.
    pub fixed_ctrl_writable: u64,
    pub debug_ctrl_writable: u64,
    /// Overflow status bits of all present counters.
    pub counter_status_bits: u64,
}

fn max_counter_value(width: u32) -> u64 {
    if width < 64 { (1 << width) - 1 } else { !0 }
}

/// Read the PMU capability leaf and derive the whitelists.
///
/// Returns `None` if the hardware is unusable, either because the version is
/// too old or because a reported count or width is out of range.
pub(crate) fn probe(hw: &impl Hardware) -> Option<PmuCaps> {
    let leaf = hw.cpuid(CPUID_PERFORMANCE_MONITORING, 0);

    let version = leaf.eax.get_bits(0..8);
    if version < MINIMUM_PERFMON_VERSION {
        debug!("perfmon: version {version} too old");
        return None;
    }

    let num_programmable = leaf.eax.get_bits(8..16);
    if num_programmable as usize > MAX_PROGRAMMABLE_COUNTERS {
        debug!("perfmon: unexpected num programmable counters {num_programmable} in cpuid.0AH");
        return None;
    }
    let programmable_width = leaf.eax.get_bits(16..24);
    // The <16 test is just something simple to ensure it's usable.
    if !(16..=64).contains(&programmable_width) {
        debug!("perfmon: unexpected programmable counter width {programmable_width} in cpuid.0AH");
        return None;
    }

    let ebx_length = leaf.eax.get_bits(24..32);
    if ebx_length > 7 {
        debug!("perfmon: unexpected value {ebx_length} in cpuid.0AH.EAX[31..24]");
        return None;
    }
    let unsupported_events = leaf.ebx & ((1 << ebx_length) - 1);

    let num_fixed = leaf.edx.get_bits(0..5);
    if num_fixed as usize > MAX_FIXED_COUNTERS {
        debug!("perfmon: unexpected num fixed counters {num_fixed} in cpuid.0AH");
        return None;
    }
    let fixed_width = leaf.edx.get_bits(5..13);
    if !(16..=64).contains(&fixed_width) {
        debug!("perfmon: unexpected fixed counter width {fixed_width} in cpuid.0AH");
        return None;
    }

    let pdcm = hw
        .cpuid(CPUID_FEATURE_INFO, 0)
        .ecx
        .get_bit(FEATURE_PDCM_BIT);
    let perf_capabilities = if pdcm {
        hw.read_msr(msr::IA32_PERF_CAPABILITIES) as u32
    } else {
        0
    };

    let mut counter_status_bits = 0;
    let mut global_ctrl_writable = 0;
    for i in 0..num_programmable {
        counter_status_bits |= msr::status_pmc_ovf(i);
        global_ctrl_writable |= msr::global_ctrl_pmc_en(i);
    }
    let mut fixed_ctrl_writable = 0;
    for i in 0..num_fixed {
        counter_status_bits |= msr::status_fixed_ovf(i);
        global_ctrl_writable |= msr::global_ctrl_fixed_en(i);
        fixed_ctrl_writable |=
            msr::fixed_ctrl_en(i) | msr::fixed_ctrl_any(i) | msr::fixed_ctrl_pmi(i);
    }

    let debug_ctrl_writable = if cfg!(feature = "freeze-on-pmi") {
        msr::DEBUGCTL_FREEZE_PERFMON_ON_PMI
    } else {
        0
    };

    Some(PmuCaps {
        version,
        num_programmable,
        programmable_width,
        max_programmable_value: max_counter_value(programmable_width),
        num_fixed,
        fixed_width,
        max_fixed_value: max_counter_value(fixed_width),
        unsupported_events,
        perf_capabilities,
        global_ctrl_writable,
        fixed_ctrl_writable,
        debug_ctrl_writable,
        counter_status_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockHardware;

    #[test]
    fn test_probe_skylake() {
        let caps = probe(&MockHardware::skylake(1)).unwrap();
        assert_eq!(caps.version, 4);
        assert_eq!(caps.num_programmable, 4);
        assert_eq!(caps.programmable_width, 48);
        assert_eq!(caps.max_programmable_value, (1 << 48) - 1);
        assert_eq!(caps.num_fixed, 3);
        assert_eq!(caps.max_fixed_value, (1 << 48) - 1);
        assert_eq!(caps.unsupported_events, 0);
        assert_eq!(caps.perf_capabilities, 0x33);
    }

    #[test]
    fn test_probe_derived_masks() {
        let caps = probe(&MockHardware::skylake(1)).unwrap();
        assert_eq!(caps.global_ctrl_writable, 0xf | (0b111 << 32));
        assert_eq!(caps.counter_status_bits, 0xf | (0b111 << 32));
        assert_eq!(caps.fixed_ctrl_writable, 0xfff);
        if cfg!(feature = "freeze-on-pmi") {
            assert_eq!(caps.debug_ctrl_writable, msr::DEBUGCTL_FREEZE_PERFMON_ON_PMI);
        } else {
            assert_eq!(caps.debug_ctrl_writable, 0);
        }
    }

    #[test]
    fn test_probe_rejects_old_version() {
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_0a.eax = (hw.cpuid_0a.eax & !0xff) | 3;
        assert!(probe(&hw).is_none());
    }

    #[test]
    fn test_probe_rejects_absurd_leaf_values() {
        // Counter width below 16.
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_0a.eax = 4 | (4 << 8) | (8 << 16) | (7 << 24);
        assert!(probe(&hw).is_none());

        // Too many programmable counters.
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_0a.eax = 4 | (200 << 8) | (48 << 16) | (7 << 24);
        assert!(probe(&hw).is_none());

        // Event vector length out of range.
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_0a.eax = 4 | (4 << 8) | (48 << 16) | (9 << 24);
        assert!(probe(&hw).is_none());

        // Too many fixed counters.
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_0a.edx = 31 | (48 << 5);
        assert!(probe(&hw).is_none());
    }

    #[test]
    fn test_probe_full_width_counters() {
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_0a.eax = 4 | (4 << 8) | (64 << 16) | (7 << 24);
        let caps = probe(&hw).unwrap();
        assert_eq!(caps.max_programmable_value, !0);
    }

    #[test]
    fn test_probe_without_pdcm() {
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_01.ecx = 0;
        let caps = probe(&hw).unwrap();
        assert_eq!(caps.perf_capabilities, 0);
    }

    #[test]
    fn test_probe_masks_unsupported_events() {
        let mut hw = MockHardware::skylake(1);
        // Vector length 3, but more bits set in EBX.
        hw.cpuid_0a.eax = 4 | (4 << 8) | (48 << 16) | (3 << 24);
        hw.cpuid_0a.ebx = 0b1010_1010;
        let caps = probe(&hw).unwrap();
        assert_eq!(caps.unsupported_events, 0b010);
    }
}
