use core::arch::x86_64::{__cpuid_count, _rdtsc};

use bit_field::BitField;
use x86_64::registers::{control::Cr3, model_specific::Msr};

use super::{CpuidLeaf, Hardware};

// xAPIC mmio register offsets in bytes.
const XAPIC_EOI: usize = 0xb0;
const XAPIC_LVT_PERF: usize = 0x340;
/// Mask bit in the LVT registers.
const LVT_MASKED_BIT: usize = 16;

/// The hardware backend used when the subsystem runs in the kernel.
///
/// The embedding kernel constructs this at boot with its LAPIC window, its
/// CPU topology and its cross-CPU execution primitive.
pub struct RealHardware {
    num_cpus: u32,
    ticks_per_second: u64,
    lapic_base: *mut u32,
    current_cpu: fn() -> u32,
    run_on_all_cpus: fn(&(dyn Fn() + Sync)),
}

impl RealHardware {
    /// # Safety
    ///
    /// `lapic_base` must point to the xAPIC mmio window and must be mapped at
    /// the same address on every CPU. `run_on_all_cpus` must run the task on
    /// every CPU with interrupts disabled and return only after all CPUs have
    /// finished.
    pub unsafe fn new(
        num_cpus: u32,
        ticks_per_second: u64,
        lapic_base: *mut u32,
        current_cpu: fn() -> u32,
        run_on_all_cpus: fn(&(dyn Fn() + Sync)),
    ) -> Self {
        Self {
            num_cpus,
            ticks_per_second,
            lapic_base,
            current_cpu,
            run_on_all_cpus,
        }
    }

    fn lapic_register(&self, offset: usize) -> *mut u32 {
        self.lapic_base.wrapping_byte_add(offset)
    }

    fn set_pmi_masked(&self, masked: bool) {
        let register = self.lapic_register(XAPIC_LVT_PERF);
        unsafe {
            // SAFETY: The constructor's caller promised that the LAPIC
            // window is mapped.
            let mut value = register.read_volatile();
            value.set_bit(LVT_MASKED_BIT, masked);
            register.write_volatile(value);
        }
    }
}

// SAFETY: The LAPIC window is per-CPU state accessed through a shared
// mapping; the pointer itself can be used from any thread.
unsafe impl Send for RealHardware {}
unsafe impl Sync for RealHardware {}

impl Hardware for RealHardware {
    fn num_cpus(&self) -> u32 {
        self.num_cpus
    }

    fn current_cpu(&self) -> u32 {
        (self.current_cpu)()
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidLeaf {
        // SAFETY: CPUID is unconditionally available on x86-64.
        let result = unsafe { __cpuid_count(leaf, subleaf) };
        CpuidLeaf {
            eax: result.eax,
            ebx: result.ebx,
            ecx: result.ecx,
            edx: result.edx,
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        // SAFETY: The subsystem only reads performance monitoring MSRs whose
        // presence the capability probe established.
        unsafe { Msr::new(msr).read() }
    }

    fn write_msr(&self, msr: u32, value: u64) {
        let mut msr = Msr::new(msr);
        // SAFETY: All values written to control registers have been validated
        // against the writable-bit whitelists.
        unsafe { msr.write(value) }
    }

    fn rdtsc(&self) -> u64 {
        // SAFETY: RDTSC is unconditionally available on x86-64.
        unsafe { _rdtsc() }
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    fn current_aspace(&self) -> u64 {
        let (frame, _) = Cr3::read_raw();
        frame.start_address().as_u64()
    }

    fn pmi_mask(&self) {
        self.set_pmi_masked(true);
    }

    fn pmi_unmask(&self) {
        self.set_pmi_masked(false);
    }

    fn issue_eoi(&self) {
        let register = self.lapic_register(XAPIC_EOI);
        unsafe {
            // SAFETY: The constructor's caller promised that the LAPIC
            // window is mapped.
            register.write_volatile(0);
        }
    }

    fn run_on_all_cpus(&self, task: &(dyn Fn() + Sync)) {
        (self.run_on_all_cpus)(task)
    }
}
