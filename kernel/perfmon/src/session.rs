//! The lifecycle controller.
//!
//! A single session moves through idle → configuring → configured → running
//! and back. All public operations serialize on one lock and run with
//! interrupts enabled; the per-CPU start/stop/reset work is pushed to every
//! CPU through the synchronous broadcast primitive.
//!
//! The PMI handler is the one reader that never takes the lock. The session
//! is published to it through the `active` flag: every store that sets up
//! buffers and staged state happens before the release-store of `true`, and
//! stop clears the flag with a release-store before it begins tearing
//! anything down.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    mem::size_of,
    sync::atomic::{AtomicBool, Ordering},
};

use cpu_trace_types::{
    config::{PmuConfig, PmuProperties},
    records::{BUFFER_FLAG_FULL, ValueRecord},
};
use log::{debug, trace};
use spin::mutex::SpinMutex as Mutex;

use crate::{
    buffer::{self, CpuData, MIN_BUFFER_SIZE, MemoryObject},
    config::{self, StagedConfig},
    error::{Result, ensure, err},
    hw::Hardware,
    msr,
    probe::{self, PmuCaps},
    record,
};

pub(crate) struct Session {
    /// `Some` once a configuration has been staged.
    pub(crate) config: Option<StagedConfig>,
    pub(crate) cpus: Box<[CpuData]>,
}

impl Session {
    fn new(num_cpus: u32) -> Result<Self> {
        let num_cpus = num_cpus as usize;
        let mut cpus = Vec::new();
        cpus.try_reserve_exact(num_cpus).map_err(|_| err!(NoMem))?;
        cpus.resize_with(num_cpus, CpuData::new);
        Ok(Self {
            config: None,
            cpus: cpus.into_boxed_slice(),
        })
    }
}

/// The performance monitoring subsystem.
///
/// Generic over the hardware backend so that tests can substitute recorded
/// MSR banks for the real machine.
pub struct PerfMon<H> {
    pub(crate) hw: H,
    pub(crate) caps: Option<PmuCaps>,
    /// The gate between the PMI handler and everything else. True only while
    /// every CPU's buffer is mapped and the counters are programmed.
    pub(crate) active: AtomicBool,
    /// The session slot, also serving as the lock all public operations hold
    /// for their entire duration. Never taken by the PMI handler.
    session: Mutex<Option<Box<Session>>>,
}

impl<H> PerfMon<H>
where
    H: Hardware,
{
    /// Probe the hardware and create the subsystem. If the hardware is
    /// unusable every operation returns `NotSupported`.
    pub fn new(hw: H) -> Self {
        let caps = probe::probe(&hw);
        Self {
            hw,
            caps,
            active: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub(crate) fn caps(&self) -> Result<&PmuCaps> {
        self.caps.as_ref().ok_or(err!(NotSupported))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Get the session from the PMI handler, without the lock.
    ///
    /// # Safety
    ///
    /// The caller must have observed `active` as true with acquire ordering
    /// during the current interrupt. The session is only created or destroyed
    /// while `active` is false, so the release-store publishing `true`
    /// guarantees a live session.
    pub(crate) unsafe fn active_session(&self) -> &Session {
        unsafe { (*self.session.as_mut_ptr()).as_deref().unwrap_unchecked() }
    }

    /// Report the hardware capabilities.
    pub fn get_properties(&self) -> Result<PmuProperties> {
        let caps = self.caps()?;
        let _guard = self.session.lock();
        Ok(PmuProperties {
            pm_version: caps.version,
            num_fixed_counters: caps.num_fixed,
            num_programmable_counters: caps.num_programmable,
            fixed_counter_width: caps.fixed_width,
            programmable_counter_width: caps.programmable_width,
            unsupported_events: caps.unsupported_events,
            perf_capabilities: caps.perf_capabilities,
            reserved: 0,
        })
    }

    /// Create the session.
    pub fn init(&self) -> Result<()> {
        self.caps()?;
        let mut session = self.session.lock();
        ensure!(!self.is_active(), BadState);
        ensure!(session.is_none(), BadState);
        *session = Some(Box::new(Session::new(self.hw.num_cpus())?));
        Ok(())
    }

    /// Assign a trace buffer to a CPU. The buffer is mapped when the session
    /// starts.
    pub fn assign_buffer(&self, cpu: u32, memobj: Arc<dyn MemoryObject>) -> Result<()> {
        self.caps()?;
        let mut guard = self.session.lock();
        ensure!(!self.is_active(), BadState);
        let session = guard.as_deref_mut().ok_or(err!(BadState))?;
        ensure!((cpu as usize) < session.cpus.len(), InvalidArgs);
        // A simple safe approximation of the minimum size needed.
        ensure!(memobj.size() >= MIN_BUFFER_SIZE, InvalidArgs);
        session.cpus[cpu as usize].assign(memobj);
        Ok(())
    }

    /// Validate a configuration and stage it for the next start. Replaces any
    /// previously staged configuration.
    pub fn stage_config(&self, config: &PmuConfig) -> Result<()> {
        let caps = self.caps()?;
        let mut guard = self.session.lock();
        ensure!(!self.is_active(), BadState);
        let session = guard.as_deref_mut().ok_or(err!(BadState))?;
        session.config = Some(config::validate(caps, config)?);
        Ok(())
    }

    /// Map the buffers and start counting on every CPU.
    pub fn start(&self) -> Result<()> {
        self.caps()?;
        let mut guard = self.session.lock();
        ensure!(!self.is_active(), BadState);
        let session = guard.as_deref_mut().ok_or(err!(BadState))?;
        let config = session.config.as_ref().ok_or(err!(BadState))?;
        ensure!(session.cpus.iter().all(CpuData::has_buffer), BadState);

        // Mapping is deferred until now so that the buffers are mapped into
        // the kernel only while they're actually needed.
        buffer::map_all(&mut session.cpus, self.hw.ticks_per_second())?;

        debug!(
            "enabling perfmon, {} fixed, {} programmable",
            config.fixed.len(),
            config.programmable.len()
        );
        self.hw.run_on_all_cpus(&|| self.start_cpu_task(config));

        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Runs on every CPU with interrupts disabled.
    fn start_cpu_task(&self, config: &StagedConfig) {
        for counter in &config.fixed {
            self.hw
                .write_msr(msr::IA32_FIXED_CTR0 + counter.hw_num, counter.initial_value);
        }
        self.hw.write_msr(msr::IA32_FIXED_CTR_CTRL, config.fixed_ctrl);

        for (i, counter) in config.programmable.iter().enumerate() {
            let i = i as u32;
            // PERFEVTSEL.EN must be off before the counter value is written,
            // even while global ctrl is off.
            self.hw.write_msr(msr::IA32_PERFEVTSEL0 + i, 0);
            self.hw.write_msr(msr::IA32_PMC0 + i, counter.initial_value);
            self.hw.write_msr(msr::IA32_PERFEVTSEL0 + i, counter.event_sel);
        }

        self.hw.write_msr(msr::IA32_DEBUGCTL, config.debug_ctrl);

        self.hw.pmi_unmask();

        // Enable the counters as late as possible so that this setup doesn't
        // contribute to the data.
        self.hw
            .write_msr(msr::IA32_PERF_GLOBAL_CTRL, config.global_ctrl);
    }

    /// Stop counting, write the final counter values and unmap the buffers.
    ///
    /// A no-op when the session isn't running.
    pub fn stop(&self) -> Result<()> {
        let caps = self.caps()?;
        let mut guard = self.session.lock();
        let session = guard.as_deref_mut().ok_or(err!(BadState))?;
        if !self.is_active() {
            return Ok(());
        }

        debug!("disabling perfmon");

        // Clear the flag before anything else so that in-flight PMIs on
        // other CPUs become no-ops before we touch the mappings.
        self.active.store(false, Ordering::Release);

        {
            let config = session.config.as_ref().ok_or(err!(BadState))?;
            let cpus = &session.cpus;
            self.hw
                .run_on_all_cpus(&|| self.stop_cpu_task(caps, cpus, config));
        }

        // Unmap only after everything is turned off so that we can't take
        // another PMI into an unmapped buffer.
        buffer::unmap_all(&mut session.cpus);
        Ok(())
    }

    /// Runs on every CPU with interrupts disabled.
    fn stop_cpu_task(&self, caps: &PmuCaps, cpus: &[CpuData], config: &StagedConfig) {
        // Disable all counters as quickly as possible.
        self.hw.write_msr(msr::IA32_PERF_GLOBAL_CTRL, 0);
        self.hw.pmi_mask();

        let cpu = self.hw.current_cpu();
        let data = &cpus[cpu as usize];
        let now = self.hw.rdtsc();

        // SAFETY: This CPU owns the window and interrupts are disabled, so
        // the PMI handler can't run under us.
        let window = unsafe { data.window_mut() };
        if window.is_mapped() {
            trace!("collecting last data for cpu {cpu}");

            // A counter that triggers interrupts is continually reset to its
            // initial value by the PMI handler, so the delta against the
            // initial value is what's left since the last record. Counters
            // that overflowed without interrupting wrapped at the counter
            // width; correct for one wrap, more than that is undetectable.
            for (i, counter) in config.programmable.iter().enumerate() {
                if !window.has_room(size_of::<ValueRecord>()) {
                    window.header_mut().flags |= BUFFER_FLAG_FULL;
                    break;
                }
                let raw = self.hw.read_msr(msr::IA32_PMC0 + i as u32);
                let value = counter_delta(raw, counter.initial_value, caps.max_programmable_value);
                window.next = unsafe { record::write_value(window.next, counter.id, now, value) };
            }
            for counter in &config.fixed {
                if !window.has_room(size_of::<ValueRecord>()) {
                    window.header_mut().flags |= BUFFER_FLAG_FULL;
                    break;
                }
                let raw = self.hw.read_msr(msr::IA32_FIXED_CTR0 + counter.hw_num);
                let value = counter_delta(raw, counter.initial_value, caps.max_fixed_value);
                window.next = unsafe { record::write_value(window.next, counter.id, now, value) };
            }

            window.update_capture_end();
            if window.header_mut().flags & BUFFER_FLAG_FULL != 0 {
                trace!("buffer overflow on cpu {cpu}");
            }
        }

        self.clear_overflow_indicators(caps);
    }

    /// Destroy the session and reset the hardware to its power-on state.
    ///
    /// A no-op when no session exists.
    pub fn fini(&self) -> Result<()> {
        let caps = self.caps()?;
        let mut guard = self.session.lock();
        ensure!(!self.is_active(), BadState);
        let Some(mut session) = guard.take() else {
            return Ok(());
        };

        self.hw.run_on_all_cpus(&|| self.reset_cpu_task(caps));
        buffer::unmap_all(&mut session.cpus);
        Ok(())
    }

    /// Runs on every CPU with interrupts disabled.
    fn reset_cpu_task(&self, caps: &PmuCaps) {
        self.hw.write_msr(msr::IA32_PERF_GLOBAL_CTRL, 0);
        self.hw.pmi_mask();
        self.clear_overflow_indicators(caps);

        self.hw.write_msr(msr::IA32_DEBUGCTL, 0);

        for i in 0..caps.num_programmable {
            self.hw.write_msr(msr::IA32_PERFEVTSEL0 + i, 0);
            self.hw.write_msr(msr::IA32_PMC0 + i, 0);
        }

        self.hw.write_msr(msr::IA32_FIXED_CTR_CTRL, 0);
        for i in 0..caps.num_fixed {
            self.hw.write_msr(msr::IA32_FIXED_CTR0 + i, 0);
        }
    }

    pub(crate) fn clear_overflow_indicators(&self, caps: &PmuCaps) {
        let bits = msr::STATUS_COND_CHGD
            | msr::STATUS_DS_BUFFER_OVF
            | msr::STATUS_UNCORE_OVF
            | caps.counter_status_bits;
        self.hw.write_msr(msr::IA32_PERF_GLOBAL_STATUS_RESET, bits);
    }
}

/// `value - initial`, correcting for one wrap at the counter width.
fn counter_delta(value: u64, initial: u64, max_value: u64) -> u64 {
    if value >= initial {
        value - initial
    } else {
        value + (max_value - initial + 1)
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;
    use cpu_trace_types::{EventId, FIXED_INSTRUCTIONS_RETIRED};

    use super::*;
    use crate::{
        ErrorKind,
        hw::mock::{MockHardware, MsrWrite, Record, TestMemObject},
    };

    fn perfmon(num_cpus: u32) -> PerfMon<MockHardware> {
        PerfMon::new(MockHardware::skylake(num_cpus))
    }

    /// One fixed counter (instructions retired) and one programmable counter
    /// (last-level cache misses), interrupts on both.
    fn valid_config() -> PmuConfig {
        let mut config = PmuConfig::zeroed();
        config.fixed_ids[0] = FIXED_INSTRUCTIONS_RETIRED;
        config.fixed_ctrl = msr::fixed_ctrl_en(0) | msr::fixed_ctrl_pmi(0);
        config.programmable_ids[0] = EventId::new(EventId::GROUP_ARCH, 5);
        config.programmable_events[0] = 0x2e
            | (0x41 << 8)
            | msr::PERFEVTSEL_USR
            | msr::PERFEVTSEL_OS
            | msr::PERFEVTSEL_INT
            | msr::PERFEVTSEL_EN;
        config.global_ctrl = msr::global_ctrl_pmc_en(0) | msr::global_ctrl_fixed_en(0);
        config
    }

    fn buffers(perfmon: &PerfMon<MockHardware>) -> Vec<Arc<TestMemObject>> {
        (0..perfmon.hw.num_cpus)
            .map(|cpu| {
                let memobj = TestMemObject::new(0x10000);
                perfmon.assign_buffer(cpu, memobj.clone()).unwrap();
                memobj
            })
            .collect()
    }

    #[test]
    fn test_properties() {
        let properties = perfmon(1).get_properties().unwrap();
        assert_eq!(properties.pm_version, 4);
        assert_eq!(properties.num_fixed_counters, 3);
        assert_eq!(properties.num_programmable_counters, 4);
        assert_eq!(properties.fixed_counter_width, 48);
        assert_eq!(properties.programmable_counter_width, 48);
        assert_eq!(properties.perf_capabilities, 0x33);
    }

    #[test]
    fn test_unsupported_hardware() {
        let mut hw = MockHardware::skylake(1);
        hw.cpuid_0a.eax = 3;
        let perfmon = PerfMon::new(hw);
        assert_eq!(
            perfmon.get_properties().unwrap_err().kind(),
            ErrorKind::NotSupported
        );
        assert_eq!(perfmon.init().unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(perfmon.start().unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(perfmon.stop().unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(perfmon.fini().unwrap_err().kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_full_lifecycle() {
        let perfmon = perfmon(2);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        buffers(&perfmon);
        perfmon.start().unwrap();
        assert!(perfmon.active.load(Ordering::Relaxed));
        perfmon.stop().unwrap();
        assert!(!perfmon.active.load(Ordering::Relaxed));
        perfmon.fini().unwrap();
    }

    #[test]
    fn test_lifecycle_violations() {
        let perfmon = perfmon(1);

        // Nothing but init and fini works without a session.
        assert_eq!(perfmon.start().unwrap_err().kind(), ErrorKind::BadState);
        assert_eq!(perfmon.stop().unwrap_err().kind(), ErrorKind::BadState);
        assert_eq!(
            perfmon.stage_config(&valid_config()).unwrap_err().kind(),
            ErrorKind::BadState
        );
        assert_eq!(
            perfmon
                .assign_buffer(0, TestMemObject::new(0x10000))
                .unwrap_err()
                .kind(),
            ErrorKind::BadState
        );
        perfmon.fini().unwrap();

        perfmon.init().unwrap();
        assert_eq!(perfmon.init().unwrap_err().kind(), ErrorKind::BadState);

        // Start without a staged config.
        buffers(&perfmon);
        assert_eq!(perfmon.start().unwrap_err().kind(), ErrorKind::BadState);
        // Stop without running is fine.
        perfmon.stop().unwrap();

        perfmon.stage_config(&valid_config()).unwrap();
        perfmon.start().unwrap();

        // Everything but stop is illegal while running.
        assert_eq!(perfmon.init().unwrap_err().kind(), ErrorKind::BadState);
        assert_eq!(
            perfmon.stage_config(&valid_config()).unwrap_err().kind(),
            ErrorKind::BadState
        );
        assert_eq!(
            perfmon
                .assign_buffer(0, TestMemObject::new(0x10000))
                .unwrap_err()
                .kind(),
            ErrorKind::BadState
        );
        assert_eq!(perfmon.start().unwrap_err().kind(), ErrorKind::BadState);
        assert_eq!(perfmon.fini().unwrap_err().kind(), ErrorKind::BadState);

        perfmon.stop().unwrap();
        perfmon.fini().unwrap();
    }

    #[test]
    fn test_start_requires_buffers_everywhere() {
        let perfmon = perfmon(2);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        perfmon
            .assign_buffer(0, TestMemObject::new(0x10000))
            .unwrap();
        assert_eq!(perfmon.start().unwrap_err().kind(), ErrorKind::BadState);
    }

    #[test]
    fn test_assign_buffer_validation() {
        let perfmon = perfmon(1);
        perfmon.init().unwrap();
        assert_eq!(
            perfmon
                .assign_buffer(1, TestMemObject::new(0x10000))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgs
        );
        assert_eq!(
            perfmon
                .assign_buffer(0, TestMemObject::new(MIN_BUFFER_SIZE - 1))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgs
        );
        perfmon
            .assign_buffer(0, TestMemObject::new(MIN_BUFFER_SIZE))
            .unwrap();
    }

    #[test]
    fn test_invalid_config_leaves_no_trace() {
        let perfmon = perfmon(1);
        perfmon.init().unwrap();

        let mut config = valid_config();
        config.global_ctrl |= 1 << 63;
        assert_eq!(
            perfmon.stage_config(&config).unwrap_err().kind(),
            ErrorKind::InvalidArgs
        );
        assert!(perfmon.hw.writes().is_empty());
        // Still unconfigured, so start refuses.
        buffers(&perfmon);
        assert_eq!(perfmon.start().unwrap_err().kind(), ErrorKind::BadState);
    }

    #[test]
    fn test_start_programs_msrs_in_order() {
        let perfmon = perfmon(1);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        buffers(&perfmon);
        perfmon.hw.clear_writes();
        perfmon.start().unwrap();

        let config = valid_config();
        let expected = [
            (msr::IA32_FIXED_CTR0, 0),
            (msr::IA32_FIXED_CTR_CTRL, config.fixed_ctrl),
            (msr::IA32_PERFEVTSEL0, 0),
            (msr::IA32_PMC0, 0),
            (msr::IA32_PERFEVTSEL0, config.programmable_events[0]),
            (msr::IA32_DEBUGCTL, config.debug_ctrl),
            (msr::IA32_PERF_GLOBAL_CTRL, config.global_ctrl),
        ];
        let writes: Vec<_> = perfmon
            .hw
            .writes()
            .iter()
            .map(|write| (write.msr, write.value))
            .collect();
        assert_eq!(writes, expected);
        assert!(!perfmon.hw.pmi_masked(0));
    }

    #[test]
    fn test_start_never_writes_non_writable_bits() {
        let perfmon = perfmon(1);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        buffers(&perfmon);
        perfmon.hw.clear_writes();
        perfmon.start().unwrap();

        let caps = perfmon.caps().unwrap();
        for MsrWrite { msr: reg, value, .. } in perfmon.hw.writes() {
            match reg {
                msr::IA32_PERF_GLOBAL_CTRL => {
                    assert_eq!(value & !caps.global_ctrl_writable, 0);
                }
                msr::IA32_FIXED_CTR_CTRL => {
                    assert_eq!(value & !caps.fixed_ctrl_writable, 0);
                }
                msr::IA32_DEBUGCTL => {
                    assert_eq!(value & !caps.debug_ctrl_writable, 0);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_stop_writes_final_values() {
        let perfmon = perfmon(2);
        perfmon.init().unwrap();
        let mut config = valid_config();
        config.programmable_initial_value[0] = 100;
        perfmon.stage_config(&config).unwrap();
        let memobjs = buffers(&perfmon);
        perfmon.start().unwrap();

        // Let the counters "count".
        perfmon.hw.set_msr(0, msr::IA32_PMC0, 150);
        perfmon.hw.set_msr(0, msr::IA32_FIXED_CTR0, 77);
        perfmon.hw.set_msr(1, msr::IA32_PMC0, 342);
        perfmon.hw.set_msr(1, msr::IA32_FIXED_CTR0, 0);

        perfmon.stop().unwrap();

        // One value record per used counter, programmable before fixed.
        let records = memobjs[0].records();
        assert_eq!(records.len(), 2);
        assert!(
            matches!(records[0], Record::Value { id, value, .. }
                if id == config.programmable_ids[0] && value == 50)
        );
        assert!(
            matches!(records[1], Record::Value { id, value, .. }
                if id == FIXED_INSTRUCTIONS_RETIRED && value == 77)
        );

        let records = memobjs[1].records();
        assert!(matches!(records[0], Record::Value { value: 242, .. }));
        assert!(matches!(records[1], Record::Value { value: 0, .. }));

        // The header records where the trace ends.
        let header = memobjs[0].header();
        assert_eq!(
            header.capture_end,
            (size_of::<cpu_trace_types::records::BufferHeader>() + 2 * size_of::<ValueRecord>())
                as u64
        );
        assert_eq!(header.flags, 0);

        // Counters were turned off and the PMI masked.
        assert_eq!(perfmon.hw.msr(0, msr::IA32_PERF_GLOBAL_CTRL), 0);
        assert!(perfmon.hw.pmi_masked(0));
        assert!(perfmon.hw.pmi_masked(1));
    }

    #[test]
    fn test_stop_applies_wrap_correction() {
        // A counter narrower than 64 bits that wrapped past its initial
        // value.
        let mut hw = MockHardware::skylake(1);
        // 32 bit wide programmable counters.
        hw.cpuid_0a.eax = 4 | (4 << 8) | (32 << 16) | (7 << 24);
        let perfmon = PerfMon::new(hw);
        perfmon.init().unwrap();

        let mut config = valid_config();
        config.fixed_ids[0] = EventId::NONE;
        config.fixed_ctrl = 0;
        config.global_ctrl = msr::global_ctrl_pmc_en(0);
        config.programmable_initial_value[0] = 0xffff_fff0;
        perfmon.stage_config(&config).unwrap();
        let memobjs = buffers(&perfmon);
        perfmon.start().unwrap();

        perfmon.hw.set_msr(0, msr::IA32_PMC0, 0x5);
        perfmon.stop().unwrap();

        let records = memobjs[0].records();
        assert!(matches!(records[0], Record::Value { value: 0x15, .. }));
    }

    #[test]
    fn test_double_stop_is_a_no_op() {
        let perfmon = perfmon(1);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        let memobjs = buffers(&perfmon);
        perfmon.start().unwrap();

        perfmon.stop().unwrap();
        let records = memobjs[0].records();
        perfmon.hw.clear_writes();

        perfmon.stop().unwrap();
        assert!(perfmon.hw.writes().is_empty());
        assert_eq!(memobjs[0].records(), records);

        perfmon.fini().unwrap();
    }

    #[test]
    fn test_restart_after_stop() {
        let perfmon = perfmon(1);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        let memobjs = buffers(&perfmon);
        perfmon.start().unwrap();
        perfmon.stop().unwrap();

        // The session stays configured; a second run starts from a fresh
        // buffer header.
        perfmon.start().unwrap();
        perfmon.stop().unwrap();
        assert_eq!(memobjs[0].records().len(), 2);
    }

    #[test]
    fn test_map_failure_rolls_back() {
        let perfmon = perfmon(2);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        perfmon
            .assign_buffer(0, TestMemObject::new(0x10000))
            .unwrap();
        perfmon
            .assign_buffer(1, TestMemObject::failing(0x10000))
            .unwrap();

        assert_eq!(perfmon.start().unwrap_err().kind(), ErrorKind::Io);
        assert!(!perfmon.active.load(Ordering::Relaxed));

        // The session survives; replacing the bad buffer makes start work.
        perfmon
            .assign_buffer(1, TestMemObject::new(0x10000))
            .unwrap();
        perfmon.start().unwrap();
        perfmon.stop().unwrap();
    }

    #[test]
    fn test_fini_resets_the_hardware() {
        let perfmon = perfmon(1);
        perfmon.init().unwrap();
        perfmon.stage_config(&valid_config()).unwrap();
        buffers(&perfmon);
        perfmon.start().unwrap();
        perfmon.stop().unwrap();
        perfmon.hw.clear_writes();

        perfmon.fini().unwrap();

        let caps = perfmon.caps().unwrap();
        let writes = perfmon.hw.writes();
        assert!(writes.contains(&MsrWrite {
            cpu: 0,
            msr: msr::IA32_PERF_GLOBAL_CTRL,
            value: 0
        }));
        assert!(writes.contains(&MsrWrite {
            cpu: 0,
            msr: msr::IA32_DEBUGCTL,
            value: 0
        }));
        assert!(writes.contains(&MsrWrite {
            cpu: 0,
            msr: msr::IA32_FIXED_CTR_CTRL,
            value: 0
        }));
        for i in 0..caps.num_programmable {
            assert!(writes.contains(&MsrWrite {
                cpu: 0,
                msr: msr::IA32_PERFEVTSEL0 + i,
                value: 0
            }));
            assert!(writes.contains(&MsrWrite {
                cpu: 0,
                msr: msr::IA32_PMC0 + i,
                value: 0
            }));
        }
        for i in 0..caps.num_fixed {
            assert!(writes.contains(&MsrWrite {
                cpu: 0,
                msr: msr::IA32_FIXED_CTR0 + i,
                value: 0
            }));
        }

        // Back to idle; a new session can be created.
        perfmon.init().unwrap();
    }

    #[test]
    fn test_fini_without_session_is_a_no_op() {
        let perfmon = perfmon(1);
        perfmon.fini().unwrap();
        assert!(perfmon.hw.writes().is_empty());
    }

    #[test]
    fn test_counter_delta() {
        assert_eq!(counter_delta(100, 100, !0), 0);
        assert_eq!(counter_delta(150, 100, !0), 50);
        // S5 from the wrap-correction scenario.
        assert_eq!(counter_delta(0x5, 0xffff_fff0, 0xffff_ffff), 0x15);
        // Full width counter.
        assert_eq!(counter_delta(3, u64::MAX - 1, u64::MAX), 5);
    }
}
