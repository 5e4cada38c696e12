//! The performance monitor interrupt handler.
//!
//! Runs in interrupt context with interrupts disabled. The contract: no
//! allocation, no blocking, no faults (the buffers are committed up front),
//! and time bounded by the number of used counters. The session lock is
//! never taken here; the `active` flag is the only synchronization with the
//! rest of the subsystem.

use core::sync::atomic::Ordering;

use cpu_trace_types::{CounterFlags, records::BUFFER_FLAG_FULL};
use log::trace;
use x86_64::structures::idt::InterruptStackFrameValue;

use crate::{
    config::StagedConfig,
    hw::Hardware,
    msr,
    probe::PmuCaps,
    record,
    session::{PerfMon, Session},
};

impl<H> PerfMon<H>
where
    H: Hardware,
{
    /// Handle a performance monitor interrupt.
    ///
    /// The embedding kernel routes the LAPIC's performance vector here.
    pub fn handle_pmi(&self, frame: &InterruptStackFrameValue) {
        // Stop clears the flag before it touches anything, so a false here
        // means the buffers may already be gone.
        if !self.active.load(Ordering::Acquire) {
            self.hw.issue_eoi();
            return;
        }

        // Turn all counters off so that the ones that haven't overflowed yet
        // stop counting while we work. With freeze-on-pmi the hardware
        // already did this for us.
        if cfg!(not(feature = "freeze-on-pmi")) {
            self.hw.write_msr(msr::IA32_PERF_GLOBAL_CTRL, 0);
        }

        // SAFETY: We observed `active` with acquire ordering in this
        // interrupt.
        let session = unsafe { self.active_session() };
        let (Some(caps), Some(config)) = (self.caps.as_ref(), session.config.as_ref()) else {
            // start() doesn't publish unconfigured sessions.
            self.hw.issue_eoi();
            return;
        };

        let success = self.drain_overflows(caps, session, config, frame);

        // Acknowledge before counting is restored so that we have full
        // control over when the next PMI can arrive.
        self.hw.issue_eoi();

        if success {
            // The docs suggest only pre-Skylake parts need the unmask here,
            // but Skylake wants it too, at least with freeze-on-pmi off.
            self.hw.pmi_unmask();
            if cfg!(not(feature = "freeze-on-pmi")) {
                // The last thing we do: the counters count again from here.
                self.hw
                    .write_msr(msr::IA32_PERF_GLOBAL_CTRL, config.global_ctrl);
            }
        } else if cfg!(feature = "freeze-on-pmi") {
            self.hw.write_msr(msr::IA32_PERF_GLOBAL_CTRL, 0);
        }
        // On failure the counters stay off and the PMI stays masked; nothing
        // more will arrive until the driver stops the session.
    }

    /// Returns false if the buffer is out of space.
    fn drain_overflows(
        &self,
        caps: &PmuCaps,
        session: &Session,
        config: &StagedConfig,
        frame: &InterruptStackFrameValue,
    ) -> bool {
        let cpu = self.hw.current_cpu();
        let data = &session.cpus[cpu as usize];
        let now = self.hw.rdtsc();

        // SAFETY: The window belongs to this CPU and interrupts are
        // disabled.
        let window = unsafe { data.window_mut() };

        // Check for the worst case up front rather than before every record.
        let space_needed =
            (config.programmable.len() + config.fixed.len()) * record::MAX_RECORD_SIZE;
        if !window.has_room(space_needed) {
            trace!("cpu {cpu}: @{now} pmi buffer full");
            window.header_mut().flags |= BUFFER_FLAG_FULL;
            return false;
        }

        let status = self.hw.read_msr(msr::IA32_PERF_GLOBAL_STATUS);
        let mut bits_to_clear = 0;

        if status & caps.counter_status_bits != 0 {
            if cfg!(feature = "freeze-on-pmi") {
                if status & msr::STATUS_CTR_FRZ == 0 {
                    trace!("cpu {cpu}: status.CTR_FRZ not set");
                }
            } else if status & msr::STATUS_CTR_FRZ != 0 {
                trace!("cpu {cpu}: status.CTR_FRZ is set");
            }

            let aspace = self.hw.current_aspace();
            let ip = frame.instruction_pointer.as_u64();
            let mut saw_timebase = false;

            // The tick record is preferred over the larger value record; the
            // consumer reconstructs counts from the configured initial
            // values.

            for (i, counter) in config.programmable.iter().enumerate() {
                let i = i as u32;
                if status & msr::status_pmc_ovf(i) == 0 {
                    continue;
                }
                // Counters slaved to the timebase are sampled in the second
                // pass. They aren't supposed to interrupt on their own, but
                // overflow can't be ruled out, so an overflow that does
                // happen is still recorded here.
                if counter.id == config.timebase_id {
                    saw_timebase = true;
                } else if counter.flags.contains(CounterFlags::TIMEBASE) {
                    continue;
                }
                window.next = if counter.flags.contains(CounterFlags::PC) {
                    unsafe { record::write_pc(window.next, counter.id, now, aspace, ip) }
                } else {
                    unsafe { record::write_tick(window.next, counter.id, now) }
                };
                self.hw.write_msr(msr::IA32_PMC0 + i, counter.initial_value);
            }

            for counter in &config.fixed {
                if status & msr::status_fixed_ovf(counter.hw_num) == 0 {
                    continue;
                }
                if counter.id == config.timebase_id {
                    saw_timebase = true;
                } else if counter.flags.contains(CounterFlags::TIMEBASE) {
                    continue;
                }
                window.next = if counter.flags.contains(CounterFlags::PC) {
                    unsafe { record::write_pc(window.next, counter.id, now, aspace, ip) }
                } else {
                    unsafe { record::write_tick(window.next, counter.id, now) }
                };
                self.hw
                    .write_msr(msr::IA32_FIXED_CTR0 + counter.hw_num, counter.initial_value);
            }

            bits_to_clear |= caps.counter_status_bits;

            // The timebase fired: sample every counter that's slaved to it.
            if saw_timebase {
                for (i, counter) in config.programmable.iter().enumerate() {
                    let i = i as u32;
                    if !counter.flags.contains(CounterFlags::TIMEBASE) {
                        continue;
                    }
                    let value = self.hw.read_msr(msr::IA32_PMC0 + i);
                    window.next =
                        unsafe { record::write_value(window.next, counter.id, now, value) };
                    // Left alone the counter could overflow; reset it.
                    self.hw.write_msr(msr::IA32_PMC0 + i, counter.initial_value);
                }
                for counter in &config.fixed {
                    if !counter.flags.contains(CounterFlags::TIMEBASE) {
                        continue;
                    }
                    let value = self.hw.read_msr(msr::IA32_FIXED_CTR0 + counter.hw_num);
                    window.next =
                        unsafe { record::write_value(window.next, counter.id, now, value) };
                    self.hw
                        .write_msr(msr::IA32_FIXED_CTR0 + counter.hw_num, counter.initial_value);
                }
            }

            window.update_capture_end();
        }

        // Not expected at this point.
        if status & msr::STATUS_TRACE_TOPA_PMI != 0 {
            trace!("cpu {cpu}: unexpected TRACE_TOPA_PMI status");
        }
        if status & msr::STATUS_LBR_FRZ != 0 {
            trace!("cpu {cpu}: unexpected LBR_FRZ status");
        }
        if status & msr::STATUS_DS_BUFFER_OVF != 0 {
            trace!("cpu {cpu}: unexpected DS_BUFFER_OVF status");
        }

        // CTR_FRZ is read-only in the status register; everything else that
        // was set gets cleared.
        bits_to_clear |= msr::STATUS_UNCORE_OVF | msr::STATUS_COND_CHGD;
        bits_to_clear |= status;
        self.hw
            .write_msr(msr::IA32_PERF_GLOBAL_STATUS_RESET, bits_to_clear);

        let end_status = self.hw.read_msr(msr::IA32_PERF_GLOBAL_STATUS);
        if end_status != 0 {
            trace!("cpu {cpu}: end status {end_status:#x}");
        }

        true
    }
}
