//! Kernel-resident core of the Intel performance monitoring trace subsystem.
//!
//! A privileged user-space driver configures hardware performance counters
//! and collects overflow samples from every logical CPU through shared
//! per-CPU trace buffers. This crate is the part that has to live in ring 0:
//! it programs the counter MSRs, services the performance monitor interrupt
//! and, because the driver may be compromised, validates every configuration
//! against the hardware capabilities before loading any of it into control
//! registers.
//!
//! The embedding kernel installs the subsystem once at boot with
//! [`install`], routes the LAPIC's performance vector to
//! [`pmi_interrupt_handler`] and forwards the driver's requests to the
//! lifecycle operations.
#![cfg_attr(not(test), no_std)]
#![feature(sync_unsafe_cell)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use alloc::sync::Arc;

use cpu_trace_types::config::{PmuConfig, PmuProperties};
use spin::Once;
use x86_64::structures::idt::InterruptStackFrameValue;

use crate::hw::RealHardware;

pub mod buffer;
mod config;
mod error;
pub mod hw;
mod msr;
mod pmi;
mod probe;
mod record;
mod session;

pub use buffer::{BufferMapping, MIN_BUFFER_SIZE, MemoryObject};
pub use error::{Error, ErrorKind, Result};
pub use session::PerfMon;

static PERF_MON: Once<PerfMon<RealHardware>> = Once::new();

/// Probe the hardware and install the subsystem.
///
/// Call once at boot, after the LAPIC driver is up. Until this has run every
/// operation returns [`ErrorKind::NotSupported`].
pub fn install(hw: RealHardware) {
    PERF_MON.call_once(|| PerfMon::new(hw));
}

fn perf_mon() -> Result<&'static PerfMon<RealHardware>> {
    PERF_MON.get().ok_or(error::err!(NotSupported))
}

/// Report the hardware's performance monitoring capabilities.
pub fn get_properties() -> Result<PmuProperties> {
    perf_mon()?.get_properties()
}

/// Create the session.
pub fn init() -> Result<()> {
    perf_mon()?.init()
}

/// Assign a trace buffer to a CPU.
pub fn assign_buffer(cpu: u32, memobj: Arc<dyn MemoryObject>) -> Result<()> {
    perf_mon()?.assign_buffer(cpu, memobj)
}

/// Validate a configuration and stage it for the next start.
pub fn stage_config(config: &PmuConfig) -> Result<()> {
    perf_mon()?.stage_config(config)
}

/// Map the buffers and start counting on every CPU.
pub fn start() -> Result<()> {
    perf_mon()?.start()
}

/// Stop counting and write the final counter values.
pub fn stop() -> Result<()> {
    perf_mon()?.stop()
}

/// Destroy the session and reset the hardware.
pub fn fini() -> Result<()> {
    perf_mon()?.fini()
}

/// Entry point for the performance monitor interrupt vector.
///
/// The embedding kernel's interrupt dispatch calls this from the LAPIC
/// performance vector with interrupts disabled. Don't unmask the vector
/// before [`install`] has run; before that no EOI is issued here.
pub fn pmi_interrupt_handler(frame: &InterruptStackFrameValue) {
    if let Some(perf_mon) = PERF_MON.get() {
        perf_mon.handle_pmi(frame);
    }
}
