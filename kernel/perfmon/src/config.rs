//! Validation of driver-supplied configurations.
//!
//! The driver is the untrusted side of this interface: everything is checked
//! against the probed hardware limits and the writable-bit whitelists before
//! any of it is allowed near a control register. Validation either fails with
//! no effect or produces a [`StagedConfig`] with front-packed counter tables.

use arrayvec::ArrayVec;
use cpu_trace_types::{
    CounterFlags, EventId, MAX_FIXED_COUNTERS, MAX_PROGRAMMABLE_COUNTERS, config::PmuConfig,
};
use log::debug;

use crate::{
    error::{Result, bail},
    msr,
    probe::PmuCaps,
};

#[derive(Debug)]
pub(crate) struct FixedCounter {
    pub id: EventId,
    /// Hardware fixed counter number, resolved from the id.
    pub hw_num: u32,
    pub initial_value: u64,
    pub flags: CounterFlags,
}

#[derive(Debug)]
pub(crate) struct ProgrammableCounter {
    pub id: EventId,
    /// Validated `IA32_PERFEVTSEL` value.
    pub event_sel: u64,
    pub initial_value: u64,
    pub flags: CounterFlags,
}

/// A fully validated configuration, ready to be programmed.
#[derive(Debug)]
pub(crate) struct StagedConfig {
    pub global_ctrl: u64,
    pub fixed_ctrl: u64,
    pub debug_ctrl: u64,
    pub timebase_id: EventId,
    pub fixed: ArrayVec<FixedCounter, MAX_FIXED_COUNTERS>,
    pub programmable: ArrayVec<ProgrammableCounter, MAX_PROGRAMMABLE_COUNTERS>,
}

/// The hardware register number for a fixed event id, or `None` if the id
/// doesn't name a fixed event.
fn lookup_fixed_counter(id: EventId) -> Option<u32> {
    if id.group() != EventId::GROUP_FIXED {
        return None;
    }
    match id.event() {
        // Instructions retired.
        1 => Some(0),
        // Unhalted core cycles.
        2 => Some(1),
        // Unhalted reference cycles.
        3 => Some(2),
        _ => None,
    }
}

fn verify_control(caps: &PmuCaps, config: &PmuConfig) -> Result<()> {
    if cfg!(feature = "freeze-on-pmi") {
        if config.debug_ctrl & msr::DEBUGCTL_FREEZE_PERFMON_ON_PMI == 0 {
            debug!("DEBUGCTL.FREEZE_PERFMON_ON_PMI not set");
            bail!(InvalidArgs);
        }
    } else if config.debug_ctrl & msr::DEBUGCTL_FREEZE_PERFMON_ON_PMI != 0 {
        debug!("DEBUGCTL.FREEZE_PERFMON_ON_PMI is set");
        bail!(InvalidArgs);
    }

    if config.global_ctrl & !caps.global_ctrl_writable != 0 {
        debug!("non-writable bits set in global_ctrl");
        bail!(InvalidArgs);
    }
    if config.fixed_ctrl & !caps.fixed_ctrl_writable != 0 {
        debug!("non-writable bits set in fixed_ctrl");
        bail!(InvalidArgs);
    }
    if config.debug_ctrl & !caps.debug_ctrl_writable != 0 {
        debug!("non-writable bits set in debug_ctrl");
        bail!(InvalidArgs);
    }

    Ok(())
}

fn verify_fixed(
    caps: &PmuCaps,
    config: &PmuConfig,
) -> Result<ArrayVec<FixedCounter, MAX_FIXED_COUNTERS>> {
    let mut fixed = ArrayVec::new();
    let mut seen_last = false;
    for i in 0..caps.num_fixed as usize {
        let id = config.fixed_ids[i];
        if !id.is_none() && seen_last {
            debug!("active fixed events not front-filled");
            bail!(InvalidArgs);
        }
        if id.is_none() {
            seen_last = true;
        }

        if seen_last {
            if config.fixed_initial_value[i] != 0 {
                debug!("unused fixed_initial_value[{i}] not zero");
                bail!(InvalidArgs);
            }
            if config.fixed_flags[i] != 0 {
                debug!("unused fixed_flags[{i}] not zero");
                bail!(InvalidArgs);
            }
        } else {
            if config.fixed_initial_value[i] > caps.max_fixed_value {
                debug!("initial value too large in fixed_initial_value[{i}]");
                bail!(InvalidArgs);
            }
            let Some(flags) = CounterFlags::from_bits(config.fixed_flags[i]) else {
                debug!("unknown bits set in fixed_flags[{i}]");
                bail!(InvalidArgs);
            };
            let Some(hw_num) = lookup_fixed_counter(id) else {
                debug!("invalid fixed counter id in fixed_ids[{i}]");
                bail!(InvalidArgs);
            };
            if hw_num >= caps.num_fixed {
                debug!("fixed counter for fixed_ids[{i}] not present");
                bail!(InvalidArgs);
            }
            fixed.push(FixedCounter {
                id,
                hw_num,
                initial_value: config.fixed_initial_value[i],
                flags,
            });
        }
    }
    Ok(fixed)
}

fn verify_programmable(
    caps: &PmuCaps,
    config: &PmuConfig,
) -> Result<ArrayVec<ProgrammableCounter, MAX_PROGRAMMABLE_COUNTERS>> {
    let mut programmable = ArrayVec::new();
    let mut seen_last = false;
    for i in 0..caps.num_programmable as usize {
        let id = config.programmable_ids[i];
        if !id.is_none() && seen_last {
            debug!("active programmable events not front-filled");
            bail!(InvalidArgs);
        }
        if id.is_none() {
            seen_last = true;
        }

        if seen_last {
            if config.programmable_events[i] != 0 {
                debug!("unused programmable_events[{i}] not zero");
                bail!(InvalidArgs);
            }
            if config.programmable_initial_value[i] != 0 {
                debug!("unused programmable_initial_value[{i}] not zero");
                bail!(InvalidArgs);
            }
            if config.programmable_flags[i] != 0 {
                debug!("unused programmable_flags[{i}] not zero");
                bail!(InvalidArgs);
            }
        } else {
            if config.programmable_events[i] & !msr::PERFEVTSEL_WRITABLE_BITS != 0 {
                debug!("non-writable bits set in programmable_events[{i}]");
                bail!(InvalidArgs);
            }
            if config.programmable_initial_value[i] > caps.max_programmable_value {
                debug!("initial value too large in programmable_initial_value[{i}]");
                bail!(InvalidArgs);
            }
            let Some(flags) = CounterFlags::from_bits(config.programmable_flags[i]) else {
                debug!("unknown bits set in programmable_flags[{i}]");
                bail!(InvalidArgs);
            };
            programmable.push(ProgrammableCounter {
                id,
                event_sel: config.programmable_events[i],
                initial_value: config.programmable_initial_value[i],
                flags,
            });
        }
    }
    Ok(programmable)
}

/// Validate `config` against the hardware capabilities.
///
/// Fails without side effects, so a rejected configuration leaves the session
/// untouched.
pub(crate) fn validate(caps: &PmuCaps, config: &PmuConfig) -> Result<StagedConfig> {
    verify_control(caps, config)?;
    let fixed = verify_fixed(caps, config)?;
    let programmable = verify_programmable(caps, config)?;

    Ok(StagedConfig {
        global_ctrl: config.global_ctrl,
        fixed_ctrl: config.fixed_ctrl,
        debug_ctrl: config.debug_ctrl,
        timebase_id: config.timebase_id,
        fixed,
        programmable,
    })
}
