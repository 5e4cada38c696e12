//! Test doubles: a [`Hardware`] implementation backed by per-CPU MSR maps
//! and a memory object backed by plain memory.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::{
    cell::SyncUnsafeCell,
    mem::size_of,
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use cpu_trace_types::{
    EventId,
    records::{BufferHeader, PcRecord, RecordHeader, RecordKind, TickRecord, ValueRecord},
};
use spin::Mutex;
use x86_64::{
    PrivilegeLevel, VirtAddr,
    registers::rflags::RFlags,
    structures::{gdt::SegmentSelector, idt::InterruptStackFrameValue},
};

use super::{CpuidLeaf, Hardware};
use crate::{
    buffer::{BufferMapping, MemoryObject},
    error::{Result, ensure},
    msr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MsrWrite {
    pub cpu: u32,
    pub msr: u32,
    pub value: u64,
}

struct MockState {
    /// One MSR bank per CPU.
    msrs: Vec<BTreeMap<u32, u64>>,
    writes: Vec<MsrWrite>,
    pmi_masked: Vec<bool>,
    eois: u32,
}

pub(crate) struct MockHardware {
    pub(crate) num_cpus: u32,
    pub(crate) ticks_per_second: u64,
    pub(crate) cpuid_0a: CpuidLeaf,
    pub(crate) cpuid_01: CpuidLeaf,
    pub(crate) aspace: u64,
    tsc: AtomicU64,
    current_cpu: AtomicU32,
    state: Mutex<MockState>,
}

impl MockHardware {
    /// A Skylake-alike: perfmon version 4, 4 programmable counters of width
    /// 48, 3 fixed counters of width 48, PDCM present.
    pub(crate) fn skylake(num_cpus: u32) -> Self {
        let n = num_cpus as usize;
        let mut msrs = Vec::new();
        msrs.resize_with(n, BTreeMap::new);
        for bank in &mut msrs {
            bank.insert(msr::IA32_PERF_CAPABILITIES, 0x33);
        }
        Self {
            num_cpus,
            ticks_per_second: 3_000_000_000,
            cpuid_0a: CpuidLeaf {
                eax: 4 | (4 << 8) | (48 << 16) | (7 << 24),
                ebx: 0,
                ecx: 0,
                edx: 3 | (48 << 5),
            },
            cpuid_01: CpuidLeaf {
                eax: 0,
                ebx: 0,
                ecx: 1 << 15,
                edx: 0,
            },
            aspace: 0xaaaa_b000,
            tsc: AtomicU64::new(10_000),
            current_cpu: AtomicU32::new(0),
            state: Mutex::new(MockState {
                msrs,
                writes: Vec::new(),
                pmi_masked: alloc::vec![true; n],
                eois: 0,
            }),
        }
    }

    pub(crate) fn set_current_cpu(&self, cpu: u32) {
        self.current_cpu.store(cpu, Ordering::Relaxed);
    }

    pub(crate) fn msr(&self, cpu: u32, msr: u32) -> u64 {
        let state = self.state.lock();
        state.msrs[cpu as usize].get(&msr).copied().unwrap_or(0)
    }

    pub(crate) fn set_msr(&self, cpu: u32, msr: u32, value: u64) {
        let mut state = self.state.lock();
        state.msrs[cpu as usize].insert(msr, value);
    }

    pub(crate) fn writes(&self) -> Vec<MsrWrite> {
        self.state.lock().writes.clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub(crate) fn eoi_count(&self) -> u32 {
        self.state.lock().eois
    }

    pub(crate) fn pmi_masked(&self, cpu: u32) -> bool {
        self.state.lock().pmi_masked[cpu as usize]
    }
}

impl Hardware for MockHardware {
    fn num_cpus(&self) -> u32 {
        self.num_cpus
    }

    fn current_cpu(&self) -> u32 {
        self.current_cpu.load(Ordering::Relaxed)
    }

    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidLeaf {
        match leaf {
            0x1 => self.cpuid_01,
            0xa => self.cpuid_0a,
            _ => CpuidLeaf::default(),
        }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        let cpu = self.current_cpu() as usize;
        let state = self.state.lock();
        state.msrs[cpu].get(&msr).copied().unwrap_or(0)
    }

    fn write_msr(&self, reg: u32, value: u64) {
        let cpu = self.current_cpu();
        let mut state = self.state.lock();
        state.writes.push(MsrWrite {
            cpu,
            msr: reg,
            value,
        });
        if reg == msr::IA32_PERF_GLOBAL_STATUS_RESET {
            // The reset register clears status bits instead of storing.
            let status = state.msrs[cpu as usize]
                .entry(msr::IA32_PERF_GLOBAL_STATUS)
                .or_insert(0);
            *status &= !value;
        } else {
            state.msrs[cpu as usize].insert(reg, value);
        }
    }

    fn rdtsc(&self) -> u64 {
        self.tsc.fetch_add(16, Ordering::Relaxed)
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    fn current_aspace(&self) -> u64 {
        self.aspace
    }

    fn pmi_mask(&self) {
        let cpu = self.current_cpu() as usize;
        self.state.lock().pmi_masked[cpu] = true;
    }

    fn pmi_unmask(&self) {
        let cpu = self.current_cpu() as usize;
        self.state.lock().pmi_masked[cpu] = false;
    }

    fn issue_eoi(&self) {
        self.state.lock().eois += 1;
    }

    fn run_on_all_cpus(&self, task: &(dyn Fn() + Sync)) {
        let previous = self.current_cpu();
        for cpu in 0..self.num_cpus {
            self.set_current_cpu(cpu);
            task();
        }
        self.set_current_cpu(previous);
    }
}

/// An interrupt frame as the PMI handler would see it.
pub(crate) fn frame(ip: u64) -> InterruptStackFrameValue {
    InterruptStackFrameValue::new(
        VirtAddr::new(ip),
        SegmentSelector::new(1, PrivilegeLevel::Ring0),
        RFlags::empty(),
        VirtAddr::new(0x7fff_f000),
        SegmentSelector::new(2, PrivilegeLevel::Ring0),
    )
}

/// A trace buffer memory object backed by plain memory.
///
/// The storage is 8-byte aligned like a real page-aligned mapping. Tests keep
/// a second `Arc` and inspect the contents after the session unmapped the
/// buffer, the same way the driver reads out its shared memory.
pub(crate) struct TestMemObject {
    cells: Box<[SyncUnsafeCell<u64>]>,
    size: usize,
    fail_map: bool,
}

impl TestMemObject {
    pub(crate) fn new(size: usize) -> Arc<Self> {
        Self::with_options(size, false)
    }

    /// A memory object whose mapping always fails.
    pub(crate) fn failing(size: usize) -> Arc<Self> {
        Self::with_options(size, true)
    }

    fn with_options(size: usize, fail_map: bool) -> Arc<Self> {
        let cells = (0..size.div_ceil(8))
            .map(|_| SyncUnsafeCell::new(0))
            .collect();
        Arc::new(Self {
            cells,
            size,
            fail_map,
        })
    }

    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.cells
            .iter()
            .flat_map(|cell| {
                // SAFETY: Tests only look at the contents while no mapping
                // is being written through.
                let word = unsafe { *cell.get() };
                word.to_le_bytes()
            })
            .take(self.size)
            .collect()
    }

    pub(crate) fn header(&self) -> BufferHeader {
        bytemuck::pod_read_unaligned(&self.snapshot()[..size_of::<BufferHeader>()])
    }

    pub(crate) fn records(&self) -> Vec<Record> {
        decode_records(&self.snapshot())
    }
}

impl MemoryObject for TestMemObject {
    fn size(&self) -> usize {
        self.size
    }

    fn map(&self) -> Result<Box<dyn BufferMapping>> {
        ensure!(!self.fail_map, Io);
        let base = NonNull::new(self.cells.as_ptr().cast_mut().cast::<u8>()).unwrap();
        Ok(Box::new(TestMapping {
            base,
            len: self.size,
        }))
    }
}

struct TestMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: The mapping only hands out the pointer; the session's single-writer
// protocol governs all accesses through it.
unsafe impl Send for TestMapping {}
unsafe impl Sync for TestMapping {}

impl BufferMapping for TestMapping {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// A decoded trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Record {
    Tick {
        id: EventId,
        time: u64,
    },
    Value {
        id: EventId,
        time: u64,
        value: u64,
    },
    Pc {
        id: EventId,
        time: u64,
        aspace: u64,
        pc: u64,
    },
}

/// Decode the records between the buffer header and `capture_end`.
pub(crate) fn decode_records(bytes: &[u8]) -> Vec<Record> {
    let header: BufferHeader = bytemuck::pod_read_unaligned(&bytes[..size_of::<BufferHeader>()]);
    let end = header.capture_end as usize;
    assert!(end <= bytes.len());

    let mut records = Vec::new();
    let mut offset = size_of::<BufferHeader>();
    while offset < end {
        let header: RecordHeader =
            bytemuck::pod_read_unaligned(&bytes[offset..offset + size_of::<RecordHeader>()]);
        let id = header.event_id;
        let time = header.time;
        if header.kind == RecordKind::Tick as u8 {
            records.push(Record::Tick { id, time });
            offset += size_of::<TickRecord>();
        } else if header.kind == RecordKind::Value as u8 {
            let record: ValueRecord =
                bytemuck::pod_read_unaligned(&bytes[offset..offset + size_of::<ValueRecord>()]);
            records.push(Record::Value {
                id,
                time,
                value: record.value,
            });
            offset += size_of::<ValueRecord>();
        } else if header.kind == RecordKind::Pc as u8 {
            let record: PcRecord =
                bytemuck::pod_read_unaligned(&bytes[offset..offset + size_of::<PcRecord>()]);
            records.push(Record::Pc {
                id,
                time,
                aspace: record.aspace,
                pc: record.pc,
            });
            offset += size_of::<PcRecord>();
        } else {
            panic!("unknown record kind {} at offset {offset}", header.kind);
        }
    }
    records
}
