//! Per-CPU trace buffer management.
//!
//! The driver hands one memory object per CPU to the session. The buffers are
//! mapped into the kernel address space only while the session is running,
//! with all pages committed up front so that the PMI handler can write
//! records without ever faulting.

use alloc::{boxed::Box, sync::Arc};
use core::{
    cell::SyncUnsafeCell,
    mem::size_of,
    ptr::{NonNull, null_mut},
};

use cpu_trace_types::{
    MAX_COUNTERS,
    records::{BUFFER_ARCH_X86_64, BUFFER_VERSION, BufferHeader},
};
use log::debug;
use usize_conversions::FromUsize;

use crate::{
    error::{Result, ensure, err},
    record,
};

/// The minimum size of a trace buffer: the header plus the worst case for one
/// round of records.
pub const MIN_BUFFER_SIZE: usize = size_of::<BufferHeader>() + MAX_COUNTERS * record::MAX_RECORD_SIZE;

/// A caller-supplied memory object backing one CPU's trace buffer.
///
/// This is the seam to the embedding kernel's virtual memory subsystem. The
/// caller keeps its own handle to the object; the session holds a reference
/// from assignment until the session ends.
pub trait MemoryObject: Send + Sync {
    /// Size of the object in bytes.
    fn size(&self) -> usize;

    /// Map the object into the kernel address space with read-write
    /// permissions and commit all pages up front. The PMI handler writes
    /// through the mapping and must not fault.
    fn map(&self) -> Result<Box<dyn BufferMapping>>;
}

/// A pinned kernel mapping of a [`MemoryObject`]. Dropping it unmaps the
/// buffer and releases the pages.
pub trait BufferMapping: Send + Sync {
    /// Base address of the mapping. At least 8-byte aligned so that records
    /// are naturally aligned.
    fn base(&self) -> NonNull<u8>;

    fn len(&self) -> usize;
}

/// Per-CPU session state.
///
/// Aligned to a cache line: the PMI handler writes the cursor on every
/// interrupt and the CPUs must not share lines.
#[repr(align(64))]
pub(crate) struct CpuData {
    memobj: Option<Arc<dyn MemoryObject>>,
    buffer_size: usize,
    window: SyncUnsafeCell<TraceWindow>,
}

impl CpuData {
    pub(crate) fn new() -> Self {
        Self {
            memobj: None,
            buffer_size: 0,
            window: SyncUnsafeCell::new(TraceWindow::unmapped()),
        }
    }

    pub(crate) fn assign(&mut self, memobj: Arc<dyn MemoryObject>) {
        self.buffer_size = memobj.size();
        self.memobj = Some(memobj);
        // The buffer is mapped when the session starts.
    }

    pub(crate) fn has_buffer(&self) -> bool {
        self.memobj.is_some()
    }

    /// Get at the trace window without holding the session lock.
    ///
    /// # Safety
    ///
    /// The caller must be the window's current exclusive owner: either the
    /// owning CPU with interrupts disabled (the PMI handler and the stop
    /// task), or any CPU holding the session lock while the session is
    /// inactive.
    pub(crate) unsafe fn window_mut(&self) -> &mut TraceWindow {
        unsafe { &mut *self.window.get() }
    }
}

/// The mapped view of one CPU's trace buffer, present only between start and
/// stop.
pub(crate) struct TraceWindow {
    /// Keeps the pages pinned. `Some` exactly while `start` is non-null.
    mapping: Option<Box<dyn BufferMapping>>,
    start: *mut u8,
    end: *mut u8,
    /// The cursor the record writer advances. Stays within
    /// `start + size_of::<BufferHeader>()..=end`.
    pub(crate) next: *mut u8,
}

// SAFETY: The single-writer protocol documented on `CpuData::window_mut`
// serializes all accesses.
unsafe impl Send for TraceWindow {}
unsafe impl Sync for TraceWindow {}

impl TraceWindow {
    const fn unmapped() -> Self {
        Self {
            mapping: None,
            start: null_mut(),
            end: null_mut(),
            next: null_mut(),
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether `bytes` more record bytes fit.
    pub(crate) fn has_room(&self, bytes: usize) -> bool {
        self.end as usize - self.next as usize >= bytes
    }

    pub(crate) fn header_mut(&mut self) -> &mut BufferHeader {
        debug_assert!(self.is_mapped());
        // SAFETY: `start` points at the mapped buffer, which begins with the
        // header the mapping code wrote, and `&mut self` gives us
        // exclusivity.
        unsafe { &mut *self.start.cast::<BufferHeader>() }
    }

    /// Record the current cursor in the buffer header for the consumer.
    pub(crate) fn update_capture_end(&mut self) {
        let offset = self.next as usize - self.start as usize;
        self.header_mut().capture_end = u64::from_usize(offset);
    }
}

fn map_one(data: &mut CpuData, ticks_per_second: u64) -> Result<()> {
    let memobj = data.memobj.as_ref().ok_or(err!(BadState))?;
    let mapping = memobj.map()?;
    ensure!(mapping.len() >= data.buffer_size, Io);

    let start = mapping.base().as_ptr();
    let header = BufferHeader {
        version: BUFFER_VERSION,
        arch: BUFFER_ARCH_X86_64,
        flags: 0,
        ticks_per_second,
        capture_end: u64::from_usize(size_of::<BufferHeader>()),
    };
    // SAFETY: The mapping is at least `MIN_BUFFER_SIZE` bytes (checked at
    // assignment) and 8-byte aligned.
    unsafe {
        start.cast::<BufferHeader>().write(header);
    }

    let window = data.window.get_mut();
    window.mapping = Some(mapping);
    window.start = start;
    // SAFETY: `buffer_size` is the size of the object backing the mapping.
    window.end = unsafe { start.add(data.buffer_size) };
    window.next = unsafe { start.add(size_of::<BufferHeader>()) };
    Ok(())
}

/// Map every CPU's buffer and write the buffer headers. On failure all
/// already-mapped buffers are unmapped again.
pub(crate) fn map_all(cpus: &mut [CpuData], ticks_per_second: u64) -> Result<()> {
    for cpu in 0..cpus.len() {
        if let Err(err) = map_one(&mut cpus[cpu], ticks_per_second) {
            debug!("error {err:?} mapping buffer for cpu {cpu}");
            unmap_all(cpus);
            return Err(err);
        }
    }
    Ok(())
}

/// Unmap all buffers. Idempotent.
pub(crate) fn unmap_all(cpus: &mut [CpuData]) {
    for data in cpus {
        let window = data.window.get_mut();
        window.mapping = None;
        window.start = null_mut();
        window.end = null_mut();
        window.next = null_mut();
    }
}
