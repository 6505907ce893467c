//! In-process stand-in for a GPU IPC driver.
//!
//! "Device" allocations are host buffers handed out by [`LoopbackIpc::alloc`].
//! Export handles name an allocation; importing one maps the same memory.
//! Copies enqueued on a [`CopyStream`] are deferred until `synchronize`, so
//! tests observe the same "not visible before flush" behavior a real stream
//! has.

use crate::error::{CommError, Result};
use crate::transport::driver::{AllocationRange, CopyStream, IpcDriver, IpcImport};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const HANDLE_SIZE: usize = 24;

struct AllocEntry {
    id: u64,
    len: usize,
    imports: usize,
    exports: usize,
}

#[derive(Default)]
struct IpcState {
    /// Live allocations keyed by base address.
    allocations: Mutex<BTreeMap<u64, AllocEntry>>,
    next_id: AtomicU64,
}

impl IpcState {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u64, AllocEntry>>> {
        self.allocations
            .lock()
            .map_err(|_| CommError::LockPoisoned("loopback ipc allocations"))
    }

    fn range_of(&self, ptr: u64, size: usize) -> Result<AllocationRange> {
        let allocations = self.lock()?;
        allocations
            .range(..=ptr)
            .next_back()
            .map(|(&base, entry)| AllocationRange {
                base,
                len: entry.len,
            })
            .filter(|range| range.covers(ptr, size))
            .ok_or_else(|| {
                CommError::registration(format!(
                    "0x{ptr:x}+{size} is not resident device memory"
                ))
            })
    }
}

/// Loopback GPU IPC driver. Clones share the same allocation table.
#[derive(Clone, Default)]
pub struct LoopbackIpc {
    state: Arc<IpcState>,
}

impl LoopbackIpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` zeroed bytes of "device" memory.
    pub fn alloc(&self, len: usize) -> Result<DeviceBuffer> {
        if len == 0 {
            return Err(CommError::InvalidArgument(
                "cannot allocate zero bytes".into(),
            ));
        }
        let ptr = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.lock()?.insert(
            ptr as u64,
            AllocEntry {
                id,
                len,
                imports: 0,
                exports: 0,
            },
        );
        Ok(DeviceBuffer {
            ptr,
            len,
            state: Arc::clone(&self.state),
        })
    }

    /// Number of live imports of the allocation starting at `base`.
    pub fn import_count(&self, base: u64) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|allocations| allocations.get(&base).map(|e| e.imports))
            .unwrap_or(0)
    }

    /// Number of unreleased exports of the allocation starting at `base`.
    pub fn export_count(&self, base: u64) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|allocations| allocations.get(&base).map(|e| e.exports))
            .unwrap_or(0)
    }
}

impl IpcDriver for LoopbackIpc {
    fn name(&self) -> &'static str {
        "loopback-ipc"
    }

    fn query_range(&self, ptr: u64, size: usize) -> Result<AllocationRange> {
        if ptr == 0 || size == 0 {
            return Err(CommError::registration("null or empty range"));
        }
        self.state.range_of(ptr, size)
    }

    fn export(&self, base: u64) -> Result<Vec<u8>> {
        let mut allocations = self.state.lock()?;
        let entry = allocations.get_mut(&base).ok_or_else(|| {
            CommError::registration(format!("0x{base:x} is not the base of an allocation"))
        })?;
        entry.exports += 1;
        let mut handle = Vec::with_capacity(HANDLE_SIZE);
        handle.extend_from_slice(&entry.id.to_le_bytes());
        handle.extend_from_slice(&base.to_le_bytes());
        handle.extend_from_slice(&(entry.len as u64).to_le_bytes());
        Ok(handle)
    }

    fn release(&self, handle: &[u8]) {
        let Some(base) = handle.get(8..16).and_then(|b| b.try_into().ok()) else {
            return;
        };
        if let Ok(mut allocations) = self.state.lock() {
            if let Some(entry) = allocations.get_mut(&u64::from_le_bytes(base)) {
                entry.exports = entry.exports.saturating_sub(1);
            }
        }
    }

    fn import(&self, handle: &[u8]) -> Result<Box<dyn IpcImport>> {
        if handle.len() != HANDLE_SIZE {
            return Err(CommError::DecodeFailed(format!(
                "loopback IPC handle must be {HANDLE_SIZE} bytes, got {}",
                handle.len()
            )));
        }
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&handle[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };
        let (id, base, len) = (word(0), word(1), word(2));

        let mut allocations = self.state.lock()?;
        match allocations.get_mut(&base) {
            Some(entry) if entry.id == id && entry.len as u64 == len => {
                entry.imports += 1;
                Ok(Box::new(LoopbackImport {
                    base,
                    len: entry.len,
                    state: Arc::clone(&self.state),
                }))
            }
            _ => Err(CommError::transport(format!(
                "stale IPC handle for allocation {id} at 0x{base:x}"
            ))),
        }
    }

    fn create_stream(&self) -> Result<Box<dyn CopyStream>> {
        Ok(Box::new(LoopbackStream {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        }))
    }
}

/// Host-backed stand-in for a device allocation. Freed on drop.
pub struct DeviceBuffer {
    ptr: *mut u8,
    len: usize,
    state: Arc<IpcState>,
}

// The buffer is only touched through raw copies whose ordering callers
// establish with flush().
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    pub fn ptr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked against the allocation above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked against the allocation above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CommError::OutOfBounds {
                side: "buffer",
                offset,
                size: len,
                limit: self.len,
            }),
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Ok(mut allocations) = self.state.allocations.lock() {
            allocations.remove(&(self.ptr as u64));
        }
        // SAFETY: ptr/len came from Box::into_raw of a boxed slice of len bytes.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

struct LoopbackImport {
    base: u64,
    len: usize,
    state: Arc<IpcState>,
}

impl IpcImport for LoopbackImport {
    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for LoopbackImport {
    fn drop(&mut self) {
        if let Ok(mut allocations) = self.state.allocations.lock() {
            if let Some(entry) = allocations.get_mut(&self.base) {
                entry.imports = entry.imports.saturating_sub(1);
            }
        }
    }
}

struct LoopbackStream {
    state: Arc<IpcState>,
    pending: Vec<(u64, u64, usize)>,
}

impl CopyStream for LoopbackStream {
    unsafe fn copy_async(&mut self, dst: u64, src: u64, len: usize) -> Result<()> {
        for (what, ptr) in [("destination", dst), ("source", src)] {
            self.state.range_of(ptr, len).map_err(|_| {
                CommError::transport(format!("illegal {what} address 0x{ptr:x}+{len}"))
            })?;
        }
        self.pending.push((dst, src, len));
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        for (dst, src, len) in self.pending.drain(..) {
            // SAFETY: both ranges were validated at enqueue time and the
            // caller keeps them alive until synchronize returns.
            unsafe {
                std::ptr::copy(src as *const u8, dst as *mut u8, len);
            }
        }
        Ok(())
    }
}
