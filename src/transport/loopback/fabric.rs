//! In-process stand-in for an RDMA fabric.
//!
//! Memory regions, queue pairs and completion queues behave like their
//! verbs counterparts closely enough to exercise the connection code:
//! registration is page granular, an RDMA WRITE is executed against the
//! remote queue pair's device with rkey checks, and failures surface as
//! error completions rather than post errors. A destroyed peer queue pair
//! looks like a disconnected peer.

use crate::error::{CommError, Result};
use crate::transport::driver::{
    Fabric, IbDevice, IbMemoryRegion, IbQueuePair, QpEndpoint, RdmaWrite, WorkCompletion,
};
use crossbeam_queue::ArrayQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Registration granularity of the emulated hardware.
pub const PAGE_SIZE: u64 = 4096;

const DEFAULT_QUEUE_DEPTH: usize = 1024;

struct RegionEntry {
    device: String,
    /// Page-rounded range the hardware would grant access to.
    start: u64,
    end: u64,
}

struct QpEntry {
    device: String,
}

#[derive(Default)]
struct FabricState {
    regions: Mutex<HashMap<u32, RegionEntry>>,
    qps: Mutex<HashMap<u32, QpEntry>>,
    next_key: AtomicU32,
    next_qpn: AtomicU32,
}

impl FabricState {
    fn regions(&self) -> Result<MutexGuard<'_, HashMap<u32, RegionEntry>>> {
        self.regions
            .lock()
            .map_err(|_| CommError::LockPoisoned("loopback fabric regions"))
    }

    fn qps(&self) -> Result<MutexGuard<'_, HashMap<u32, QpEntry>>> {
        self.qps
            .lock()
            .map_err(|_| CommError::LockPoisoned("loopback fabric queue pairs"))
    }

    /// Whether `key` grants `device` access to `[addr, addr + len)`.
    fn key_covers(&self, key: u32, device: &str, addr: u64, len: u64) -> Result<bool> {
        let regions = self.regions()?;
        Ok(regions.get(&key).is_some_and(|r| {
            r.device == device && addr >= r.start && addr.saturating_add(len) <= r.end
        }))
    }
}

/// Loopback RDMA fabric. Clones share devices, registrations and queue
/// pairs, so every rank of an in-process test sees the same "network".
#[derive(Clone)]
pub struct LoopbackFabric {
    devices: Arc<Vec<String>>,
    queue_depth: usize,
    state: Arc<FabricState>,
}

impl LoopbackFabric {
    pub fn new<I, S>(device_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: Arc::new(device_names.into_iter().map(Into::into).collect()),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            state: Arc::new(FabricState::default()),
        }
    }

    /// Bound on outstanding signaled writes per queue pair.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Number of live queue pairs across all devices.
    pub fn live_queue_pairs(&self) -> usize {
        self.state.qps().map(|q| q.len()).unwrap_or(0)
    }

    /// Number of live memory regions across all devices.
    pub fn live_regions(&self) -> usize {
        self.state.regions().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new(["lo_ib0", "lo_ib1"])
    }
}

impl Fabric for LoopbackFabric {
    fn name(&self) -> &'static str {
        "loopback-fabric"
    }

    fn device_names(&self) -> Result<Vec<String>> {
        Ok(self.devices.as_ref().clone())
    }

    fn open_device(&self, name: &str) -> Result<Arc<dyn IbDevice>> {
        let index = self
            .devices
            .iter()
            .position(|d| d == name)
            .ok_or_else(|| CommError::UnknownIbDevice(name.to_string()))?;
        let mut gid = [0u8; 16];
        gid[0..2].copy_from_slice(&[0xfe, 0x80]);
        gid[8..16].copy_from_slice(&(index as u64 + 1).to_be_bytes());
        Ok(Arc::new(LoopbackDevice {
            name: name.to_string(),
            gid,
            queue_depth: self.queue_depth,
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackDevice {
    name: String,
    gid: [u8; 16],
    queue_depth: usize,
    state: Arc<FabricState>,
}

impl IbDevice for LoopbackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    unsafe fn register(&self, ptr: u64, size: usize) -> Result<Box<dyn IbMemoryRegion>> {
        if ptr == 0 || size == 0 {
            return Err(CommError::registration(format!(
                "{}: cannot register 0x{ptr:x}+{size}",
                self.name
            )));
        }
        let end = ptr
            .checked_add(size as u64)
            .ok_or_else(|| CommError::registration("address range overflows"))?;
        let start = ptr & !(PAGE_SIZE - 1);
        let end = end.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        let key = self.state.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.regions()?.insert(
            key,
            RegionEntry {
                device: self.name.clone(),
                start,
                end,
            },
        );
        Ok(Box::new(LoopbackMr {
            key,
            addr: ptr,
            size,
            state: Arc::clone(&self.state),
        }))
    }

    fn create_qp(&self) -> Result<Box<dyn IbQueuePair>> {
        let qpn = self.state.next_qpn.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.qps()?.insert(
            qpn,
            QpEntry {
                device: self.name.clone(),
            },
        );
        Ok(Box::new(LoopbackQp {
            qpn,
            device: self.name.clone(),
            gid: self.gid,
            remote: None,
            errored: false,
            cq: ArrayQueue::new(self.queue_depth),
            state: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackMr {
    key: u32,
    addr: u64,
    size: usize,
    state: Arc<FabricState>,
}

impl IbMemoryRegion for LoopbackMr {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn size(&self) -> usize {
        self.size
    }

    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }
}

impl Drop for LoopbackMr {
    fn drop(&mut self) {
        if let Ok(mut regions) = self.state.regions.lock() {
            regions.remove(&self.key);
        }
    }
}

struct LoopbackQp {
    qpn: u32,
    device: String,
    gid: [u8; 16],
    remote: Option<u32>,
    /// Set after the first failed completion; the queue pair then flushes
    /// every later request in error, like a verbs QP in the ERR state.
    errored: bool,
    cq: ArrayQueue<WorkCompletion>,
    state: Arc<FabricState>,
}

impl LoopbackQp {
    fn execute(&self, wr: &RdmaWrite, remote_qpn: u32) -> Result<Option<String>> {
        if self.errored {
            return Ok(Some("work request flushed in error".into()));
        }
        let len = wr.len as u64;
        if !self
            .state
            .key_covers(wr.lkey, &self.device, wr.local_addr, len)?
        {
            return Ok(Some("local protection error".into()));
        }
        let remote_device = match self.state.qps()?.get(&remote_qpn) {
            Some(entry) => entry.device.clone(),
            None => return Ok(Some("transport retry counter exceeded".into())),
        };
        if !self
            .state
            .key_covers(wr.rkey, &remote_device, wr.remote_addr, len)?
        {
            return Ok(Some("remote access error".into()));
        }
        // SAFETY: both ranges are covered by live registrations, whose
        // memory the registrant keeps allocated.
        unsafe {
            std::ptr::copy(
                wr.local_addr as *const u8,
                wr.remote_addr as *mut u8,
                wr.len as usize,
            );
        }
        Ok(None)
    }
}

impl IbQueuePair for LoopbackQp {
    fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            qp_num: self.qpn,
            lid: 0,
            gid: self.gid,
        }
    }

    fn capacity(&self) -> usize {
        self.cq.capacity()
    }

    fn connect(&mut self, remote: &QpEndpoint) -> Result<()> {
        if !self.state.qps()?.contains_key(&remote.qp_num) {
            return Err(CommError::transport(format!(
                "{}: remote queue pair {} does not exist",
                self.device, remote.qp_num
            )));
        }
        self.remote = Some(remote.qp_num);
        Ok(())
    }

    unsafe fn post_write(&mut self, wr: &RdmaWrite) -> Result<()> {
        let Some(remote_qpn) = self.remote else {
            return Err(CommError::transport(format!(
                "{}: queue pair {} is not ready to send",
                self.device, self.qpn
            )));
        };
        if self.cq.is_full() {
            return Err(CommError::transport(format!(
                "{}: send queue full ({} outstanding)",
                self.device,
                self.cq.capacity()
            )));
        }
        let error = self.execute(wr, remote_qpn)?;
        if error.is_some() {
            self.errored = true;
        }
        self.cq
            .push(WorkCompletion {
                wr_id: wr.wr_id,
                error,
            })
            .map_err(|_| CommError::transport("completion queue overrun"))
    }

    fn poll(&mut self, out: &mut Vec<WorkCompletion>) -> Result<()> {
        while let Some(wc) = self.cq.pop() {
            out.push(wc);
        }
        Ok(())
    }
}

impl Drop for LoopbackQp {
    fn drop(&mut self) {
        if let Ok(mut qps) = self.state.qps.lock() {
            qps.remove(&self.qpn);
        }
    }
}
