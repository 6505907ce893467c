//! Seams between fabriclink and the vendor GPU driver / RDMA fabric.
//!
//! fabriclink never calls a driver directly. Registration, connection setup
//! and the data path go through the traits below, which are implemented by
//! the in-process loopback backends and, behind the `rdma` / `cuda`
//! features, by real ibverbs and CUDA driver bindings.
//!
//! All addresses are raw `u64` device (or host) pointers.

use crate::error::{CommError, Result};
use std::sync::Arc;

/// Allocation that backs a pointer, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRange {
    pub base: u64,
    pub len: usize,
}

impl AllocationRange {
    /// True if `[ptr, ptr + size)` lies inside this allocation.
    pub fn covers(&self, ptr: u64, size: usize) -> bool {
        let Some(end) = ptr.checked_add(size as u64) else {
            return false;
        };
        ptr >= self.base && end <= self.base + self.len as u64
    }
}

/// GPU peer-to-peer memory sharing between processes on one node.
pub trait IpcDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve the device allocation containing `[ptr, ptr + size)`.
    ///
    /// Fails if the range is not resident device memory or spans
    /// allocations.
    fn query_range(&self, ptr: u64, size: usize) -> Result<AllocationRange>;

    /// Export the allocation starting at `base` as an opaque handle that a
    /// process on the same node can [`import`](Self::import).
    fn export(&self, base: u64) -> Result<Vec<u8>>;

    /// Drop one reference taken by [`export`](Self::export) on `handle`.
    fn release(&self, _handle: &[u8]) {}

    /// Map an exported allocation into this process.
    fn import(&self, handle: &[u8]) -> Result<Box<dyn IpcImport>>;

    /// Create a dedicated stream for device-to-device copies.
    fn create_stream(&self) -> Result<Box<dyn CopyStream>>;
}

/// A mapped view of another process's allocation. Dropping it unmaps the
/// view; the exporter's allocation is unaffected.
pub trait IpcImport: Send + Sync {
    /// Local address of the start of the imported allocation.
    fn base(&self) -> u64;

    /// Length of the imported allocation in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-order queue of asynchronous device copies.
pub trait CopyStream: Send {
    /// Enqueue a copy of `len` bytes from `src` to `dst`.
    ///
    /// # Safety
    /// Both ranges must stay valid until [`synchronize`](Self::synchronize)
    /// returns.
    unsafe fn copy_async(&mut self, dst: u64, src: u64, len: usize) -> Result<()>;

    /// Block until every enqueued copy has completed.
    fn synchronize(&mut self) -> Result<()>;
}

/// An RDMA fabric: the set of local devices and how to open them.
pub trait Fabric: Send + Sync {
    fn name(&self) -> &'static str;

    /// Names of the locally usable devices, in a stable order.
    fn device_names(&self) -> Result<Vec<String>>;

    fn open_device(&self, name: &str) -> Result<Arc<dyn IbDevice>>;
}

/// An opened RDMA device with its protection domain.
pub trait IbDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Register `[ptr, ptr + size)` for local and remote access.
    ///
    /// Registration is page granular: the hardware grants remote access to
    /// every page the range touches.
    ///
    /// # Safety
    /// The memory must remain allocated for the lifetime of the region.
    unsafe fn register(&self, ptr: u64, size: usize) -> Result<Box<dyn IbMemoryRegion>>;

    /// Create a reliable-connected queue pair in the INIT state.
    fn create_qp(&self) -> Result<Box<dyn IbQueuePair>>;
}

/// A registered memory region. Dropping it deregisters the memory.
pub trait IbMemoryRegion: Send + Sync {
    fn addr(&self) -> u64;
    fn size(&self) -> usize;
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
}

/// One RDMA WRITE work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaWrite {
    pub wr_id: u64,
    pub local_addr: u64,
    pub lkey: u32,
    pub len: u32,
    pub remote_addr: u64,
    pub rkey: u32,
}

/// Result of one signaled work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    /// `None` on success, otherwise the reported failure.
    pub error: Option<String>,
}

/// A reliable-connected queue pair.
pub trait IbQueuePair: Send {
    fn endpoint(&self) -> QpEndpoint;

    /// Maximum number of signaled writes that may be outstanding (posted
    /// but not yet polled).
    fn capacity(&self) -> usize;

    /// Transition INIT → RTR → RTS towards `remote`.
    fn connect(&mut self, remote: &QpEndpoint) -> Result<()>;

    /// Post a signaled RDMA WRITE. Writes posted on one queue pair are
    /// executed in posting order.
    ///
    /// # Safety
    /// The local range must stay valid until its completion is polled.
    unsafe fn post_write(&mut self, wr: &RdmaWrite) -> Result<()>;

    /// Append any available completions to `out`.
    fn poll(&mut self, out: &mut Vec<WorkCompletion>) -> Result<()>;
}

/// Endpoint data exchanged between peers to complete a queue pair
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpEndpoint {
    pub qp_num: u32,
    pub lid: u16,
    pub gid: [u8; 16],
}

pub const ENDPOINT_SIZE: usize = 22;

impl QpEndpoint {
    pub fn to_bytes(&self) -> [u8; ENDPOINT_SIZE] {
        let mut buf = [0u8; ENDPOINT_SIZE];
        buf[0..4].copy_from_slice(&self.qp_num.to_le_bytes());
        buf[4..6].copy_from_slice(&self.lid.to_le_bytes());
        buf[6..22].copy_from_slice(&self.gid);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let buf: &[u8; ENDPOINT_SIZE] = buf.try_into().map_err(|_| {
            CommError::DecodeFailed(format!(
                "queue pair endpoint must be {ENDPOINT_SIZE} bytes, got {}",
                buf.len()
            ))
        })?;
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[6..22]);
        Ok(Self {
            qp_num: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            lid: u16::from_le_bytes([buf[4], buf[5]]),
            gid,
        })
    }
}
