//! RDMA fabric over raw `ibverbs-sys` FFI.
//!
//! One protection domain per opened device. Every queue pair gets its own
//! completion queue sized to its send queue, so polling a connection only
//! ever sees that connection's completions.

mod qp;

use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::transport::driver::{Fabric, IbDevice, IbMemoryRegion, IbQueuePair};
use ibverbs_sys::ibv_access_flags;
use std::ffi::CStr;
use std::os::raw::c_int;
use std::sync::Arc;

pub(super) fn access_flags() -> ibv_access_flags {
    ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ
}

/// Owned result of `ibv_get_device_list`.
struct DeviceList {
    list: *mut *mut ibverbs_sys::ibv_device,
    len: usize,
}

impl DeviceList {
    fn get() -> Result<Self> {
        let mut num: c_int = 0;
        // SAFETY: plain FFI call; the list is freed in Drop.
        let list = unsafe { ibverbs_sys::ibv_get_device_list(&mut num) };
        if list.is_null() {
            return Err(CommError::transport(format!(
                "RDMA: ibv_get_device_list failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            list,
            len: num.max(0) as usize,
        })
    }

    fn iter(&self) -> impl Iterator<Item = (*mut ibverbs_sys::ibv_device, String)> + '_ {
        (0..self.len).map(|i| {
            // SAFETY: i < len entries returned by the driver.
            let dev = unsafe { *self.list.add(i) };
            // SAFETY: the driver returns a NUL-terminated name for every device.
            let name = unsafe { CStr::from_ptr(ibverbs_sys::ibv_get_device_name(dev)) }
                .to_string_lossy()
                .into_owned();
            (dev, name)
        })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        // SAFETY: list came from ibv_get_device_list.
        unsafe { ibverbs_sys::ibv_free_device_list(self.list) };
    }
}

/// The host's RDMA devices, as reported by libibverbs.
pub struct VerbsFabric {
    port: u8,
    gid_index: u8,
    queue_depth: usize,
}

impl VerbsFabric {
    pub fn new(config: &CommConfig) -> Self {
        Self {
            port: config.ib_port,
            gid_index: config.ib_gid_index,
            queue_depth: config.ib_queue_depth.max(1),
        }
    }
}

impl Fabric for VerbsFabric {
    fn name(&self) -> &'static str {
        "ibverbs"
    }

    fn device_names(&self) -> Result<Vec<String>> {
        Ok(DeviceList::get()?.iter().map(|(_, name)| name).collect())
    }

    fn open_device(&self, name: &str) -> Result<Arc<dyn IbDevice>> {
        let list = DeviceList::get()?;
        let dev = list
            .iter()
            .find(|(_, n)| n == name)
            .map(|(dev, _)| dev)
            .ok_or_else(|| CommError::UnknownIbDevice(name.to_string()))?;

        // SAFETY: dev is a live entry of `list`, which outlives this call.
        let ctx = unsafe { ibverbs_sys::ibv_open_device(dev) };
        if ctx.is_null() {
            return Err(CommError::transport(format!(
                "RDMA: ibv_open_device({name}) failed"
            )));
        }
        // SAFETY: ctx was just opened.
        let pd = unsafe { ibverbs_sys::ibv_alloc_pd(ctx) };
        if pd.is_null() {
            // SAFETY: ctx is open and owns nothing yet.
            unsafe { ibverbs_sys::ibv_close_device(ctx) };
            return Err(CommError::transport(format!(
                "RDMA: ibv_alloc_pd({name}) failed"
            )));
        }
        tracing::debug!(device = name, port = self.port, "opened verbs device");

        Ok(Arc::new(VerbsDevice {
            inner: Arc::new(DeviceCtx {
                name: name.to_string(),
                ctx,
                pd,
            }),
            port: self.port,
            gid_index: self.gid_index,
            queue_depth: self.queue_depth,
        }))
    }
}

/// Device context and protection domain, released when the last device
/// handle, memory region and queue pair are gone.
pub(super) struct DeviceCtx {
    name: String,
    pub(super) ctx: *mut ibverbs_sys::ibv_context,
    pub(super) pd: *mut ibverbs_sys::ibv_pd,
}

unsafe impl Send for DeviceCtx {}
unsafe impl Sync for DeviceCtx {}

impl Drop for DeviceCtx {
    fn drop(&mut self) {
        // SAFETY: every MR and QP holds an Arc to this context, so none is
        // alive any more.
        unsafe {
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}

struct VerbsDevice {
    inner: Arc<DeviceCtx>,
    port: u8,
    gid_index: u8,
    queue_depth: usize,
}

impl IbDevice for VerbsDevice {
    fn name(&self) -> &str {
        &self.inner.name
    }

    unsafe fn register(&self, ptr: u64, size: usize) -> Result<Box<dyn IbMemoryRegion>> {
        // SAFETY: the caller keeps [ptr, ptr + size) allocated for the
        // region's lifetime.
        let mr = unsafe {
            ibverbs_sys::ibv_reg_mr(
                self.inner.pd,
                ptr as *mut _,
                size,
                access_flags().0 as c_int,
            )
        };
        if mr.is_null() {
            return Err(CommError::registration(format!(
                "RDMA: ibv_reg_mr failed on {} for 0x{ptr:x}+{size}: {}",
                self.inner.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(Box::new(VerbsMr {
            mr,
            addr: ptr,
            size,
            _device: Arc::clone(&self.inner),
        }))
    }

    fn create_qp(&self) -> Result<Box<dyn IbQueuePair>> {
        let qp = qp::VerbsQp::create(
            Arc::clone(&self.inner),
            self.port,
            self.gid_index,
            self.queue_depth,
        )?;
        Ok(Box::new(qp))
    }
}

struct VerbsMr {
    mr: *mut ibverbs_sys::ibv_mr,
    addr: u64,
    size: usize,
    _device: Arc<DeviceCtx>,
}

unsafe impl Send for VerbsMr {}
unsafe impl Sync for VerbsMr {}

impl IbMemoryRegion for VerbsMr {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn size(&self) -> usize {
        self.size
    }

    fn lkey(&self) -> u32 {
        // SAFETY: mr stays registered until Drop.
        unsafe { (*self.mr).lkey }
    }

    fn rkey(&self) -> u32 {
        // SAFETY: mr stays registered until Drop.
        unsafe { (*self.mr).rkey }
    }
}

impl Drop for VerbsMr {
    fn drop(&mut self) {
        if !self.mr.is_null() {
            // SAFETY: mr came from ibv_reg_mr and is deregistered once.
            unsafe { ibverbs_sys::ibv_dereg_mr(self.mr) };
        }
    }
}
