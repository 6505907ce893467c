//! GPU IPC over the CUDA driver API (cudarc 0.19).
//!
//! Export handles are the 64-byte `CUipcMemHandle`. The driver refuses to
//! open a handle in the process that exported it, so handles exported by
//! this driver are resolved from a local table instead.

use crate::error::{CommError, Result};
use crate::transport::driver::{AllocationRange, CopyStream, IpcDriver, IpcImport};
use cudarc::driver::sys::{CUdeviceptr, CUipcMemHandle};
use cudarc::driver::{CudaContext, CudaStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const HANDLE_BYTES: usize = 64;

fn cuda_err(what: &str, e: cudarc::driver::DriverError) -> CommError {
    CommError::transport(format!("{what} failed: {e}"))
}

fn handle_bytes(handle: &CUipcMemHandle) -> Vec<u8> {
    handle.reserved.iter().map(|&c| c as u8).collect()
}

fn handle_from_bytes(bytes: &[u8]) -> Result<CUipcMemHandle> {
    if bytes.len() != HANDLE_BYTES {
        return Err(CommError::DecodeFailed(format!(
            "CUDA IPC handle must be {HANDLE_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    // SAFETY: CUipcMemHandle is plain bytes.
    let mut handle: CUipcMemHandle = unsafe { std::mem::zeroed() };
    for (dst, &src) in handle.reserved.iter_mut().zip(bytes) {
        *dst = src as _;
    }
    Ok(handle)
}

struct Export {
    range: AllocationRange,
    refs: usize,
}

/// [`IpcDriver`] for one CUDA device.
pub struct CudaIpcDriver {
    ctx: Arc<CudaContext>,
    /// Handles exported by this process, by handle bytes.
    exports: Mutex<HashMap<Vec<u8>, Export>>,
}

impl CudaIpcDriver {
    pub fn new(device_ordinal: u32) -> Result<Self> {
        let ctx = CudaContext::new(device_ordinal as usize).map_err(|e| {
            CommError::transport(format!(
                "failed to create CUDA context for GPU {device_ordinal}: {e}"
            ))
        })?;
        Ok(Self {
            ctx,
            exports: Mutex::new(HashMap::new()),
        })
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| cuda_err("CUDA bind_to_thread", e))
    }

    fn exports(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Vec<u8>, Export>>> {
        self.exports
            .lock()
            .map_err(|_| CommError::LockPoisoned("cuda export table"))
    }
}

/// Base and length of the allocation containing `ptr`. The context must be
/// bound.
fn address_range(ptr: u64) -> std::result::Result<AllocationRange, cudarc::driver::DriverError> {
    let mut base: CUdeviceptr = 0;
    let mut len: usize = 0;
    // SAFETY: out-parameters are valid locals.
    unsafe { cudarc::driver::sys::cuMemGetAddressRange_v2(&mut base, &mut len, ptr as CUdeviceptr) }
        .result()?;
    Ok(AllocationRange {
        base: base as u64,
        len,
    })
}

impl IpcDriver for CudaIpcDriver {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn query_range(&self, ptr: u64, size: usize) -> Result<AllocationRange> {
        self.bind()?;
        let range = address_range(ptr)
            .map_err(|e| CommError::registration(format!("0x{ptr:x} is not device memory: {e}")))?;
        if !range.covers(ptr, size) {
            return Err(CommError::registration(format!(
                "0x{ptr:x}+{size} spans beyond its allocation 0x{:x}+{}",
                range.base, range.len
            )));
        }
        Ok(range)
    }

    fn export(&self, base: u64) -> Result<Vec<u8>> {
        self.bind()?;
        // SAFETY: zeroed handle is a valid out-parameter.
        let mut handle: CUipcMemHandle = unsafe { std::mem::zeroed() };
        unsafe { cudarc::driver::sys::cuIpcGetMemHandle(&mut handle, base as CUdeviceptr) }
            .result()
            .map_err(|e| cuda_err("cuIpcGetMemHandle", e))?;
        let range = address_range(base).map_err(|e| cuda_err("cuMemGetAddressRange", e))?;
        let bytes = handle_bytes(&handle);
        self.exports()?
            .entry(bytes.clone())
            .or_insert(Export { range, refs: 0 })
            .refs += 1;
        Ok(bytes)
    }

    fn release(&self, handle: &[u8]) {
        let Ok(mut exports) = self.exports() else {
            return;
        };
        if let Some(export) = exports.get_mut(handle) {
            export.refs -= 1;
            if export.refs == 0 {
                exports.remove(handle);
            }
        }
    }

    fn import(&self, handle: &[u8]) -> Result<Box<dyn IpcImport>> {
        if let Some(export) = self.exports()?.get(handle) {
            return Ok(Box::new(CudaImport {
                base: export.range.base,
                len: export.range.len,
                opened: false,
            }));
        }

        let raw = handle_from_bytes(handle)?;
        self.bind()?;
        let mut base: CUdeviceptr = 0;
        let flags = cudarc::driver::sys::CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as u32;
        // SAFETY: out-parameter is a valid local; the handle came from a peer.
        unsafe { cudarc::driver::sys::cuIpcOpenMemHandle_v2(&mut base, raw, flags) }
            .result()
            .map_err(|e| cuda_err("cuIpcOpenMemHandle", e))?;
        // Built first so a failed range query still closes the mapping.
        let mut import = CudaImport {
            base: base as u64,
            len: 0,
            opened: true,
        };
        import.len = address_range(import.base)
            .map_err(|e| cuda_err("cuMemGetAddressRange", e))?
            .len;
        Ok(Box::new(import))
    }

    fn create_stream(&self) -> Result<Box<dyn CopyStream>> {
        let stream = self
            .ctx
            .new_stream()
            .map_err(|e| cuda_err("cuStreamCreate", e))?;
        Ok(Box::new(CudaCopyStream {
            ctx: Arc::clone(&self.ctx),
            stream,
        }))
    }
}

struct CudaImport {
    base: u64,
    len: usize,
    /// False for handles resolved from this process's own exports.
    opened: bool,
}

impl IpcImport for CudaImport {
    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for CudaImport {
    fn drop(&mut self) {
        if self.opened {
            // SAFETY: base came from cuIpcOpenMemHandle and is closed once.
            let rc = unsafe { cudarc::driver::sys::cuIpcCloseMemHandle(self.base as CUdeviceptr) };
            if let Err(e) = rc.result() {
                tracing::warn!(
                    base = format_args!("0x{:x}", self.base),
                    "cuIpcCloseMemHandle failed: {e}"
                );
            }
        }
    }
}

struct CudaCopyStream {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CopyStream for CudaCopyStream {
    unsafe fn copy_async(&mut self, dst: u64, src: u64, len: usize) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| cuda_err("CUDA bind_to_thread", e))?;
        // SAFETY: the caller keeps both ranges valid until synchronize.
        unsafe {
            cudarc::driver::result::memcpy_dtod_async(
                dst as CUdeviceptr,
                src as CUdeviceptr,
                len,
                self.stream.cu_stream(),
            )
        }
        .map_err(|e| cuda_err("cuMemcpyDtoDAsync", e))
    }

    fn synchronize(&mut self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| cuda_err("CUDA bind_to_thread", e))?;
        // SAFETY: the stream is owned by this struct.
        unsafe { cudarc::driver::result::stream::synchronize(self.stream.cu_stream()) }
            .map_err(|e| cuda_err("cuStreamSynchronize", e))
    }
}
