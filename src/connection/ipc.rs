use super::{Connection, Endpoints};
use crate::error::{CommError, Result};
use crate::memory::RegisteredMemory;
use crate::transport::Transport;
use crate::transport::driver::CopyStream;
use crate::types::{Rank, Tag};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// `CudaIpc` handle blob: offset of the region inside its allocation,
/// followed by the driver's export handle for the allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IpcMemoryHandle {
    pub offset: u64,
    pub handle: Vec<u8>,
}

impl IpcMemoryHandle {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.handle.len());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.handle);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() <= 8 {
            return Err(CommError::DecodeFailed(format!(
                "IPC handle blob too short: {} bytes",
                buf.len()
            )));
        }
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[..8]);
        Ok(Self {
            offset: u64::from_le_bytes(offset),
            handle: buf[8..].to_vec(),
        })
    }
}

/// Connection between two ranks on the same node over GPU IPC.
///
/// Writes are device-to-device copies into the destination's local IPC
/// mapping, queued on a dedicated stream. Ordering: strict FIFO; a write
/// completes after every write posted before it.
pub struct IpcConnection {
    ends: Endpoints,
    stream: Arc<Mutex<Box<dyn CopyStream>>>,
    broken: Arc<AtomicBool>,
}

impl IpcConnection {
    pub(crate) fn new(ends: Endpoints, stream: Box<dyn CopyStream>) -> Self {
        Self {
            ends,
            stream: Arc::new(Mutex::new(stream)),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken.load(Ordering::Acquire) {
            return Err(CommError::ConnectionBroken {
                remote: self.ends.remote_rank,
            });
        }
        Ok(())
    }
}

impl Connection for IpcConnection {
    fn write(
        &self,
        dst: &RegisteredMemory,
        dst_offset: usize,
        src: &RegisteredMemory,
        src_offset: usize,
        size: usize,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.ends
            .validate_write(dst, dst_offset, src, src_offset, size)?;
        if !dst.is_locally_mapped() {
            return Err(CommError::InvalidArgument(format!(
                "destination memory of rank {} is not mapped into this process",
                dst.rank()
            )));
        }
        if size == 0 {
            return Ok(());
        }

        let mut stream = self
            .stream
            .lock()
            .map_err(|_| CommError::LockPoisoned("ipc copy stream"))?;
        // SAFETY: both ranges were bounds-checked against live registrations;
        // the registration contract keeps the memory allocated.
        let posted = unsafe {
            stream.copy_async(
                dst.data() + dst_offset as u64,
                src.data() + src_offset as u64,
                size,
            )
        };
        if posted.is_err() {
            self.broken.store(true, Ordering::Release);
        }
        posted
    }

    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_usable()?;
            let stream = Arc::clone(&self.stream);
            let result = tokio::task::spawn_blocking(move || {
                stream
                    .lock()
                    .map_err(|_| CommError::LockPoisoned("ipc copy stream"))?
                    .synchronize()
            })
            .await
            .map_err(|e| CommError::transport_with_source("ipc flush task failed", e))
            .and_then(|r| r);
            if result.is_err() {
                self.broken.store(true, Ordering::Release);
            }
            result
        })
    }

    fn transport(&self) -> Transport {
        self.ends.transport
    }

    fn remote_transport(&self) -> Transport {
        self.ends.remote_transport
    }

    fn remote_rank(&self) -> Rank {
        self.ends.remote_rank
    }

    fn tag(&self) -> Tag {
        self.ends.tag
    }
}
