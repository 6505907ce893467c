use super::{Connection, Endpoints};
use crate::error::{CommError, Result};
use crate::memory::RegisteredMemory;
use crate::transport::Transport;
use crate::transport::driver::{IbQueuePair, RdmaWrite, WorkCompletion};
use crate::types::{Rank, Tag};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Largest single RDMA WRITE; longer writes are split.
const MAX_WRITE_CHUNK: usize = 1 << 30;

pub(crate) const IB_HANDLE_SIZE: usize = 12;

/// `IbN` handle blob: the registered address and its remote key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IbMemoryHandle {
    pub addr: u64,
    pub rkey: u32,
}

impl IbMemoryHandle {
    pub fn to_bytes(&self) -> [u8; IB_HANDLE_SIZE] {
        let mut buf = [0u8; IB_HANDLE_SIZE];
        buf[..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..].copy_from_slice(&self.rkey.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != IB_HANDLE_SIZE {
            return Err(CommError::DecodeFailed(format!(
                "IB handle blob must be {IB_HANDLE_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let mut addr = [0u8; 8];
        let mut rkey = [0u8; 4];
        addr.copy_from_slice(&buf[..8]);
        rkey.copy_from_slice(&buf[8..]);
        Ok(Self {
            addr: u64::from_le_bytes(addr),
            rkey: u32::from_le_bytes(rkey),
        })
    }
}

struct QpState {
    qp: Box<dyn IbQueuePair>,
    outstanding: usize,
    next_wr_id: u64,
    completions: Vec<WorkCompletion>,
}

/// Connection over one reliable-connected RDMA queue pair.
///
/// Every write is a signaled RDMA WRITE; writes land in posting order.
/// `flush` polls the completion queue until nothing is outstanding.
///
/// `write` reaps completions inline once `capacity` writes are outstanding.
/// That wait runs on the caller's thread with the tiered backoff of
/// [`reap`] and is bounded by `poll_timeout`; `flush` does the same work on
/// a blocking task.
pub struct IbConnection {
    ends: Endpoints,
    state: Arc<Mutex<QpState>>,
    broken: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl IbConnection {
    pub(crate) fn new(ends: Endpoints, qp: Box<dyn IbQueuePair>, poll_timeout: Duration) -> Self {
        Self {
            ends,
            state: Arc::new(Mutex::new(QpState {
                qp,
                outstanding: 0,
                next_wr_id: 0,
                completions: Vec::new(),
            })),
            broken: Arc::new(AtomicBool::new(false)),
            poll_timeout,
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

    fn lock_state(state: &Mutex<QpState>) -> Result<MutexGuard<'_, QpState>> {
        state
            .lock()
            .map_err(|_| CommError::LockPoisoned("ib queue pair"))
    }

    fn post_chunks(
        state: &mut QpState,
        wr: RdmaWrite,
        size: usize,
        poll_timeout: Duration,
    ) -> Result<()> {
        let mut done = 0usize;
        while done < size {
            let len = (size - done).min(MAX_WRITE_CHUNK);
            let capacity = state.qp.capacity().max(1);
            if state.outstanding >= capacity {
                reap(state, capacity - 1, poll_timeout)?;
            }
            state.next_wr_id += 1;
            let chunk = RdmaWrite {
                wr_id: state.next_wr_id,
                local_addr: wr.local_addr + done as u64,
                len: len as u32,
                remote_addr: wr.remote_addr + done as u64,
                ..wr
            };
            // SAFETY: the caller validated both ranges against live
            // registrations.
            unsafe { state.qp.post_write(&chunk)? };
            state.outstanding += 1;
            done += len;
        }
        Ok(())
    }
}

/// Poll until at most `target` writes are outstanding.
///
/// Tiered backoff: spin for 1000 iterations, then sleep 10µs until 5000,
/// then sleep 100µs until `timeout`.
fn reap(state: &mut QpState, target: usize, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let mut iter = 0u32;
    while state.outstanding > target {
        state.completions.clear();
        state.qp.poll(&mut state.completions)?;
        for wc in state.completions.drain(..) {
            state.outstanding = state.outstanding.saturating_sub(1);
            if let Some(error) = wc.error {
                return Err(CommError::transport(format!(
                    "RDMA write completion failed (wr_id={}): {error}",
                    wc.wr_id
                )));
            }
        }
        if state.outstanding <= target {
            break;
        }
        if start.elapsed() > timeout {
            return Err(CommError::transport(format!(
                "RDMA completion poll timed out after {}ms with {} writes outstanding",
                timeout.as_millis(),
                state.outstanding
            )));
        }
        if iter < 1000 {
            std::hint::spin_loop();
        } else if iter < 5000 {
            std::thread::sleep(Duration::from_micros(10));
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
        iter = iter.saturating_add(1);
    }
    Ok(())
}

impl Connection for IbConnection {
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
        let remote = dst
            .handle(self.ends.remote_transport)
            .ok_or(CommError::TransportNotSupported {
                transport: self.ends.remote_transport,
                what: "destination memory",
            })
            .and_then(IbMemoryHandle::from_bytes)?;
        let lkey = src
            .local_region(self.ends.transport)
            .map(|mr| mr.lkey())
            .ok_or(CommError::TransportNotSupported {
                transport: self.ends.transport,
                what: "source memory",
            })?;
        if size == 0 {
            return Ok(());
        }

        let template = RdmaWrite {
            wr_id: 0,
            local_addr: src.data() + src_offset as u64,
            lkey,
            len: 0,
            remote_addr: remote.addr + dst_offset as u64,
            rkey: remote.rkey,
        };
        let mut guard = Self::lock_state(&self.state)?;
        let result = Self::post_chunks(&mut guard, template, size, self.poll_timeout);
        if result.is_err() {
            self.broken.store(true, Ordering::Release);
            tracing::warn!(
                remote = self.ends.remote_rank,
                tag = self.ends.tag,
                transport = %self.ends.transport,
                "RDMA write failed, connection is now broken"
            );
        }
        result
    }

    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_usable()?;
            let state = Arc::clone(&self.state);
            let timeout = self.poll_timeout;
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = Self::lock_state(&state)?;
                reap(&mut guard, 0, timeout)
            })
            .await
            .map_err(|e| CommError::transport_with_source("RDMA flush task failed", e))
            .and_then(|r| r);
            if let Err(e) = &result {
                self.broken.store(true, Ordering::Release);
                tracing::warn!(
                    remote = self.ends.remote_rank,
                    tag = self.ends.tag,
                    "RDMA flush failed: {e}"
                );
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
