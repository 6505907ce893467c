use super::Communicator;
use crate::bootstrap::UniqueId;
use crate::config::CommConfig;
use crate::connection::{Connection, PendingConnection};
use crate::error::{CommError, Result};
use crate::memory::RegisteredMemory;
use crate::platform::Platform;
use crate::transport::{Transport, TransportFlags};
use crate::types::{Rank, Tag};
use std::sync::Arc;

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CommError::transport_with_source("tokio runtime", e))
}

/// Blocking wrapper around [`Communicator`].
///
/// Owns a `tokio::runtime::Runtime` and calls `block_on()` for each
/// collective. Must not be used from inside another tokio runtime.
pub struct SyncCommunicator {
    inner: Communicator,
    rt: tokio::runtime::Runtime,
}

impl SyncCommunicator {
    /// Blocking [`Communicator::new`].
    pub fn new(
        nranks: u32,
        addr: &str,
        rank: Rank,
        platform: Platform,
        config: CommConfig,
    ) -> Result<Self> {
        let rt = runtime()?;
        let inner = rt.block_on(Communicator::new(nranks, addr, rank, platform, config))?;
        Ok(Self { inner, rt })
    }

    /// Blocking [`Communicator::from_unique_id`].
    pub fn from_unique_id(
        nranks: u32,
        id: &UniqueId,
        rank: Rank,
        platform: Platform,
        config: CommConfig,
    ) -> Result<Self> {
        let rt = runtime()?;
        let inner = rt.block_on(Communicator::from_unique_id(
            nranks, id, rank, platform, config,
        ))?;
        Ok(Self { inner, rt })
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank()
    }

    pub fn size(&self) -> u32 {
        self.inner.size()
    }

    pub fn host_hash(&self) -> u64 {
        self.inner.host_hash()
    }

    pub fn bootstrap_all_gather(&mut self, data: &mut [u8], size: usize) -> Result<()> {
        self.rt
            .block_on(self.inner.bootstrap_all_gather(data, size))
    }

    pub fn bootstrap_all_gather_bytes(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.rt.block_on(self.inner.bootstrap_all_gather_bytes(mine))
    }

    pub fn bootstrap_barrier(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.bootstrap_barrier())
    }

    /// # Safety
    /// See [`Communicator::register_memory`].
    pub unsafe fn register_memory(
        &self,
        ptr: u64,
        size: usize,
        transports: TransportFlags,
    ) -> Result<RegisteredMemory> {
        unsafe { self.inner.register_memory(ptr, size, transports) }
    }

    pub fn deserialize_memory(&self, bytes: &[u8]) -> Result<RegisteredMemory> {
        self.inner.deserialize_memory(bytes)
    }

    pub fn connect(
        &mut self,
        remote: Rank,
        tag: Tag,
        transport: Transport,
    ) -> Result<PendingConnection> {
        self.inner.connect(remote, tag, transport)
    }

    pub fn connection_setup(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.connection_setup())
    }

    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.inner.connections()
    }

    pub fn connection(&self, remote: Rank, tag: Tag) -> Result<Arc<dyn Connection>> {
        self.inner.connection(remote, tag)
    }

    /// Block until every write posted on `conn` has completed.
    pub fn flush(&self, conn: &dyn Connection) -> Result<()> {
        self.rt.block_on(conn.flush())
    }

    pub fn ib_device_count(&self) -> Result<usize> {
        self.inner.ib_device_count()
    }

    pub fn ib_device_name(&self, transport: Transport) -> Result<String> {
        self.inner.ib_device_name(transport)
    }

    pub fn ib_transport_by_device_name(&self, name: &str) -> Result<Transport> {
        self.inner.ib_transport_by_device_name(name)
    }

    /// The wrapped async communicator.
    pub fn inner(&self) -> &Communicator {
        &self.inner
    }
}
