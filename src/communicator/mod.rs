mod setup;
mod sync;

pub use sync::SyncCommunicator;

use crate::bootstrap::{Bootstrap, RendezvousRoot, UniqueId, address_magic};
use crate::config::CommConfig;
use crate::connection::{Connection, PendingConnection};
use crate::error::{CommError, Result};
use crate::memory::{self, RegisteredMemory};
use crate::platform::Platform;
use crate::transport::driver::IbDevice;
use crate::transport::{Transport, TransportFlags};
use crate::types::{Rank, Tag, host_hash};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// A rank's view of a fixed group of `size()` ranks.
///
/// Owns the rendezvous channel, the RDMA devices opened for registration,
/// the connection intents declared since the last setup and every
/// established connection. Collective operations take `&mut self`; the
/// connections it hands out are shared and usable from any task.
///
/// # Example
///
/// ```no_run
/// use fabriclink::{CommConfig, Communicator, Platform, Transport};
///
/// # async fn example() -> fabriclink::Result<()> {
/// let platform = Platform::loopback();
/// let mut comm =
///     Communicator::new(2, "127.0.0.1:29500", 0, platform, CommConfig::default()).await?;
/// let pending = comm.connect(1, 0, Transport::CudaIpc)?;
/// comm.connection_setup().await?;
/// let conn = pending.get()?;
/// # Ok(())
/// # }
/// ```
pub struct Communicator {
    pub(super) rank: Rank,
    pub(super) nranks: u32,
    pub(super) host_hash: u64,
    pub(super) bootstrap: Bootstrap,
    pub(super) platform: Platform,
    pub(super) config: CommConfig,
    /// Devices opened so far, keyed by their `IbN` transport.
    devices: Mutex<HashMap<Transport, Arc<dyn IbDevice>>>,
    /// Every local registration; released when the communicator drops.
    registered: Mutex<Vec<RegisteredMemory>>,
    /// Intents declared since the last `connection_setup`.
    pub(super) intents: Vec<PendingConnection>,
    pub(super) established: BTreeMap<(Rank, Tag), Arc<dyn Connection>>,
    /// Rendezvous root served by rank 0 when built from an address.
    _root: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl Communicator {
    /// Join a group of `nranks` ranks that rendezvous at `addr` (`"ip:port"`).
    ///
    /// Rank 0 binds `addr` and serves the rendezvous; every other rank
    /// retries until it is reachable or `config.connect_timeout` elapses.
    pub async fn new(
        nranks: u32,
        addr: &str,
        rank: Rank,
        platform: Platform,
        config: CommConfig,
    ) -> Result<Self> {
        check_rank(rank, nranks)?;
        let root_addr: SocketAddr = addr
            .parse()
            .map_err(|_| CommError::InvalidAddress(addr.to_string()))?;
        let magic = address_magic(addr);

        let root = if rank == 0 {
            Some(RendezvousRoot::bind(root_addr, magic).await?.spawn())
        } else {
            None
        };
        let bootstrap = Bootstrap::connect(root_addr, magic, rank, nranks, &config).await?;
        Ok(Self::assemble(bootstrap, platform, config, root))
    }

    /// Join the group identified by `id`, typically produced on one rank by
    /// [`get_unique_id`](crate::get_unique_id) and shipped out of band.
    pub async fn from_unique_id(
        nranks: u32,
        id: &UniqueId,
        rank: Rank,
        platform: Platform,
        config: CommConfig,
    ) -> Result<Self> {
        check_rank(rank, nranks)?;
        let root_addr = id.root_addr()?;
        let bootstrap = Bootstrap::connect(root_addr, id.magic(), rank, nranks, &config).await?;
        Ok(Self::assemble(bootstrap, platform, config, None))
    }

    fn assemble(
        bootstrap: Bootstrap,
        platform: Platform,
        config: CommConfig,
        root: Option<tokio::task::JoinHandle<Result<()>>>,
    ) -> Self {
        let rank = bootstrap.rank();
        let nranks = bootstrap.nranks();
        let host_hash = host_hash(&config);
        tracing::info!(rank, nranks, ?platform, "communicator ready");
        Self {
            rank,
            nranks,
            host_hash,
            bootstrap,
            platform,
            config,
            devices: Mutex::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
            intents: Vec::new(),
            established: BTreeMap::new(),
            _root: root,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> u32 {
        self.nranks
    }

    /// Identity of this rank's host; ranks with equal values may use `CudaIpc`.
    pub fn host_hash(&self) -> u64 {
        self.host_hash
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Allgather `size` bytes per rank over the rendezvous channel.
    ///
    /// `data` holds `size * size()` bytes; the caller's slot at
    /// `rank() * size` must be filled. Every slot is filled on return.
    pub async fn bootstrap_all_gather(&mut self, data: &mut [u8], size: usize) -> Result<()> {
        self.bootstrap.all_gather(data, size).await
    }

    /// Gather one byte string of any length from every rank, in rank order.
    pub async fn bootstrap_all_gather_bytes(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.bootstrap.all_gather_bytes(mine).await
    }

    pub async fn bootstrap_barrier(&mut self) -> Result<()> {
        self.bootstrap.barrier().await
    }

    fn device(&self, transport: Transport) -> Result<Arc<dyn IbDevice>> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| CommError::LockPoisoned("ib device cache"))?;
        if let Some(dev) = devices.get(&transport) {
            return Ok(Arc::clone(dev));
        }
        let dev = self.platform.open_ib_device(transport)?;
        tracing::debug!(rank = self.rank, %transport, device = dev.name(), "opened RDMA device");
        devices.insert(transport, Arc::clone(&dev));
        Ok(dev)
    }

    fn devices_for(
        &self,
        transports: TransportFlags,
    ) -> Result<Vec<(Transport, Arc<dyn IbDevice>)>> {
        transports
            .iter()
            .filter(|t| t.is_ib())
            .map(|t| Ok((t, self.device(t)?)))
            .collect()
    }

    /// Register `[ptr, ptr + size)` of device memory for `transports`.
    ///
    /// The communicator keeps the registration alive until it is dropped,
    /// so peers can keep writing after the returned handle goes away.
    ///
    /// # Safety
    /// The memory must stay allocated until this communicator and every
    /// returned handle are dropped, and while any peer's imported view of it
    /// is in use.
    pub unsafe fn register_memory(
        &self,
        ptr: u64,
        size: usize,
        transports: TransportFlags,
    ) -> Result<RegisteredMemory> {
        let devices = self.devices_for(transports)?;
        let mut registered = self
            .registered
            .lock()
            .map_err(|_| CommError::LockPoisoned("registered memory"))?;
        // SAFETY: forwarded from the caller.
        let mem = unsafe {
            memory::register(
                &self.platform,
                self.rank,
                self.host_hash,
                ptr,
                size,
                transports,
                &devices,
            )
        }?;
        registered.push(mem.clone());
        Ok(mem)
    }

    /// Number of registrations owned by this communicator.
    pub fn registered_count(&self) -> usize {
        self.registered.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Rebuild a peer's [`RegisteredMemory`] from its serialized form,
    /// mapping it locally when it lives on this host.
    pub fn deserialize_memory(&self, bytes: &[u8]) -> Result<RegisteredMemory> {
        RegisteredMemory::deserialize(bytes, &self.platform, self.host_hash)
    }

    /// Declare a connection to `remote` identified by `tag`, carried on the
    /// local `transport`. No I/O happens until
    /// [`connection_setup`](Self::connection_setup).
    ///
    /// The peer must declare the reverse intent with the same tag.
    pub fn connect(
        &mut self,
        remote: Rank,
        tag: Tag,
        transport: Transport,
    ) -> Result<PendingConnection> {
        check_rank(remote, self.nranks)?;
        if remote == self.rank {
            return Err(CommError::InvalidArgument(format!(
                "rank {remote} cannot connect to itself"
            )));
        }
        if transport.is_ib() {
            self.platform.ib_device_name(transport)?;
        }
        let declared = self
            .intents
            .iter()
            .any(|p| p.remote_rank() == remote && p.tag() == tag);
        if declared || self.established.contains_key(&(remote, tag)) {
            return Err(CommError::DuplicateIntent { remote, tag });
        }
        let pending = PendingConnection::new(remote, tag, transport);
        self.intents.push(pending.clone());
        Ok(pending)
    }

    /// Every established connection, ordered by `(remote, tag)`.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.established.values().cloned().collect()
    }

    pub fn connection(&self, remote: Rank, tag: Tag) -> Result<Arc<dyn Connection>> {
        self.established
            .get(&(remote, tag))
            .cloned()
            .ok_or(CommError::NotEstablished { remote, tag })
    }

    pub fn ib_device_count(&self) -> Result<usize> {
        self.platform.ib_device_count()
    }

    pub fn ib_device_name(&self, transport: Transport) -> Result<String> {
        self.platform.ib_device_name(transport)
    }

    pub fn ib_transport_by_device_name(&self, name: &str) -> Result<Transport> {
        self.platform.ib_transport_by_device_name(name)
    }
}

fn check_rank(rank: Rank, nranks: u32) -> Result<()> {
    if nranks == 0 {
        return Err(CommError::InvalidArgument(
            "a communicator needs at least one rank".into(),
        ));
    }
    if rank >= nranks {
        return Err(CommError::InvalidRank {
            rank,
            world_size: nranks,
        });
    }
    Ok(())
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.nranks)
            .field("platform", &self.platform)
            .field("pending", &self.intents.len())
            .field("established", &self.established.len())
            .field("registered", &self.registered_count())
            .finish()
    }
}
