//! Point-to-point data channels bound to one transport.
//!
//! A [`Connection`] copies bytes from local registered memory into a
//! peer's registered memory. `write` validates and posts; completion is
//! observed only through `flush`. Each variant documents its ordering:
//!
//! - [`IpcConnection`]: copies run on one device stream, strictly FIFO.
//! - [`IbConnection`]: RDMA WRITEs on one reliable-connected queue pair,
//!   executed in posting order.
//!
//! A connection whose transport reported a failure is broken for good;
//! every later call returns [`CommError::ConnectionBroken`].

pub(crate) mod ib;
pub(crate) mod ipc;

pub use ib::IbConnection;
pub use ipc::IpcConnection;

use crate::error::{CommError, Result};
use crate::memory::RegisteredMemory;
use crate::transport::Transport;
use crate::types::{Rank, Tag};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, OnceLock};

pub trait Connection: Send + Sync {
    /// Post a copy of `size` bytes from `src + src_offset` (local memory)
    /// to `dst + dst_offset` (the peer's memory). Returns without waiting
    /// for the copy; nothing is transferred if validation fails.
    ///
    /// When the transport's send queue is full, the calling thread blocks
    /// while earlier writes complete, for at most the configured completion
    /// poll timeout. Async callers that cannot tolerate this should keep
    /// fewer writes in flight than the queue depth between flushes.
    fn write(
        &self,
        dst: &RegisteredMemory,
        dst_offset: usize,
        src: &RegisteredMemory,
        src_offset: usize,
        size: usize,
    ) -> Result<()>;

    /// Resolves once every write posted before the call has completed at
    /// the destination.
    fn flush(&self) -> BoxFuture<'_, Result<()>>;

    fn transport(&self) -> Transport;

    fn remote_transport(&self) -> Transport;

    fn remote_rank(&self) -> Rank;

    fn tag(&self) -> Tag;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_rank", &self.remote_rank())
            .field("tag", &self.tag())
            .field("transport", &self.transport())
            .field("remote_transport", &self.remote_transport())
            .finish()
    }
}

/// Identity shared by every connection variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub local_rank: Rank,
    pub remote_rank: Rank,
    pub tag: Tag,
    pub transport: Transport,
    pub remote_transport: Transport,
}

fn check_range(side: &'static str, offset: usize, size: usize, limit: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(CommError::OutOfBounds {
            side,
            offset,
            size,
            limit,
        }),
    }
}

impl Endpoints {
    /// Precondition checks common to every variant's `write`.
    pub fn validate_write(
        &self,
        dst: &RegisteredMemory,
        dst_offset: usize,
        src: &RegisteredMemory,
        src_offset: usize,
        size: usize,
    ) -> Result<()> {
        check_range("destination", dst_offset, size, dst.size())?;
        check_range("source", src_offset, size, src.size())?;
        if !src.transports().contains(self.transport) {
            return Err(CommError::TransportNotSupported {
                transport: self.transport,
                what: "source memory",
            });
        }
        if !dst.transports().contains(self.remote_transport) {
            return Err(CommError::TransportNotSupported {
                transport: self.remote_transport,
                what: "destination memory",
            });
        }
        if src.rank() != self.local_rank || src.is_imported() {
            return Err(CommError::InvalidArgument(format!(
                "source memory must be registered by local rank {}, it belongs to rank {}",
                self.local_rank,
                src.rank()
            )));
        }
        if dst.rank() != self.remote_rank {
            return Err(CommError::InvalidArgument(format!(
                "destination memory belongs to rank {}, connection targets rank {}",
                dst.rank(),
                self.remote_rank
            )));
        }
        Ok(())
    }
}

/// A declared connection intent. Resolves to a live [`Connection`] once
/// [`Communicator::connection_setup`](crate::Communicator::connection_setup)
/// succeeds.
#[derive(Clone)]
pub struct PendingConnection {
    remote_rank: Rank,
    tag: Tag,
    transport: Transport,
    slot: Arc<OnceLock<Arc<dyn Connection>>>,
}

impl PendingConnection {
    pub(crate) fn new(remote_rank: Rank, tag: Tag, transport: Transport) -> Self {
        Self {
            remote_rank,
            tag,
            transport,
            slot: Arc::new(OnceLock::new()),
        }
    }

    pub fn remote_rank(&self) -> Rank {
        self.remote_rank
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_established(&self) -> bool {
        self.slot.get().is_some()
    }

    /// The established connection.
    pub fn get(&self) -> Result<Arc<dyn Connection>> {
        self.slot
            .get()
            .cloned()
            .ok_or(CommError::NotEstablished {
                remote: self.remote_rank,
                tag: self.tag,
            })
    }

    pub(crate) fn establish(&self, conn: Arc<dyn Connection>) {
        let _ = self.slot.set(conn);
    }
}

impl fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnection")
            .field("remote_rank", &self.remote_rank)
            .field("tag", &self.tag)
            .field("transport", &self.transport)
            .field("established", &self.is_established())
            .finish()
    }
}
