//! Rendezvous, memory registration and point-to-point connections for
//! multi-GPU communication.
//!
//! A [`Communicator`] joins a fixed group of ranks through a TCP rendezvous,
//! registers device memory for GPU IPC and RDMA, exchanges serialized
//! [`RegisteredMemory`] handles and sets up [`Connection`]s that copy
//! bytes into a peer's registered memory.
//!
//! # Features
//!
//! - **rdma**: real RDMA fabric over ibverbs (InfiniBand/RoCE)
//! - **cuda**: real GPU IPC over the CUDA driver API
//!
//! Without them, [`Platform::loopback`] backends run every rank inside one
//! process, which is what the tests use.

pub mod bootstrap;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod platform;
pub mod transport;
pub mod types;

pub use bootstrap::{RendezvousRoot, UNIQUE_ID_BYTES, UniqueId, get_unique_id, spawn_root_thread};
pub use communicator::{Communicator, SyncCommunicator};
pub use config::CommConfig;
pub use connection::{Connection, IbConnection, IpcConnection, PendingConnection};
pub use error::{CommError, Result};
pub use memory::RegisteredMemory;
pub use platform::Platform;
pub use transport::loopback::{DeviceBuffer, LoopbackFabric, LoopbackIpc};
pub use transport::{MAX_IB_DEVICES, Transport, TransportFlags};
pub use types::{PROTOCOL_VERSION, Rank, Tag, host_hash};
