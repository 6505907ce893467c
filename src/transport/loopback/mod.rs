//! In-process test doubles for the GPU IPC driver and the RDMA fabric.
//!
//! Every rank of a test runs in one process and shares a single
//! [`LoopbackIpc`] / [`LoopbackFabric`] pair through a cloned
//! [`Platform`](crate::Platform).

mod fabric;
mod ipc;

pub use fabric::{LoopbackFabric, PAGE_SIZE};
pub use ipc::{DeviceBuffer, LoopbackIpc};
