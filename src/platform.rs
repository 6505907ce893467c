use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::transport::driver::{Fabric, IbDevice, IpcDriver};
use crate::transport::loopback::{LoopbackFabric, LoopbackIpc};
use crate::transport::{MAX_IB_DEVICES, Transport};
use std::fmt;
use std::sync::Arc;

/// The GPU IPC driver and RDMA fabric a communicator works against.
///
/// Cheap to clone; every clone talks to the same backends.
#[derive(Clone)]
pub struct Platform {
    ipc: Arc<dyn IpcDriver>,
    fabric: Arc<dyn Fabric>,
}

impl Platform {
    pub fn new(ipc: Arc<dyn IpcDriver>, fabric: Arc<dyn Fabric>) -> Self {
        Self { ipc, fabric }
    }

    /// In-process backends. Only ranks sharing this value (or a clone of it)
    /// can reach each other's memory.
    pub fn loopback() -> Self {
        Self::new(
            Arc::new(LoopbackIpc::new()),
            Arc::new(LoopbackFabric::default()),
        )
    }

    /// Real backends for the enabled features, loopback for the rest.
    pub fn system(config: &CommConfig) -> Result<Self> {
        #[cfg(feature = "cuda")]
        let ipc: Arc<dyn IpcDriver> = Arc::new(crate::transport::cuda::CudaIpcDriver::new(0)?);
        #[cfg(not(feature = "cuda"))]
        let ipc: Arc<dyn IpcDriver> = Arc::new(LoopbackIpc::new());

        #[cfg(feature = "rdma")]
        let fabric: Arc<dyn Fabric> = Arc::new(crate::transport::verbs::VerbsFabric::new(config));
        #[cfg(not(feature = "rdma"))]
        let fabric: Arc<dyn Fabric> = {
            let _ = config;
            Arc::new(LoopbackFabric::default())
        };

        Ok(Self::new(ipc, fabric))
    }

    pub fn ipc(&self) -> &Arc<dyn IpcDriver> {
        &self.ipc
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    /// Number of locally usable RDMA devices (at most eight are addressable).
    pub fn ib_device_count(&self) -> Result<usize> {
        Ok(self.fabric.device_names()?.len().min(MAX_IB_DEVICES))
    }

    /// Name of the device behind an `IbN` transport.
    pub fn ib_device_name(&self, transport: Transport) -> Result<String> {
        let index = transport.ib_index().ok_or_else(|| {
            CommError::InvalidArgument(format!("{transport} is not an RDMA transport"))
        })?;
        self.fabric
            .device_names()?
            .into_iter()
            .nth(index)
            .ok_or_else(|| CommError::UnknownIbDevice(transport.to_string()))
    }

    /// The `IbN` transport addressing the device called `name`.
    pub fn ib_transport_by_device_name(&self, name: &str) -> Result<Transport> {
        self.fabric
            .device_names()?
            .iter()
            .position(|d| d == name)
            .and_then(Transport::ib)
            .ok_or_else(|| CommError::UnknownIbDevice(name.to_string()))
    }

    pub(crate) fn open_ib_device(&self, transport: Transport) -> Result<Arc<dyn IbDevice>> {
        let name = self.ib_device_name(transport)?;
        self.fabric.open_device(&name)
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("ipc", &self.ipc.name())
            .field("fabric", &self.fabric.name())
            .finish()
    }
}
