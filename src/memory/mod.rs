//! GPU memory registered for remote access.
//!
//! A [`RegisteredMemory`] created by the owning rank holds the exported
//! transport resources (an IPC export, one RDMA memory region per `IbN`
//! transport). Peers obtain an equivalent handle only by deserializing the
//! bytes produced by [`RegisteredMemory::serialize`]. An imported handle
//! owns nothing but its local artifacts (an IPC mapping) and never releases
//! the owner's resources.
//!
//! # Security
//!
//! RDMA registration is page granular. A genuine IB handle grants access to
//! every page the region touches, including bytes outside the registered
//! range when the region does not fill whole pages. Deserialization does
//! not verify that the claimed owning rank is truthful, so envelopes must
//! only be accepted over a trusted channel such as the rendezvous channel.

mod envelope;

use crate::connection::ib::IbMemoryHandle;
use crate::connection::ipc::IpcMemoryHandle;
use crate::error::{CommError, Result};
use crate::platform::Platform;
use crate::transport::driver::{IbDevice, IbMemoryRegion, IpcDriver, IpcImport};
use crate::transport::{Transport, TransportFlags};
use crate::types::{PROTOCOL_VERSION, Rank};
use envelope::{HandleBlob, MemoryEnvelope};
use std::fmt;
use std::sync::Arc;

/// An IPC export taken for one registration, released on drop.
struct IpcExport {
    driver: Arc<dyn IpcDriver>,
    handle: Vec<u8>,
}

impl Drop for IpcExport {
    fn drop(&mut self) {
        self.driver.release(&self.handle);
    }
}

enum Resources {
    /// Registered by this process.
    Owned {
        regions: Vec<(Transport, Box<dyn IbMemoryRegion>)>,
        _export: Option<IpcExport>,
    },
    /// Deserialized from a peer's envelope.
    Imported { mapping: Option<Box<dyn IpcImport>> },
}

struct MemoryInner {
    envelope: MemoryEnvelope,
    /// Address usable in this process (the owner's address when the region
    /// is not mapped locally).
    data: u64,
    resources: Resources,
}

/// Handle over a registered GPU memory region. Clones share the underlying
/// resources; the last clone releases them.
#[derive(Clone)]
pub struct RegisteredMemory {
    inner: Arc<MemoryInner>,
}

impl RegisteredMemory {
    /// Local address of the first byte of the region.
    ///
    /// For an imported region that is not mapped into this process (a peer
    /// on another host, or one without `CudaIpc`) this is the owner's
    /// address and must not be dereferenced locally.
    pub fn data(&self) -> u64 {
        self.inner.data
    }

    /// Address of the region in the owning process.
    pub fn original_data(&self) -> u64 {
        self.inner.envelope.base
    }

    pub fn size(&self) -> usize {
        self.inner.envelope.size as usize
    }

    pub fn transports(&self) -> TransportFlags {
        self.inner.envelope.transports()
    }

    /// Rank that registered the memory.
    pub fn rank(&self) -> Rank {
        self.inner.envelope.rank
    }

    /// True for handles built by [`deserialize`](Self::deserialize).
    pub fn is_imported(&self) -> bool {
        matches!(self.inner.resources, Resources::Imported { .. })
    }

    /// True if [`data`](Self::data) is addressable from this process.
    pub fn is_locally_mapped(&self) -> bool {
        match &self.inner.resources {
            Resources::Owned { .. } => true,
            Resources::Imported { mapping } => mapping.is_some(),
        }
    }

    pub(crate) fn handle(&self, transport: Transport) -> Option<&[u8]> {
        self.inner.envelope.handle(transport)
    }

    /// The memory region registered on the device behind `transport`, when
    /// this process owns the registration.
    pub(crate) fn local_region(&self, transport: Transport) -> Option<&dyn IbMemoryRegion> {
        match &self.inner.resources {
            Resources::Owned { regions, .. } => regions
                .iter()
                .find(|(t, _)| *t == transport)
                .map(|(_, mr)| mr.as_ref()),
            Resources::Imported { .. } => None,
        }
    }

    /// Portable representation carrying size, transport set, owning rank
    /// and one handle blob per transport. Serializing an imported handle
    /// reproduces the owner's bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.inner.envelope.encode()
    }

    /// Rebuild a handle from [`serialize`](Self::serialize) output.
    ///
    /// If the region supports `CudaIpc` and was registered on this host
    /// (`local_host_hash`), its IPC handle is imported and [`data`](Self::data)
    /// points at the local mapping.
    pub fn deserialize(bytes: &[u8], platform: &Platform, local_host_hash: u64) -> Result<Self> {
        let envelope = MemoryEnvelope::decode(bytes)?;
        let transports = envelope.transports();

        for t in transports.iter().filter(|t| t.is_ib()) {
            let blob = envelope.handle(t).unwrap_or_default();
            IbMemoryHandle::from_bytes(blob)?;
        }

        let mut data = envelope.base;
        let mut mapping = None;
        if transports.contains(Transport::CudaIpc) && envelope.host_hash == local_host_hash {
            let blob = envelope.handle(Transport::CudaIpc).unwrap_or_default();
            let ipc = IpcMemoryHandle::from_bytes(blob)?;
            let import = platform.ipc().import(&ipc.handle)?;
            let in_range = ipc
                .offset
                .checked_add(envelope.size)
                .is_some_and(|end| end <= import.len() as u64);
            if !in_range {
                return Err(CommError::DecodeFailed(format!(
                    "region at offset {} of {} bytes exceeds its {}-byte allocation",
                    ipc.offset,
                    envelope.size,
                    import.len()
                )));
            }
            data = import.base() + ipc.offset;
            tracing::debug!(
                owner = envelope.rank,
                base = format_args!("0x{:x}", envelope.base),
                local = format_args!("0x{data:x}"),
                "imported IPC mapping"
            );
            mapping = Some(import);
        }

        Ok(Self {
            inner: Arc::new(MemoryInner {
                envelope,
                data,
                resources: Resources::Imported { mapping },
            }),
        })
    }
}

fn registration_error(transport: Transport, e: CommError) -> CommError {
    match e {
        CommError::Registration { .. } => e,
        other => CommError::registration_with_source(format!("{transport} registration failed"), other),
    }
}

/// Register `[ptr, ptr + size)` for `transports`.
///
/// `devices` must hold an opened device for every `IbN` in `transports`.
/// On failure every resource acquired so far is released.
///
/// # Safety
/// The memory must stay allocated for as long as the returned handle, any
/// clone of it, or any peer's imported view of it is alive.
pub(crate) unsafe fn register(
    platform: &Platform,
    rank: Rank,
    host_hash: u64,
    ptr: u64,
    size: usize,
    transports: TransportFlags,
    devices: &[(Transport, Arc<dyn IbDevice>)],
) -> Result<RegisteredMemory> {
    if transports.is_empty() {
        return Err(CommError::InvalidArgument(
            "memory must be registered for at least one transport".into(),
        ));
    }
    if size == 0 {
        return Err(CommError::InvalidArgument(
            "cannot register an empty region".into(),
        ));
    }
    let range = platform.ipc().query_range(ptr, size)?;

    let mut handles = Vec::with_capacity(transports.len());
    let mut regions: Vec<(Transport, Box<dyn IbMemoryRegion>)> = Vec::new();
    let mut export = None;
    for t in transports.iter() {
        let blob = if t.is_ib() {
            let device = devices
                .iter()
                .find(|(d, _)| *d == t)
                .map(|(_, dev)| dev)
                .ok_or_else(|| CommError::UnknownIbDevice(t.to_string()))?;
            // SAFETY: forwarded from the caller's contract.
            let mr = unsafe { device.register(ptr, size) }.map_err(|e| registration_error(t, e))?;
            let blob = IbMemoryHandle {
                addr: mr.addr(),
                rkey: mr.rkey(),
            }
            .to_bytes()
            .to_vec();
            regions.push((t, mr));
            blob
        } else {
            let handle = platform
                .ipc()
                .export(range.base)
                .map_err(|e| registration_error(t, e))?;
            let blob = IpcMemoryHandle {
                offset: ptr - range.base,
                handle: handle.clone(),
            }
            .to_bytes();
            export = Some(IpcExport {
                driver: Arc::clone(platform.ipc()),
                handle,
            });
            blob
        };
        handles.push(HandleBlob {
            transport: t.bit(),
            blob,
        });
    }

    tracing::debug!(
        rank,
        ptr = format_args!("0x{ptr:x}"),
        size,
        %transports,
        "registered memory"
    );

    Ok(RegisteredMemory {
        inner: Arc::new(MemoryInner {
            envelope: MemoryEnvelope {
                version: PROTOCOL_VERSION,
                rank,
                host_hash,
                base: ptr,
                size: size as u64,
                transports: transports.bits(),
                handles,
            },
            data: ptr,
            resources: Resources::Owned {
                regions,
                _export: export,
            },
        }),
    })
}

impl fmt::Debug for RegisteredMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMemory")
            .field("rank", &self.rank())
            .field("data", &format_args!("0x{:x}", self.data()))
            .field("size", &self.size())
            .field("transports", &self.transports())
            .field("imported", &self.is_imported())
            .finish()
    }
}

impl fmt::Display for RegisteredMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegisteredMemory(rank={}, ptr=0x{:x}, {}B, {})",
            self.rank(),
            self.original_data(),
            self.size(),
            self.transports()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{DeviceBuffer, LoopbackFabric, LoopbackIpc};

    struct Fixture {
        ipc: LoopbackIpc,
        fabric: LoopbackFabric,
        platform: Platform,
        devices: Vec<(Transport, Arc<dyn IbDevice>)>,
    }

    fn fixture() -> Fixture {
        let ipc = LoopbackIpc::new();
        let fabric = LoopbackFabric::default();
        let platform = Platform::new(Arc::new(ipc.clone()), Arc::new(fabric.clone()));
        let devices = [Transport::Ib0, Transport::Ib1]
            .into_iter()
            .map(|t| (t, platform.open_ib_device(t).unwrap()))
            .collect();
        Fixture {
            ipc,
            fabric,
            platform,
            devices,
        }
    }

    fn register_buf(
        fx: &Fixture,
        buf: &DeviceBuffer,
        transports: TransportFlags,
    ) -> Result<RegisteredMemory> {
        unsafe {
            register(
                &fx.platform,
                0,
                0xAAAA,
                buf.ptr(),
                buf.len(),
                transports,
                &fx.devices,
            )
        }
    }

    #[test]
    fn test_register_reports_properties() {
        let fx = fixture();
        let buf = fx.ipc.alloc(4096).unwrap();
        let mem = register_buf(&fx, &buf, Transport::CudaIpc | Transport::Ib0).unwrap();
        assert_eq!(mem.rank(), 0);
        assert_eq!(mem.size(), 4096);
        assert_eq!(mem.data(), buf.ptr());
        assert_eq!(mem.transports(), Transport::CudaIpc | Transport::Ib0);
        assert!(!mem.is_imported());
        assert!(mem.is_locally_mapped());
        assert!(mem.local_region(Transport::Ib0).is_some());
        assert!(mem.local_region(Transport::Ib1).is_none());
        assert_eq!(fx.fabric.live_regions(), 1);
        drop(mem);
        assert_eq!(fx.fabric.live_regions(), 0);
    }

    #[test]
    fn test_roundtrip_same_host_maps_same_bytes() {
        let fx = fixture();
        let buf = fx.ipc.alloc(256).unwrap();
        buf.write(0, b"registered").unwrap();
        let mem = register_buf(&fx, &buf, Transport::CudaIpc | Transport::Ib1).unwrap();

        let bytes = mem.serialize().unwrap();
        let remote = RegisteredMemory::deserialize(&bytes, &fx.platform, 0xAAAA).unwrap();
        assert!(remote.is_imported());
        assert!(remote.is_locally_mapped());
        assert_eq!(remote.size(), mem.size());
        assert_eq!(remote.transports(), mem.transports());
        assert_eq!(remote.rank(), 0);
        assert_eq!(fx.ipc.import_count(buf.ptr()), 1);

        let mut seen = vec![0u8; 10];
        unsafe {
            std::ptr::copy_nonoverlapping(remote.data() as *const u8, seen.as_mut_ptr(), 10);
        }
        assert_eq!(seen, b"registered");

        assert_eq!(remote.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_offset_into_allocation_survives_import() {
        let fx = fixture();
        let buf = fx.ipc.alloc(1024).unwrap();
        let mem = unsafe {
            register(
                &fx.platform,
                1,
                0xAAAA,
                buf.ptr() + 512,
                128,
                TransportFlags::from(Transport::CudaIpc),
                &fx.devices,
            )
        }
        .unwrap();
        let remote =
            RegisteredMemory::deserialize(&mem.serialize().unwrap(), &fx.platform, 0xAAAA).unwrap();
        assert_eq!(remote.data(), buf.ptr() + 512);
        assert_eq!(remote.original_data(), buf.ptr() + 512);
    }

    #[test]
    fn test_cross_host_is_not_mapped() {
        let fx = fixture();
        let buf = fx.ipc.alloc(64).unwrap();
        let mem = register_buf(&fx, &buf, Transport::CudaIpc | Transport::Ib0).unwrap();
        let remote =
            RegisteredMemory::deserialize(&mem.serialize().unwrap(), &fx.platform, 0xBBBB).unwrap();
        assert!(!remote.is_locally_mapped());
        assert_eq!(remote.data(), mem.original_data());
        assert_eq!(fx.ipc.import_count(buf.ptr()), 0);
        assert!(remote.handle(Transport::Ib0).is_some());
    }

    #[test]
    fn test_import_drop_releases_only_local_artifacts() {
        let fx = fixture();
        let buf = fx.ipc.alloc(64).unwrap();
        let mem = register_buf(&fx, &buf, Transport::CudaIpc | Transport::Ib0).unwrap();
        let bytes = mem.serialize().unwrap();
        let a = RegisteredMemory::deserialize(&bytes, &fx.platform, 0xAAAA).unwrap();
        let b = RegisteredMemory::deserialize(&bytes, &fx.platform, 0xAAAA).unwrap();
        assert_eq!(fx.ipc.import_count(buf.ptr()), 2);
        drop(a);
        assert_eq!(fx.ipc.import_count(buf.ptr()), 1);
        assert_eq!(fx.fabric.live_regions(), 1);
        drop(b);
        assert_eq!(fx.ipc.import_count(buf.ptr()), 0);
        assert_eq!(fx.fabric.live_regions(), 1);
        drop(mem);
        assert_eq!(fx.fabric.live_regions(), 0);
    }

    #[test]
    fn test_register_rejects_bad_requests() {
        let fx = fixture();
        let buf = fx.ipc.alloc(64).unwrap();
        assert!(matches!(
            register_buf(&fx, &buf, TransportFlags::NONE),
            Err(CommError::InvalidArgument(_))
        ));
        let host = vec![0u8; 64];
        let err = unsafe {
            register(
                &fx.platform,
                0,
                0,
                host.as_ptr() as u64,
                64,
                TransportFlags::from(Transport::Ib0),
                &fx.devices,
            )
        }
        .unwrap_err();
        assert!(matches!(err, CommError::Registration { .. }));
    }

    #[test]
    fn test_failed_registration_releases_acquired_regions() {
        let fx = fixture();
        let buf = fx.ipc.alloc(64).unwrap();
        // Ib0 succeeds, Ib3 has no opened device.
        let err = register_buf(&fx, &buf, Transport::Ib0 | Transport::Ib3).unwrap_err();
        assert!(matches!(err, CommError::UnknownIbDevice(_)));
        assert_eq!(fx.fabric.live_regions(), 0);

        let ok = register_buf(&fx, &buf, TransportFlags::from(Transport::Ib0)).unwrap();
        assert_eq!(ok.size(), 64);
    }

    #[test]
    fn test_export_released_with_last_owner() {
        let fx = fixture();
        let buf = fx.ipc.alloc(64).unwrap();
        let mem = register_buf(&fx, &buf, Transport::CudaIpc | Transport::Ib0).unwrap();
        let clone = mem.clone();
        assert_eq!(fx.ipc.export_count(buf.ptr()), 1);
        drop(mem);
        assert_eq!(fx.ipc.export_count(buf.ptr()), 1);
        drop(clone);
        assert_eq!(fx.ipc.export_count(buf.ptr()), 0);

        // CudaIpc is exported before Ib3 fails.
        let err = register_buf(&fx, &buf, Transport::CudaIpc | Transport::Ib3).unwrap_err();
        assert!(matches!(err, CommError::UnknownIbDevice(_)));
        assert_eq!(fx.ipc.export_count(buf.ptr()), 0);
    }

    #[test]
    fn test_deserialize_rejects_region_beyond_allocation() {
        let fx = fixture();
        let buf = fx.ipc.alloc(256).unwrap();
        let mem = register_buf(&fx, &buf, TransportFlags::from(Transport::CudaIpc)).unwrap();
        let original = MemoryEnvelope::decode(&mem.serialize().unwrap()).unwrap();

        let mut grown = original.clone();
        grown.size = 257;
        let mut shifted = original.clone();
        let ipc = IpcMemoryHandle::from_bytes(&shifted.handles[0].blob).unwrap();
        shifted.handles[0].blob = IpcMemoryHandle {
            offset: u64::MAX - 8,
            handle: ipc.handle,
        }
        .to_bytes();

        for env in [grown, shifted] {
            let err = RegisteredMemory::deserialize(&env.encode().unwrap(), &fx.platform, 0xAAAA)
                .unwrap_err();
            assert!(matches!(err, CommError::DecodeFailed(_)), "{err}");
        }
        assert_eq!(fx.ipc.import_count(buf.ptr()), 0);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let fx = fixture();
        assert!(RegisteredMemory::deserialize(b"nope", &fx.platform, 0).is_err());
        assert!(RegisteredMemory::deserialize(&[], &fx.platform, 0).is_err());
    }

    #[test]
    fn test_display() {
        let fx = fixture();
        let buf = fx.ipc.alloc(64).unwrap();
        let mem = register_buf(&fx, &buf, TransportFlags::from(Transport::Ib1)).unwrap();
        let s = mem.to_string();
        assert!(s.contains("rank=0"));
        assert!(s.contains("64B"));
        assert!(s.contains("Ib1"));
    }
}
