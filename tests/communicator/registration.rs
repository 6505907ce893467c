use super::helpers::{on_host, run_ranks, run_ranks_with};
use fabriclink::{CommError, Transport, TransportFlags};

#[tokio::test]
async fn test_exchange_same_host_maps_peer_memory() {
    run_ranks(3, |mut comm, node| async move {
        let rank = comm.rank();
        let buf = node.ipc.alloc(1024).unwrap();
        buf.write(0, &[rank as u8 + 1; 16]).unwrap();
        let mem = unsafe {
            comm.register_memory(buf.ptr(), buf.len(), Transport::CudaIpc | Transport::Ib0)
        }
        .unwrap();
        assert_eq!(mem.rank(), rank);
        assert_eq!(mem.size(), 1024);
        assert!(!mem.is_imported());

        let all = comm
            .bootstrap_all_gather_bytes(&mem.serialize().unwrap())
            .await
            .unwrap();
        for (peer, bytes) in all.iter().enumerate() {
            let remote = comm.deserialize_memory(bytes).unwrap();
            assert_eq!(remote.rank(), peer as u32);
            assert_eq!(remote.size(), 1024);
            assert_eq!(remote.transports(), Transport::CudaIpc | Transport::Ib0);
            assert!(remote.is_imported());
            assert!(remote.is_locally_mapped());
            assert_eq!(&remote.serialize().unwrap(), bytes);

            let mut first = [0u8; 16];
            unsafe {
                std::ptr::copy_nonoverlapping(remote.data() as *const u8, first.as_mut_ptr(), 16);
            }
            assert_eq!(first, [peer as u8 + 1; 16]);
        }
        // Peers may still be reading this rank's buffer.
        comm.bootstrap_barrier().await.unwrap();
        drop(mem);
    })
    .await;
}

#[tokio::test]
async fn test_cross_host_import_is_not_mapped() {
    run_ranks_with(
        2,
        |rank| on_host(&format!("host-{rank}")),
        |mut comm, node| async move {
            let buf = node.ipc.alloc(256).unwrap();
            let mem = unsafe {
                comm.register_memory(buf.ptr(), buf.len(), Transport::CudaIpc | Transport::Ib1)
            }
            .unwrap();
            let all = comm
                .bootstrap_all_gather_bytes(&mem.serialize().unwrap())
                .await
                .unwrap();
            let peer = 1 - comm.rank() as usize;
            let remote = comm.deserialize_memory(&all[peer]).unwrap();
            assert!(remote.is_imported());
            assert!(!remote.is_locally_mapped());
            assert_eq!(remote.data(), remote.original_data());
            assert_eq!(node.ipc.import_count(buf.ptr()), 0);
            comm.bootstrap_barrier().await.unwrap();
        },
    )
    .await;
}

#[tokio::test]
async fn test_registration_errors() {
    run_ranks(1, |comm, node| async move {
        let buf = node.ipc.alloc(64).unwrap();
        // The loopback fabric has two devices.
        let err = unsafe { comm.register_memory(buf.ptr(), 64, Transport::Ib5.into()) }.unwrap_err();
        assert!(matches!(err, CommError::UnknownIbDevice(_)), "{err}");

        let err = unsafe { comm.register_memory(buf.ptr(), 64, TransportFlags::NONE) }.unwrap_err();
        assert!(matches!(err, CommError::InvalidArgument(_)), "{err}");

        let host = vec![0u8; 64];
        let err = unsafe {
            comm.register_memory(host.as_ptr() as u64, host.len(), Transport::CudaIpc.into())
        }
        .unwrap_err();
        assert!(matches!(err, CommError::Registration { .. }), "{err}");

        assert!(comm.deserialize_memory(b"FLRM garbage").is_err());
        assert_eq!(node.fabric.live_regions(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_device_mapping() {
    run_ranks(1, |comm, _| async move {
        assert_eq!(comm.ib_device_count().unwrap(), 2);
        assert_eq!(comm.ib_device_name(Transport::Ib1).unwrap(), "lo_ib1");
        assert_eq!(
            comm.ib_transport_by_device_name("lo_ib0").unwrap(),
            Transport::Ib0
        );
        assert!(matches!(
            comm.ib_transport_by_device_name("mlx5_9"),
            Err(CommError::UnknownIbDevice(_))
        ));
    })
    .await;
}

#[tokio::test]
async fn test_regions_released_with_communicator() {
    run_ranks(1, |comm, node| async move {
        let buf = node.ipc.alloc(128).unwrap();
        let mem = unsafe { comm.register_memory(buf.ptr(), 128, Transport::Ib0.into()) }.unwrap();
        drop(mem);
        assert_eq!(comm.registered_count(), 1);
        assert_eq!(node.fabric.live_regions(), 1);
        drop(comm);
        assert_eq!(node.fabric.live_regions(), 0);
    })
    .await;
}
