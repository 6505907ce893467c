use super::helpers::{Node, run_ranks};
use fabriclink::{
    CommError, Communicator, DeviceBuffer, RegisteredMemory, Transport, TransportFlags,
};
use std::sync::Arc;

const LEN: usize = 8192;

/// Register a fresh buffer filled with `fill` and return it with every
/// rank's buffer as seen from this one.
async fn exchange(
    comm: &mut Communicator,
    node: &Node,
    transports: TransportFlags,
    fill: u8,
) -> (DeviceBuffer, RegisteredMemory, Vec<RegisteredMemory>) {
    let buf = node.ipc.alloc(LEN).unwrap();
    buf.write(0, &vec![fill; LEN]).unwrap();
    let mem = unsafe { comm.register_memory(buf.ptr(), LEN, transports) }.unwrap();
    let all = comm
        .bootstrap_all_gather_bytes(&mem.serialize().unwrap())
        .await
        .unwrap();
    let peers = all
        .iter()
        .map(|b| comm.deserialize_memory(b).unwrap())
        .collect();
    (buf, mem, peers)
}

async fn round_trip(transport: Transport) {
    run_ranks(2, move |mut comm, node| async move {
        let rank = comm.rank();
        let peer = 1 - rank;
        let (buf, mem, peers) = exchange(
            &mut comm,
            &node,
            transport.into(),
            if rank == 0 { 0xab } else { 0 },
        )
        .await;
        let pending = comm.connect(peer, 0, transport).unwrap();
        comm.connection_setup().await.unwrap();
        let conn = pending.get().unwrap();

        if rank == 0 {
            conn.write(&peers[1], 0, &mem, 0, 4096).unwrap();
            conn.write(&peers[1], 4096, &mem, 100, 64).unwrap();
            conn.flush().await.unwrap();
        }
        comm.bootstrap_barrier().await.unwrap();
        if rank == 1 {
            assert_eq!(buf.read(0, 4096).unwrap(), vec![0xab; 4096]);
            assert_eq!(buf.read(4096, 64).unwrap(), vec![0xab; 64]);
            assert_eq!(buf.read(4160, LEN - 4160).unwrap(), vec![0; LEN - 4160]);
        }
        comm.bootstrap_barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_ipc_write_flush() {
    round_trip(Transport::CudaIpc).await;
}

#[tokio::test]
async fn test_ib_write_flush() {
    round_trip(Transport::Ib0).await;
}

#[tokio::test]
async fn test_bidirectional_ib_on_different_devices() {
    run_ranks(2, |mut comm, node| async move {
        let rank = comm.rank();
        let peer = 1 - rank;
        let local = if rank == 0 { Transport::Ib0 } else { Transport::Ib1 };
        let (buf, mem, peers) = exchange(
            &mut comm,
            &node,
            Transport::Ib0 | Transport::Ib1,
            rank as u8 + 1,
        )
        .await;
        let pending = comm.connect(peer, 9, local).unwrap();
        comm.connection_setup().await.unwrap();
        let conn = pending.get().unwrap();

        // Each rank fills the upper half of its peer's buffer.
        let half = LEN / 2;
        conn.write(&peers[peer as usize], half, &mem, 0, half).unwrap();
        conn.flush().await.unwrap();
        comm.bootstrap_barrier().await.unwrap();

        assert_eq!(buf.read(0, half).unwrap(), vec![rank as u8 + 1; half]);
        assert_eq!(buf.read(half, half).unwrap(), vec![peer as u8 + 1; half]);
        comm.bootstrap_barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_rejected_write_leaves_destination_untouched() {
    run_ranks(2, |mut comm, node| async move {
        let rank = comm.rank();
        let peer = 1 - rank;
        let flags = Transport::CudaIpc | Transport::Ib0;
        let (buf, mem, peers) = exchange(&mut comm, &node, flags, rank as u8 + 1).await;
        let ipc = comm.connect(peer, 0, Transport::CudaIpc).unwrap();
        let ib = comm.connect(peer, 1, Transport::Ib0).unwrap();
        comm.connection_setup().await.unwrap();

        if rank == 0 {
            let dst = &peers[1];
            for conn in [ipc.get().unwrap(), ib.get().unwrap()] {
                assert!(matches!(
                    conn.write(dst, LEN - 8, &mem, 0, 16),
                    Err(CommError::OutOfBounds {
                        side: "destination",
                        ..
                    })
                ));
                assert!(matches!(
                    conn.write(dst, 0, &mem, LEN, 1),
                    Err(CommError::OutOfBounds { side: "source", .. })
                ));
                assert!(matches!(
                    conn.write(dst, usize::MAX, &mem, 0, 2),
                    Err(CommError::OutOfBounds { .. })
                ));
                // Own memory as the destination targets the wrong rank.
                assert!(matches!(
                    conn.write(&peers[0], 0, &mem, 0, 8),
                    Err(CommError::InvalidArgument(_))
                ));
                conn.write(dst, 0, &mem, 0, 0).unwrap();
                conn.flush().await.unwrap();
            }
        }
        comm.bootstrap_barrier().await.unwrap();
        if rank == 1 {
            assert_eq!(buf.read(0, LEN).unwrap(), vec![2u8; LEN]);
        }
        comm.bootstrap_barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_memory_without_transport_is_rejected() {
    run_ranks(2, |mut comm, node| async move {
        let rank = comm.rank();
        let (_buf, mem, peers) = exchange(&mut comm, &node, Transport::CudaIpc.into(), 0).await;
        let pending = comm.connect(1 - rank, 0, Transport::Ib1).unwrap();
        comm.connection_setup().await.unwrap();
        let conn = pending.get().unwrap();
        let err = conn
            .write(&peers[(1 - rank) as usize], 0, &mem, 0, 8)
            .unwrap_err();
        assert!(
            matches!(
                err,
                CommError::TransportNotSupported {
                    transport: Transport::Ib1,
                    ..
                }
            ),
            "{err}"
        );
        comm.bootstrap_barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_later_writes_win() {
    run_ranks(2, |mut comm, node| async move {
        let rank = comm.rank();
        let (buf, mem, peers) = exchange(&mut comm, &node, Transport::Ib0.into(), 0).await;
        let pending = comm.connect(1 - rank, 0, Transport::Ib0).unwrap();
        comm.connection_setup().await.unwrap();
        let conn = pending.get().unwrap();

        if rank == 0 {
            for value in 1..=50u8 {
                buf.write(value as usize * 64, &[value; 64]).unwrap();
                conn.write(&peers[1], 0, &mem, value as usize * 64, 64)
                    .unwrap();
            }
            conn.flush().await.unwrap();
        }
        comm.bootstrap_barrier().await.unwrap();
        if rank == 1 {
            assert_eq!(buf.read(0, 64).unwrap(), vec![50u8; 64]);
        }
        comm.bootstrap_barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_peer_teardown_breaks_ib_connection() {
    let gate = Arc::new(tokio::sync::Barrier::new(2));
    let results = run_ranks(2, move |mut comm, node| {
        let gate = Arc::clone(&gate);
        async move {
            let rank = comm.rank();
            let (buf, mem, peers) = exchange(&mut comm, &node, Transport::Ib0.into(), 7).await;
            let pending = comm.connect(1 - rank, 0, Transport::Ib0).unwrap();
            comm.connection_setup().await.unwrap();

            if rank == 1 {
                // Tear down every connection but keep the memory registered.
                drop(pending);
                drop(comm);
                gate.wait().await;
                gate.wait().await;
                drop((buf, mem, peers));
                return None;
            }

            let conn = pending.get().unwrap();
            gate.wait().await;
            conn.write(&peers[1], 0, &mem, 0, 64).unwrap();
            let flushed = conn.flush().await;
            let rewrite = conn.write(&peers[1], 0, &mem, 0, 64);
            gate.wait().await;
            drop(buf);
            Some((flushed, rewrite))
        }
    })
    .await;

    let (flushed, rewrite) = results.into_iter().flatten().next().unwrap();
    assert!(matches!(flushed, Err(CommError::Transport { .. })), "{flushed:?}");
    assert!(matches!(
        rewrite,
        Err(CommError::ConnectionBroken { remote: 1 })
    ));
}

#[tokio::test]
async fn test_registration_outlives_dropped_handle() {
    run_ranks(2, |mut comm, node| async move {
        let rank = comm.rank();
        let (buf, mem, peers) = exchange(&mut comm, &node, Transport::Ib0.into(), 0x5a).await;
        let pending = comm.connect(1 - rank, 0, Transport::Ib0).unwrap();
        comm.connection_setup().await.unwrap();
        let conn = pending.get().unwrap();
        assert_eq!(comm.registered_count(), 1);

        if rank == 1 {
            // The communicator still holds the region.
            drop(mem);
            drop(peers);
            assert_eq!(buf.read(0, 256).unwrap(), vec![0x5a; 256]);
            comm.bootstrap_barrier().await.unwrap();
            comm.bootstrap_barrier().await.unwrap();
        } else {
            buf.write(0, &[0x11; 256]).unwrap();
            comm.bootstrap_barrier().await.unwrap();
            conn.write(&peers[1], 0, &mem, 0, 256).unwrap();
            conn.flush().await.unwrap();
            comm.bootstrap_barrier().await.unwrap();
        }
        comm.bootstrap_barrier().await.unwrap();
        if rank == 1 {
            assert_eq!(buf.read(0, 256).unwrap(), vec![0x11; 256]);
        }
        comm.bootstrap_barrier().await.unwrap();
    })
    .await;
}
