use super::helpers::{on_host, run_ranks, run_ranks_with};
use fabriclink::{CommError, Transport};

#[tokio::test]
async fn test_ring_of_mixed_connections() {
    let counts = run_ranks(4, |mut comm, _| async move {
        let rank = comm.rank();
        let n = comm.size();
        let next = (rank + 1) % n;
        let prev = (rank + n - 1) % n;
        // Tag 0: IPC to both neighbours. Tag 1: RDMA, each rank on its own device.
        let ib = if rank % 2 == 0 { Transport::Ib0 } else { Transport::Ib1 };
        let mut pending = vec![
            comm.connect(next, 0, Transport::CudaIpc).unwrap(),
            comm.connect(prev, 0, Transport::CudaIpc).unwrap(),
            comm.connect(next, 1, ib).unwrap(),
            comm.connect(prev, 1, ib).unwrap(),
        ];
        assert!(pending.iter().all(|p| !p.is_established()));
        assert!(matches!(
            pending[0].get(),
            Err(CommError::NotEstablished { tag: 0, .. })
        ));

        comm.connection_setup().await.unwrap();

        for p in pending.drain(..) {
            let conn = p.get().unwrap();
            assert_eq!(conn.remote_rank(), p.remote_rank());
            assert_eq!(conn.tag(), p.tag());
            assert_eq!(conn.transport(), p.transport());
            if p.tag() == 1 {
                let peer_ib = if p.remote_rank() % 2 == 0 {
                    Transport::Ib0
                } else {
                    Transport::Ib1
                };
                assert_eq!(conn.remote_transport(), peer_ib);
            } else {
                assert_eq!(conn.remote_transport(), Transport::CudaIpc);
            }
        }
        assert_eq!(comm.connection(next, 1).unwrap().transport(), ib);
        assert!(matches!(
            comm.connection(next, 7),
            Err(CommError::NotEstablished { tag: 7, .. })
        ));
        comm.connections().len()
    })
    .await;
    assert_eq!(counts, vec![4, 4, 4, 4]);
}

#[tokio::test]
async fn test_one_sided_intent_fails_everywhere() {
    let errors = run_ranks(3, |mut comm, _| async move {
        let pending = if comm.rank() == 0 {
            Some(comm.connect(2, 5, Transport::CudaIpc).unwrap())
        } else {
            None
        };
        let err = comm.connection_setup().await.unwrap_err();
        if let Some(p) = pending {
            assert!(!p.is_established());
        }
        // Intents were consumed; an empty round succeeds.
        comm.connection_setup().await.unwrap();
        assert!(comm.connections().is_empty());
        err.to_string()
    })
    .await;
    assert!(errors[0].contains("no matching declaration"), "{}", errors[0]);
    assert!(errors.iter().all(|e| e == &errors[0]));
}

#[tokio::test]
async fn test_transport_kind_mismatch() {
    run_ranks(2, |mut comm, _| async move {
        let t = if comm.rank() == 0 {
            Transport::CudaIpc
        } else {
            Transport::Ib0
        };
        comm.connect(1 - comm.rank(), 0, t).unwrap();
        let err = comm.connection_setup().await.unwrap_err();
        assert!(
            matches!(
                err,
                CommError::TransportMismatch {
                    rank: 0,
                    remote: 1,
                    local: Transport::CudaIpc,
                    remote_transport: Transport::Ib0,
                    ..
                }
            ),
            "{err}"
        );
    })
    .await;
}

#[tokio::test]
async fn test_ipc_across_hosts_rejected() {
    run_ranks_with(
        2,
        |rank| on_host(&format!("node{rank}")),
        |mut comm, _| async move {
            let peer = 1 - comm.rank();
            comm.connect(peer, 0, Transport::CudaIpc).unwrap();
            let err = comm.connection_setup().await.unwrap_err();
            assert!(
                matches!(err, CommError::ConnectionSetup { rank: 0, .. }),
                "{err}"
            );

            // RDMA does not care about hosts.
            let pending = comm.connect(peer, 0, Transport::Ib1).unwrap();
            comm.connection_setup().await.unwrap();
            assert!(pending.is_established());
        },
    )
    .await;
}

#[tokio::test]
async fn test_connect_validation() {
    run_ranks(2, |mut comm, _| async move {
        let rank = comm.rank();
        let peer = 1 - rank;
        assert!(matches!(
            comm.connect(rank, 0, Transport::CudaIpc),
            Err(CommError::InvalidArgument(_))
        ));
        assert!(matches!(
            comm.connect(2, 0, Transport::CudaIpc),
            Err(CommError::InvalidRank { rank: 2, .. })
        ));
        assert!(matches!(
            comm.connect(peer, 0, Transport::Ib6),
            Err(CommError::UnknownIbDevice(_))
        ));

        comm.connect(peer, 3, Transport::Ib0).unwrap();
        assert!(matches!(
            comm.connect(peer, 3, Transport::CudaIpc),
            Err(CommError::DuplicateIntent { tag: 3, .. })
        ));
        comm.connection_setup().await.unwrap();

        // Still taken once established.
        assert!(matches!(
            comm.connect(peer, 3, Transport::Ib1),
            Err(CommError::DuplicateIntent { tag: 3, .. })
        ));
        comm.connect(peer, 4, Transport::Ib1).unwrap();
        comm.connection_setup().await.unwrap();
        assert_eq!(comm.connections().len(), 2);
    })
    .await;
}
