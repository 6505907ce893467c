use super::helpers::{free_addr, run_ranks};
use fabriclink::{CommConfig, CommError, Communicator, Platform, UniqueId, get_unique_id};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn pattern(rank: u32, i: usize) -> u8 {
    (rank as usize * 31 + i * 7) as u8
}

#[tokio::test]
async fn test_all_gather_sizes_and_rank_counts() {
    for n in [2u32, 4, 8] {
        for size in [1usize, 64, 4096] {
            run_ranks(n, move |mut comm, _| async move {
                let rank = comm.rank();
                let mut data = vec![0u8; size * n as usize];
                for i in 0..size {
                    data[rank as usize * size + i] = pattern(rank, i);
                }
                comm.bootstrap_all_gather(&mut data, size).await.unwrap();
                for r in 0..n {
                    for i in 0..size {
                        assert_eq!(data[r as usize * size + i], pattern(r, i), "n={n} size={size}");
                    }
                }
            })
            .await;
        }
    }
}

#[tokio::test]
async fn test_all_gather_bytes_variable_lengths() {
    let gathered = run_ranks(4, |mut comm, _| async move {
        let mine = vec![comm.rank() as u8 + 1; comm.rank() as usize * 100];
        comm.bootstrap_all_gather_bytes(&mine).await.unwrap()
    })
    .await;
    for per_rank in gathered {
        for (r, bytes) in per_rank.iter().enumerate() {
            assert_eq!(bytes, &vec![r as u8 + 1; r * 100]);
        }
    }
}

#[tokio::test]
async fn test_barrier_waits_for_every_rank() {
    let entered = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&entered);
    run_ranks(4, move |mut comm, _| {
        let counter = Arc::clone(&counter);
        async move {
            // Stagger arrivals so a broken barrier would be observable.
            tokio::time::sleep(std::time::Duration::from_millis(10 * comm.rank() as u64)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            comm.bootstrap_barrier().await.unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 4);
        }
    })
    .await;
    assert_eq!(entered.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_rank_and_size() {
    let ranks = run_ranks(3, |comm, _| async move { (comm.rank(), comm.size()) }).await;
    assert_eq!(ranks, vec![(0, 3), (1, 3), (2, 3)]);
}

#[tokio::test]
async fn test_wrong_buffer_size_rejected() {
    run_ranks(2, |mut comm, _| async move {
        let mut data = vec![0u8; 5];
        assert!(matches!(
            comm.bootstrap_all_gather(&mut data, 4).await,
            Err(CommError::BufferSizeMismatch {
                expected: 8,
                actual: 5
            })
        ));
        // Rejected before any traffic, so the channel still works.
        comm.bootstrap_barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_address_constructor() {
    let addr = free_addr();
    let mut handles = Vec::new();
    let platform = Platform::loopback();
    for rank in 0..3 {
        let addr = addr.clone();
        let platform = platform.clone();
        handles.push(tokio::spawn(async move {
            let mut comm = Communicator::new(3, &addr, rank, platform, CommConfig::default())
                .await
                .unwrap();
            let mut data = vec![0u8; 3];
            data[rank as usize] = rank as u8 + 10;
            comm.bootstrap_all_gather(&mut data, 1).await.unwrap();
            data
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap(), vec![10, 11, 12]);
    }
}

#[tokio::test]
async fn test_invalid_construction_fails_before_io() {
    let platform = Platform::loopback();
    assert!(matches!(
        Communicator::new(2, "127.0.0.1", 0, platform.clone(), CommConfig::default()).await,
        Err(CommError::InvalidAddress(_))
    ));
    assert!(matches!(
        Communicator::new(2, "127.0.0.1:1", 2, platform, CommConfig::default()).await,
        Err(CommError::InvalidRank {
            rank: 2,
            world_size: 2
        })
    ));
}

#[tokio::test]
async fn test_unique_id_mismatch_rejected() {
    let config = CommConfig::default();
    let id = get_unique_id(&config).await.unwrap();
    let mut forged = *id.as_bytes();
    forged[0] ^= 0xff;
    let forged = UniqueId::from_bytes(&forged).unwrap();
    assert_eq!(forged.root_addr().unwrap(), id.root_addr().unwrap());

    let err = Communicator::from_unique_id(2, &forged, 1, Platform::loopback(), config)
        .await
        .unwrap_err();
    assert!(matches!(err, CommError::UniqueIdMismatch), "{err}");
}

#[tokio::test]
async fn test_rank_count_mismatch_rejected_and_root_keeps_waiting() {
    let config = CommConfig::default();
    let id = get_unique_id(&config).await.unwrap();
    let platform = Platform::loopback();

    let first = {
        let platform = platform.clone();
        let config = config.clone();
        tokio::spawn(async move { Communicator::from_unique_id(2, &id, 0, platform, config).await })
    };
    // Let rank 0 fix the group size first.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let err = Communicator::from_unique_id(3, &id, 1, platform.clone(), config.clone())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            CommError::RankMismatch {
                expected: 2,
                actual: 3
            }
        ),
        "{err}"
    );

    let second = Communicator::from_unique_id(2, &id, 1, platform, config)
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();
    assert_eq!((first.rank(), second.rank()), (0, 1));
}
