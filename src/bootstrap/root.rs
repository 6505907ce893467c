use super::frame::{recv_control, send_control};
use super::message::{BootstrapMessage, RejectReason};
use super::unique_id::{UniqueId, fresh_magic};
use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::types::{PROTOCOL_VERSION, Rank};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// How long the root waits for a freshly accepted connection to check in.
const CHECK_IN_TIMEOUT: Duration = Duration::from_secs(30);

/// The rendezvous root: collects one check-in per rank, then tells every
/// rank the ring address of its successor.
///
/// Invalid check-ins (wrong magic, wrong rank count, duplicate or
/// out-of-range rank, other protocol version) are answered with a
/// `Reject` and the root keeps waiting for legitimate ranks.
pub struct RendezvousRoot {
    listener: TcpListener,
    addr: SocketAddr,
    magic: u64,
}

impl RendezvousRoot {
    pub async fn bind(addr: SocketAddr, magic: u64) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(listener, magic)
    }

    fn from_listener(listener: TcpListener, magic: u64) -> Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            magic,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn unique_id(&self) -> UniqueId {
        UniqueId::new(self.magic, self.addr)
    }

    fn vet(
        &self,
        msg: &BootstrapMessage,
        expected: Option<u32>,
        joined: &BTreeMap<Rank, (TcpStream, String)>,
    ) -> std::result::Result<(Rank, u32, String), Option<RejectReason>> {
        let BootstrapMessage::CheckIn {
            protocol_version,
            magic,
            rank,
            nranks,
            ring_addr,
        } = msg
        else {
            return Err(None);
        };
        if *protocol_version != PROTOCOL_VERSION {
            return Err(Some(RejectReason::ProtocolMismatch {
                root_version: PROTOCOL_VERSION,
            }));
        }
        if *magic != self.magic {
            return Err(Some(RejectReason::UniqueIdMismatch));
        }
        if let Some(expected) = expected {
            if *nranks != expected {
                return Err(Some(RejectReason::RankMismatch { expected }));
            }
        }
        if *rank >= *nranks {
            return Err(Some(RejectReason::InvalidRank));
        }
        if joined.contains_key(rank) {
            return Err(Some(RejectReason::DuplicateRank));
        }
        Ok((*rank, *nranks, ring_addr.clone()))
    }

    /// Run the rendezvous to completion.
    pub async fn serve(self) -> Result<()> {
        let mut expected: Option<u32> = None;
        let mut joined: BTreeMap<Rank, (TcpStream, String)> = BTreeMap::new();

        while expected.is_none_or(|n| joined.len() < n as usize) {
            let (mut stream, peer) = self.listener.accept().await?;
            let msg = match tokio::time::timeout(CHECK_IN_TIMEOUT, recv_control(&mut stream)).await
            {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "dropping malformed rendezvous connection");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(%peer, "dropping silent rendezvous connection");
                    continue;
                }
            };
            match self.vet(&msg, expected, &joined) {
                Ok((rank, nranks, ring_addr)) => {
                    expected.get_or_insert(nranks);
                    tracing::debug!(rank, nranks, %peer, "rank checked in");
                    joined.insert(rank, (stream, ring_addr));
                }
                Err(Some(reason)) => {
                    tracing::warn!(%peer, ?reason, "rejecting check-in");
                    let _ = send_control(&mut stream, &BootstrapMessage::Reject { reason }).await;
                }
                Err(None) => {
                    tracing::warn!(%peer, "unexpected message on rendezvous connection");
                }
            }
        }

        let nranks = joined.len();
        let ring: Vec<String> = joined.values().map(|(_, addr)| addr.clone()).collect();
        for (rank, (mut stream, _)) in joined {
            let next_addr = ring[(rank as usize + 1) % nranks].clone();
            send_control(&mut stream, &BootstrapMessage::Assign { next_addr })
                .await
                .map_err(|_| CommError::PeerDisconnected { rank })?;
        }
        tracing::info!(nranks, addr = %self.addr, "rendezvous complete");
        Ok(())
    }

    /// Spawn [`serve`](Self::serve) on the current tokio runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let addr = self.addr;
            let result = self.serve().await;
            if let Err(e) = &result {
                tracing::warn!(%addr, error = %e, "rendezvous root failed");
            }
            result
        })
    }
}

/// Generate a [`UniqueId`] and start its rendezvous root on the current
/// tokio runtime.
///
/// The root binds an ephemeral port on `config.bootstrap_ifaddr` and exits
/// once every rank has joined.
pub async fn get_unique_id(config: &CommConfig) -> Result<UniqueId> {
    let listener = TcpListener::bind(SocketAddr::new(config.bootstrap_ifaddr, 0)).await?;
    let root = RendezvousRoot::from_listener(listener, fresh_magic())?;
    let id = root.unique_id();
    root.spawn();
    Ok(id)
}

/// Blocking counterpart of [`get_unique_id`]: the root runs on its own OS
/// thread with a single-threaded runtime.
pub fn spawn_root_thread(
    config: &CommConfig,
) -> Result<(UniqueId, std::thread::JoinHandle<Result<()>>)> {
    let listener = std::net::TcpListener::bind(SocketAddr::new(config.bootstrap_ifaddr, 0))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let magic = fresh_magic();
    let id = UniqueId::new(magic, addr);

    let handle = std::thread::Builder::new()
        .name("fabriclink-root".into())
        .spawn(move || -> Result<()> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| CommError::transport_with_source("tokio runtime", e))?;
            rt.block_on(async move {
                let listener = TcpListener::from_std(listener)?;
                RendezvousRoot::from_listener(listener, magic)?.serve().await
            })
        })?;
    Ok((id, handle))
}
