//! Rendezvous channel: rank discovery and ring collectives over TCP.
//!
//! Every rank checks in with a [`RendezvousRoot`], learns the address of
//! its ring successor, and then holds two TCP links: one to `rank + 1` and
//! one from `rank - 1`. [`Bootstrap::all_gather`] circulates contributions
//! around that ring in `N - 1` rounds; barrier and the variable-length
//! gather are built on it.
//!
//! The channel is used only at startup and during connection setup. Ring
//! operations have no timeout: a peer that never shows up stalls every
//! participant.

mod frame;
mod message;
mod root;
mod unique_id;

pub use root::{RendezvousRoot, get_unique_id, spawn_root_thread};
pub use unique_id::{UNIQUE_ID_BYTES, UniqueId};
pub(crate) use unique_id::address_magic;

use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::types::{PROTOCOL_VERSION, Rank};
use frame::{recv_control, recv_data_into, send_control, send_data};
use message::BootstrapMessage;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};

/// How long an accepted ring connection may stay silent before it is dropped.
const RING_HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect to `addr`, retrying refused attempts until `config.connect_timeout`.
async fn connect_with_retry(addr: SocketAddr, config: &CommConfig) -> Result<TcpStream> {
    let start = Instant::now();
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if start.elapsed() < config.connect_timeout => {
                tracing::trace!(%addr, error = %e, "rendezvous connect retry");
                tokio::time::sleep(config.connect_retry_interval).await;
            }
            Err(e) => {
                return Err(CommError::RendezvousUnreachable {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

struct Ring {
    /// Link to `(rank + 1) % N`.
    next: TcpStream,
    /// Link from `(rank + N - 1) % N`.
    prev: TcpStream,
}

/// A rank's handle on the rendezvous channel.
pub struct Bootstrap {
    rank: Rank,
    nranks: u32,
    ring: Option<Ring>,
    broken: bool,
}

impl Bootstrap {
    /// Join the communicator whose root listens on `root` and form the ring.
    pub async fn connect(
        root: SocketAddr,
        magic: u64,
        rank: Rank,
        nranks: u32,
        config: &CommConfig,
    ) -> Result<Self> {
        if rank >= nranks {
            return Err(CommError::InvalidRank {
                rank,
                world_size: nranks,
            });
        }

        let mut root_stream = connect_with_retry(root, config).await?;
        let local_ip = root_stream.local_addr()?.ip();
        let listener = TcpListener::bind(SocketAddr::new(local_ip, 0)).await?;
        let ring_addr = listener.local_addr()?;

        send_control(
            &mut root_stream,
            &BootstrapMessage::CheckIn {
                protocol_version: PROTOCOL_VERSION,
                magic,
                rank,
                nranks,
                ring_addr: ring_addr.to_string(),
            },
        )
        .await?;

        let next_addr = match recv_control(&mut root_stream).await? {
            BootstrapMessage::Assign { next_addr } => next_addr,
            BootstrapMessage::Reject { reason } => {
                return Err(reason.into_error(rank, nranks, PROTOCOL_VERSION));
            }
            other => {
                return Err(CommError::DecodeFailed(format!(
                    "unexpected rendezvous reply: {other:?}"
                )));
            }
        };
        let next_addr: SocketAddr = next_addr
            .parse()
            .map_err(|_| CommError::InvalidAddress(next_addr.clone()))?;

        if nranks == 1 {
            return Ok(Self {
                rank,
                nranks,
                ring: None,
                broken: false,
            });
        }

        let prev_rank = (rank + nranks - 1) % nranks;
        let (next, prev) = tokio::try_join!(
            Self::connect_next(next_addr, magic, rank, config),
            Self::accept_prev(&listener, magic, prev_rank, RING_HELLO_TIMEOUT),
        )?;
        tracing::debug!(rank, nranks, %next_addr, "bootstrap ring formed");

        Ok(Self {
            rank,
            nranks,
            ring: Some(Ring { next, prev }),
            broken: false,
        })
    }

    async fn connect_next(
        addr: SocketAddr,
        magic: u64,
        rank: Rank,
        config: &CommConfig,
    ) -> Result<TcpStream> {
        let mut stream = connect_with_retry(addr, config).await?;
        send_control(&mut stream, &BootstrapMessage::RingHello { magic, rank }).await?;
        Ok(stream)
    }

    async fn accept_prev(
        listener: &TcpListener,
        magic: u64,
        prev: Rank,
        hello_timeout: Duration,
    ) -> Result<TcpStream> {
        loop {
            let (mut stream, peer) = listener.accept().await?;
            match tokio::time::timeout(hello_timeout, recv_control(&mut stream)).await {
                Ok(Ok(BootstrapMessage::RingHello { magic: m, rank }))
                    if m == magic && rank == prev =>
                {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Ok(other)) => {
                    tracing::warn!(%peer, ?other, "unexpected ring hello, dropping");
                }
                Ok(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "malformed ring hello, dropping");
                }
                Err(_) => {
                    tracing::warn!(%peer, "dropping silent ring connection");
                }
            }
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn nranks(&self) -> u32 {
        self.nranks
    }

    fn ring(&mut self) -> Result<Option<&mut Ring>> {
        if self.broken {
            return Err(CommError::BootstrapBroken);
        }
        Ok(self.ring.as_mut())
    }

    /// Ring allgather: `data` holds `size` bytes per rank in rank order; the
    /// caller's own slot is filled on entry, every slot on return.
    ///
    /// On failure `data` is left untouched and the channel is poisoned.
    pub async fn all_gather(&mut self, data: &mut [u8], size: usize) -> Result<()> {
        let n = self.nranks as usize;
        let rank = self.rank as usize;
        let expected = size.checked_mul(n).ok_or_else(|| {
            CommError::InvalidArgument(format!("allgather of {size} bytes x {n} ranks overflows"))
        })?;
        if data.len() != expected {
            return Err(CommError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let Some(ring) = self.ring()? else {
            return Ok(());
        };
        if size == 0 {
            return Ok(());
        }

        let mut scratch = data.to_vec();
        match ring_all_gather(ring, &mut scratch, size, rank, n).await {
            Ok(()) => {
                data.copy_from_slice(&scratch);
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Gather one variable-length byte string from every rank.
    pub async fn all_gather_bytes(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        let n = self.nranks as usize;
        let rank = self.rank as usize;

        let mut lens = vec![0u8; 8 * n];
        lens[rank * 8..rank * 8 + 8].copy_from_slice(&(mine.len() as u64).to_le_bytes());
        self.all_gather(&mut lens, 8).await?;
        let lengths: Vec<usize> = lens
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b) as usize
            })
            .collect();
        let max = lengths.iter().copied().max().unwrap_or(0);

        let mut buf = vec![0u8; max * n];
        buf[rank * max..rank * max + mine.len()].copy_from_slice(mine);
        self.all_gather(&mut buf, max).await?;

        Ok(lengths
            .iter()
            .enumerate()
            .map(|(r, &len)| buf[r * max..r * max + len].to_vec())
            .collect())
    }

    /// Returns once every rank has entered the barrier.
    pub async fn barrier(&mut self) -> Result<()> {
        let n = self.nranks as usize;
        let mut flags = vec![0u8; n];
        flags[self.rank as usize] = 1;
        self.all_gather(&mut flags, 1).await?;
        if flags.iter().any(|&f| f != 1) {
            return Err(CommError::DecodeFailed("corrupt barrier token".into()));
        }
        Ok(())
    }
}

async fn ring_all_gather(
    ring: &mut Ring,
    buf: &mut [u8],
    size: usize,
    rank: usize,
    n: usize,
) -> Result<()> {
    let next = ((rank + 1) % n) as Rank;
    let prev = ((rank + n - 1) % n) as Rank;
    let Ring {
        next: next_link,
        prev: prev_link,
    } = ring;

    for step in 0..n - 1 {
        let send_idx = (rank + n - step) % n;
        let recv_idx = (rank + n - step - 1) % n;
        let outgoing = buf[send_idx * size..(send_idx + 1) * size].to_vec();
        let incoming = &mut buf[recv_idx * size..(recv_idx + 1) * size];

        let send = async {
            send_data(&mut *next_link, &outgoing)
                .await
                .map_err(|e| link_error(e, next))
        };
        let recv = async {
            recv_data_into(&mut *prev_link, incoming)
                .await
                .map_err(|e| link_error(e, prev))
        };
        tokio::try_join!(send, recv)?;
        tracing::trace!(rank, step, "allgather round complete");
    }
    Ok(())
}

fn link_error(e: CommError, peer: Rank) -> CommError {
    match e {
        CommError::Io(_) => CommError::PeerDisconnected { rank: peer },
        other => other,
    }
}
