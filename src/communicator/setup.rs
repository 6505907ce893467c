//! Collective connection setup.
//!
//! Every rank publishes a [`SetupInfo`] describing the intents it declared
//! and the local endpoints it prepared for them. All ranks then validate
//! the same global table in the same order, so either every rank accepts
//! it or every rank reports the same first error. Handshake results are
//! agreed on with one more allgather before any connection is published.

use super::Communicator;
use crate::connection::{Connection, Endpoints, IbConnection, IpcConnection, PendingConnection};
use crate::error::{CommError, Result};
use crate::transport::Transport;
use crate::transport::driver::{IbQueuePair, QpEndpoint};
use crate::types::{Rank, Tag};
use std::sync::Arc;

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub(super) struct IntentInfo {
    pub remote: Rank,
    pub tag: Tag,
    /// Transport bit of the declaring side.
    pub transport: u32,
    /// Encoded [`QpEndpoint`] for `IbN` intents, empty otherwise.
    pub endpoint: Vec<u8>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub(super) struct SetupInfo {
    pub rank: Rank,
    pub host_hash: u64,
    /// First local failure while preparing endpoints.
    pub prepare_error: Option<String>,
    pub intents: Vec<IntentInfo>,
}

impl SetupInfo {
    fn encode(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|b| b.to_vec())
            .map_err(|e| CommError::EncodeFailed(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<SetupInfo, rkyv::rancor::Error>(&aligned)
            .map_err(|e| CommError::DecodeFailed(e.to_string()))
    }

    fn find(&self, remote: Rank, tag: Tag) -> Option<&IntentInfo> {
        self.intents
            .iter()
            .find(|i| i.remote == remote && i.tag == tag)
    }
}

/// An intent with whatever local state was prepared for it.
struct Prepared {
    pending: PendingConnection,
    qp: Option<Box<dyn IbQueuePair>>,
}

fn transport_of(bit: u32) -> Result<Transport> {
    Transport::from_bit(bit)
        .ok_or_else(|| CommError::DecodeFailed(format!("unknown transport bit 0x{bit:x}")))
}

/// Check the gathered table. Deterministic: every rank sees the same table
/// and walks it in rank order, so every rank fails with the same error.
pub(super) fn validate_setup(table: &[SetupInfo]) -> Result<()> {
    let n = table.len() as u32;
    for (r, info) in table.iter().enumerate() {
        let r = r as Rank;
        if info.rank != r {
            return Err(CommError::ConnectionSetup {
                rank: r,
                reason: format!("slot {r} carries setup info of rank {}", info.rank),
            });
        }
        if let Some(reason) = &info.prepare_error {
            return Err(CommError::ConnectionSetup {
                rank: r,
                reason: reason.clone(),
            });
        }
    }

    for info in table {
        let r = info.rank;
        for intent in &info.intents {
            if intent.remote >= n || intent.remote == r {
                return Err(CommError::ConnectionSetup {
                    rank: r,
                    reason: format!("invalid remote rank {}", intent.remote),
                });
            }
            let peer = &table[intent.remote as usize];
            let Some(back) = peer.find(r, intent.tag) else {
                return Err(CommError::UnmatchedIntent {
                    rank: r,
                    remote: intent.remote,
                    tag: intent.tag,
                });
            };
            let local = transport_of(intent.transport)?;
            let remote_transport = transport_of(back.transport)?;
            if local.is_ib() != remote_transport.is_ib() {
                return Err(CommError::TransportMismatch {
                    rank: r,
                    remote: intent.remote,
                    tag: intent.tag,
                    local,
                    remote_transport,
                });
            }
            if !local.is_ib() && info.host_hash != peer.host_hash {
                return Err(CommError::ConnectionSetup {
                    rank: r,
                    reason: format!(
                        "{local} connection to rank {} (tag {}) crosses hosts",
                        intent.remote, intent.tag
                    ),
                });
            }
            if local.is_ib() {
                QpEndpoint::from_bytes(&intent.endpoint)?;
            }
        }
    }
    Ok(())
}

impl Communicator {
    /// Establish every connection declared with [`connect`](Self::connect)
    /// since the last call. Collective: every rank must call it.
    ///
    /// On success every intent's [`PendingConnection`] resolves. On failure
    /// every rank returns an error and no connection from this round is
    /// published. Intents are consumed either way.
    pub async fn connection_setup(&mut self) -> Result<()> {
        let intents = std::mem::take(&mut self.intents);

        let (prepared, prepare_error) = self.prepare(intents);
        let info = SetupInfo {
            rank: self.rank,
            host_hash: self.host_hash,
            prepare_error: prepare_error.map(|e| e.to_string()),
            intents: prepared
                .iter()
                .map(|p| IntentInfo {
                    remote: p.pending.remote_rank(),
                    tag: p.pending.tag(),
                    transport: p.pending.transport().bit(),
                    endpoint: p
                        .qp
                        .as_ref()
                        .map(|qp| qp.endpoint().to_bytes().to_vec())
                        .unwrap_or_default(),
                })
                .collect(),
        };

        let gathered = self.bootstrap.all_gather_bytes(&info.encode()?).await?;
        let table = gathered
            .iter()
            .map(|b| SetupInfo::decode(b))
            .collect::<Result<Vec<_>>>()?;
        validate_setup(&table)?;

        let handshake = self.handshake(prepared, &table);

        let mut status = vec![0u8; self.nranks as usize];
        status[self.rank as usize] = u8::from(handshake.is_err());
        self.bootstrap.all_gather(&mut status, 1).await?;
        let connections = handshake?;
        if let Some(failed) = status.iter().position(|&s| s != 0) {
            return Err(CommError::ConnectionSetup {
                rank: failed as Rank,
                reason: "handshake failed".into(),
            });
        }

        let count = connections.len();
        for (pending, conn) in connections {
            pending.establish(Arc::clone(&conn));
            self.established
                .insert((pending.remote_rank(), pending.tag()), conn);
        }
        tracing::info!(
            rank = self.rank,
            count,
            total = self.established.len(),
            "connection setup complete"
        );
        Ok(())
    }

    /// Open devices and create queue pairs. Stops at the first failure,
    /// which is reported to every rank through the setup table.
    fn prepare(&self, intents: Vec<PendingConnection>) -> (Vec<Prepared>, Option<CommError>) {
        let mut prepared = Vec::with_capacity(intents.len());
        for pending in intents {
            let transport = pending.transport();
            let qp = if transport.is_ib() {
                match self.device(transport).and_then(|dev| dev.create_qp()) {
                    Ok(qp) => Some(qp),
                    Err(e) => {
                        tracing::warn!(
                            rank = self.rank,
                            %transport,
                            error = %e,
                            "endpoint preparation failed"
                        );
                        return (prepared, Some(e));
                    }
                }
            } else {
                None
            };
            prepared.push(Prepared { pending, qp });
        }
        (prepared, None)
    }

    fn handshake(
        &self,
        prepared: Vec<Prepared>,
        table: &[SetupInfo],
    ) -> Result<Vec<(PendingConnection, Arc<dyn Connection>)>> {
        let mut out = Vec::with_capacity(prepared.len());
        for Prepared { pending, qp } in prepared {
            let remote = pending.remote_rank();
            let tag = pending.tag();
            let back = table[remote as usize].find(self.rank, tag).ok_or(
                CommError::UnmatchedIntent {
                    rank: self.rank,
                    remote,
                    tag,
                },
            )?;
            let ends = Endpoints {
                local_rank: self.rank,
                remote_rank: remote,
                tag,
                transport: pending.transport(),
                remote_transport: transport_of(back.transport)?,
            };
            let conn: Arc<dyn Connection> = match qp {
                Some(mut qp) => {
                    qp.connect(&QpEndpoint::from_bytes(&back.endpoint)?)?;
                    Arc::new(IbConnection::new(ends, qp, self.config.cq_poll_timeout))
                }
                None => Arc::new(IpcConnection::new(
                    ends,
                    self.platform.ipc().create_stream()?,
                )),
            };
            tracing::debug!(
                rank = self.rank,
                remote,
                tag,
                transport = %ends.transport,
                remote_transport = %ends.remote_transport,
                "connection handshake complete"
            );
            out.push((pending, conn));
        }
        Ok(out)
    }
}
