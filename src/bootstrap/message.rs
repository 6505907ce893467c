use crate::error::CommError;
use crate::types::Rank;

/// Why the rendezvous root turned a check-in away.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum RejectReason {
    ProtocolMismatch { root_version: u16 },
    UniqueIdMismatch,
    RankMismatch { expected: u32 },
    InvalidRank,
    DuplicateRank,
}

impl RejectReason {
    /// The error a rejected rank reports to its caller.
    pub fn into_error(self, rank: Rank, nranks: u32, local_version: u16) -> CommError {
        match self {
            RejectReason::ProtocolMismatch { root_version } => CommError::ProtocolMismatch {
                local: local_version,
                remote: root_version,
            },
            RejectReason::UniqueIdMismatch => CommError::UniqueIdMismatch,
            RejectReason::RankMismatch { expected } => CommError::RankMismatch {
                expected,
                actual: nranks,
            },
            RejectReason::InvalidRank => CommError::InvalidRank {
                rank,
                world_size: nranks,
            },
            RejectReason::DuplicateRank => CommError::DuplicateRank { rank },
        }
    }
}

/// Control messages of the rendezvous protocol.
///
/// Allgather payloads do not travel in this enum; they use raw `Data`
/// frames.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum BootstrapMessage {
    /// Rank → root: join request carrying the address of the rank's ring
    /// listener.
    CheckIn {
        protocol_version: u16,
        magic: u64,
        rank: Rank,
        nranks: u32,
        ring_addr: String,
    },

    /// Root → rank: every rank has checked in; connect to `next_addr`.
    Assign { next_addr: String },

    /// Root → rank: the check-in was refused.
    Reject { reason: RejectReason },

    /// First message on a ring link, sent by the predecessor.
    RingHello { magic: u64, rank: Rank },
}
