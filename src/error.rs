use crate::transport::Transport;
use crate::types::{Rank, Tag};

pub type Result<T> = std::result::Result<T, CommError>;

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("rendezvous root {addr} unreachable: {reason}")]
    RendezvousUnreachable { addr: String, reason: String },

    #[error("unique id mismatch: rendezvous root belongs to a different communicator")]
    UniqueIdMismatch,

    #[error("rank count mismatch: root expects {expected} ranks, got {actual}")]
    RankMismatch { expected: u32, actual: u32 },

    #[error("rank {rank} checked in twice")]
    DuplicateRank { rank: Rank },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("invalid rendezvous address {0:?}")]
    InvalidAddress(String),

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("bootstrap ring is broken by an earlier failure")]
    BootstrapBroken,

    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("bootstrap receive size mismatch: expected {expected} bytes, got {actual}")]
    RecvSizeMismatch { expected: usize, actual: usize },

    #[error("memory registration failed: {message}")]
    Registration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("unknown RDMA device {0:?}")]
    UnknownIbDevice(String),

    #[error("transport {transport} is not supported by {what}")]
    TransportNotSupported {
        transport: Transport,
        what: &'static str,
    },

    #[error("connection to rank {remote} with tag {tag} declared twice")]
    DuplicateIntent { remote: Rank, tag: Tag },

    #[error("rank {rank} declared a connection to rank {remote} (tag {tag}) with no matching declaration")]
    UnmatchedIntent { rank: Rank, remote: Rank, tag: Tag },

    #[error(
        "transport kind mismatch on {rank}->{remote} (tag {tag}): {local} cannot pair with {remote_transport}"
    )]
    TransportMismatch {
        rank: Rank,
        remote: Rank,
        tag: Tag,
        local: Transport,
        remote_transport: Transport,
    },

    #[error("connection setup failed at rank {rank}: {reason}")]
    ConnectionSetup { rank: Rank, reason: String },

    #[error("connection to rank {remote} (tag {tag}) is not established")]
    NotEstablished { remote: Rank, tag: Tag },

    #[error("{side} range out of bounds: offset {offset} + size {size} exceeds {limit} bytes")]
    OutOfBounds {
        side: &'static str,
        offset: usize,
        size: usize,
        limit: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("connection to rank {remote} is broken and must be discarded")]
    ConnectionBroken { remote: Rank },

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl CommError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Registration` error with just a message.
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Registration` error with a message and a source error.
    pub fn registration_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Registration {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for errors that leave every rank of a collective call failed.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::UnmatchedIntent { .. }
                | Self::TransportMismatch { .. }
                | Self::ConnectionSetup { .. }
        )
    }
}
