//! Wire format of a serialized [`RegisteredMemory`](super::RegisteredMemory).
//!
//! ```text
//! [0..4] magic "FLRM"
//! [4..]  rkyv MemoryEnvelope
//! ```
//!
//! Each handle blob is opaque here; the connection variant for its
//! transport knows how to read it.

use crate::error::{CommError, Result};
use crate::transport::{Transport, TransportFlags};
use crate::types::{PROTOCOL_VERSION, Rank};

pub(crate) const ENVELOPE_MAGIC: [u8; 4] = *b"FLRM";

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct HandleBlob {
    pub transport: u32,
    pub blob: Vec<u8>,
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct MemoryEnvelope {
    pub version: u16,
    /// Rank that registered the memory and holds the exported resources.
    pub rank: Rank,
    pub host_hash: u64,
    /// Address of the region in the owner's address space.
    pub base: u64,
    pub size: u64,
    pub transports: u32,
    /// One blob per transport bit, in bit order.
    pub handles: Vec<HandleBlob>,
}

impl MemoryEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| CommError::EncodeFailed(e.to_string()))?;
        let mut out = Vec::with_capacity(ENVELOPE_MAGIC.len() + payload.len());
        out.extend_from_slice(&ENVELOPE_MAGIC);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload = bytes
            .strip_prefix(&ENVELOPE_MAGIC[..])
            .ok_or_else(|| CommError::DecodeFailed("not a registered memory envelope".into()))?;
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
        aligned.extend_from_slice(payload);
        let env = rkyv::from_bytes::<MemoryEnvelope, rkyv::rancor::Error>(&aligned)
            .map_err(|e| CommError::DecodeFailed(e.to_string()))?;
        env.validate()?;
        Ok(env)
    }

    fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(CommError::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote: self.version,
            });
        }
        if self.size == 0 || usize::try_from(self.size).is_err() {
            return Err(CommError::DecodeFailed(format!(
                "invalid region size {}",
                self.size
            )));
        }
        let transports = TransportFlags::from_bits(self.transports).ok_or_else(|| {
            CommError::DecodeFailed(format!("unknown transport bits {:#x}", self.transports))
        })?;
        let mut seen = TransportFlags::NONE;
        for h in &self.handles {
            let t = Transport::from_bit(h.transport).ok_or_else(|| {
                CommError::DecodeFailed(format!("handle for unknown transport {:#x}", h.transport))
            })?;
            if !transports.contains(t) || seen.contains(t) {
                return Err(CommError::DecodeFailed(format!(
                    "unexpected or duplicate {t} handle"
                )));
            }
            seen |= t;
        }
        if seen != transports {
            return Err(CommError::DecodeFailed(format!(
                "handles cover {seen}, envelope claims {transports}"
            )));
        }
        Ok(())
    }

    pub fn transports(&self) -> TransportFlags {
        TransportFlags::from_bits_truncate(self.transports)
    }

    pub fn handle(&self, transport: Transport) -> Option<&[u8]> {
        self.handles
            .iter()
            .find(|h| h.transport == transport.bit())
            .map(|h| h.blob.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryEnvelope {
        MemoryEnvelope {
            version: PROTOCOL_VERSION,
            rank: 3,
            host_hash: 0x1234,
            base: 0x7f00_0000_0000,
            size: 4096,
            transports: (Transport::CudaIpc | Transport::Ib1).bits(),
            handles: vec![
                HandleBlob {
                    transport: Transport::CudaIpc.bit(),
                    blob: vec![1; 32],
                },
                HandleBlob {
                    transport: Transport::Ib1.bit(),
                    blob: vec![2; 12],
                },
            ],
        }
    }

    #[test]
    fn test_encode_decode() {
        let env = sample();
        let bytes = env.encode().unwrap();
        assert_eq!(&bytes[..4], b"FLRM");
        let back = MemoryEnvelope::decode(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.handle(Transport::Ib1), Some(&[2u8; 12][..]));
        assert_eq!(back.handle(Transport::Ib0), None);
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let bytes = sample().encode().unwrap();
        assert!(MemoryEnvelope::decode(&bytes[1..]).is_err());
        assert!(MemoryEnvelope::decode(&bytes[..bytes.len() / 2]).is_err());
        assert!(MemoryEnvelope::decode(b"FLRM").is_err());
    }

    #[test]
    fn test_rejects_version_mismatch() {
        let mut env = sample();
        env.version = PROTOCOL_VERSION + 1;
        let bytes = env.encode().unwrap();
        assert!(matches!(
            MemoryEnvelope::decode(&bytes),
            Err(CommError::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_missing_handle() {
        let mut env = sample();
        env.handles.pop();
        assert!(MemoryEnvelope::decode(&env.encode().unwrap()).is_err());
    }

    #[test]
    fn test_rejects_handle_outside_transport_set() {
        let mut env = sample();
        env.handles[1].transport = Transport::Ib4.bit();
        assert!(MemoryEnvelope::decode(&env.encode().unwrap()).is_err());
    }

    #[test]
    fn test_rejects_unknown_bits_and_empty_region() {
        let mut env = sample();
        env.transports |= 1 << 12;
        assert!(MemoryEnvelope::decode(&env.encode().unwrap()).is_err());

        let mut env = sample();
        env.size = 0;
        assert!(MemoryEnvelope::decode(&env.encode().unwrap()).is_err());
    }
}
