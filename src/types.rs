use crate::config::CommConfig;

/// Rank of a participant in a communicator (0-indexed).
pub type Rank = u32;

/// Disambiguates several logical connections between the same pair of ranks.
pub type Tag = u32;

/// Version of every wire format this crate emits (bootstrap frames, setup
/// records and memory envelopes).
pub const PROTOCOL_VERSION: u16 = 1;

/// Compute a non-zero FNV-1a hash over an iterator of byte slices.
///
/// Used wherever all ranks must derive the same 64-bit value from the same
/// inputs, e.g. host identity or the magic of an `"ip:port"` rendezvous.
pub(crate) fn fnv1a<I, S>(parts: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut h: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for part in parts {
        for &b in part.as_ref() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
    }
    if h == 0 { 1 } else { h }
}

/// Identity of the machine this process runs on.
///
/// Two ranks with equal host hashes are assumed to share a node. The
/// `host_id` config override wins over the system hostname.
pub fn host_hash(config: &CommConfig) -> u64 {
    if let Some(id) = &config.host_id {
        return fnv1a([id.as_bytes()]);
    }
    fnv1a([gethostname::gethostname().as_encoded_bytes()])
}
