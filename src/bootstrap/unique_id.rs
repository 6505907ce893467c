use crate::error::{CommError, Result};
use crate::types::fnv1a;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Size of a [`UniqueId`] in bytes.
pub const UNIQUE_ID_BYTES: usize = 128;

const ADDR_OFFSET: usize = 8;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Opaque token identifying one communicator instance.
///
/// Generated once by [`get_unique_id`](crate::get_unique_id) and handed to
/// every rank out of band. Layout: `[0..8]` magic (u64 LE), `[8]` address
/// family, then the rendezvous root's IP octets and port (u16 LE), zero
/// padded to 128 bytes. All ranks must present a bit-identical copy.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId([u8; UNIQUE_ID_BYTES]);

impl UniqueId {
    pub(crate) fn new(magic: u64, root: SocketAddr) -> Self {
        let mut buf = [0u8; UNIQUE_ID_BYTES];
        buf[0..8].copy_from_slice(&magic.to_le_bytes());
        let a = ADDR_OFFSET;
        match root.ip() {
            IpAddr::V4(ip) => {
                buf[a] = FAMILY_V4;
                buf[a + 1..a + 5].copy_from_slice(&ip.octets());
                buf[a + 5..a + 7].copy_from_slice(&root.port().to_le_bytes());
            }
            IpAddr::V6(ip) => {
                buf[a] = FAMILY_V6;
                buf[a + 1..a + 17].copy_from_slice(&ip.octets());
                buf[a + 17..a + 19].copy_from_slice(&root.port().to_le_bytes());
            }
        }
        Self(buf)
    }

    /// Reconstruct an id received out of band.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; UNIQUE_ID_BYTES] = bytes.try_into().map_err(|_| {
            CommError::DecodeFailed(format!(
                "unique id must be {UNIQUE_ID_BYTES} bytes, got {}",
                bytes.len()
            ))
        })?;
        let id = Self(buf);
        id.root_addr()?;
        Ok(id)
    }

    pub fn as_bytes(&self) -> &[u8; UNIQUE_ID_BYTES] {
        &self.0
    }

    pub(crate) fn magic(&self) -> u64 {
        u64::from_le_bytes([
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7],
        ])
    }

    /// Address of the rendezvous root encoded in the id.
    pub fn root_addr(&self) -> Result<SocketAddr> {
        let a = ADDR_OFFSET;
        let b = &self.0;
        match b[a] {
            FAMILY_V4 => {
                let ip = Ipv4Addr::new(b[a + 1], b[a + 2], b[a + 3], b[a + 4]);
                let port = u16::from_le_bytes([b[a + 5], b[a + 6]]);
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[a + 1..a + 17]);
                let port = u16::from_le_bytes([b[a + 17], b[a + 18]]);
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => Err(CommError::DecodeFailed(format!(
                "unique id has unknown address family {other}"
            ))),
        }
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("UniqueId");
        s.field("magic", &format_args!("{:#018x}", self.magic()));
        match self.root_addr() {
            Ok(addr) => s.field("root", &addr),
            Err(_) => s.field("root", &"<invalid>"),
        };
        s.finish()
    }
}

/// Fresh magic for a newly bound root.
pub(crate) fn fresh_magic() -> u64 {
    rand::random()
}

/// Magic shared by every rank that rendezvouses on the same `"ip:port"`.
pub(crate) fn address_magic(addr: &str) -> u64 {
    fnv1a([b"fabriclink-rendezvous:".as_slice(), addr.as_bytes()])
}
