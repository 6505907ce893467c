use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

/// A single data-movement mechanism.
///
/// Each variant occupies one bit of [`TransportFlags`]. `Ib0`..`Ib7` are
/// independently addressed RDMA devices; see
/// [`Platform::ib_device_name`](crate::Platform::ib_device_name) for the
/// device-name mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Transport {
    /// GPU peer memory mapped through the driver's IPC facility (same node).
    CudaIpc = 1 << 0,
    Ib0 = 1 << 1,
    Ib1 = 1 << 2,
    Ib2 = 1 << 3,
    Ib3 = 1 << 4,
    Ib4 = 1 << 5,
    Ib5 = 1 << 6,
    Ib6 = 1 << 7,
    Ib7 = 1 << 8,
}

/// Number of addressable RDMA device slots.
pub const MAX_IB_DEVICES: usize = 8;

const IB_TRANSPORTS: [Transport; MAX_IB_DEVICES] = [
    Transport::Ib0,
    Transport::Ib1,
    Transport::Ib2,
    Transport::Ib3,
    Transport::Ib4,
    Transport::Ib5,
    Transport::Ib6,
    Transport::Ib7,
];

impl Transport {
    /// Every defined transport, in bit order.
    pub const ALL: [Transport; 9] = [
        Transport::CudaIpc,
        Transport::Ib0,
        Transport::Ib1,
        Transport::Ib2,
        Transport::Ib3,
        Transport::Ib4,
        Transport::Ib5,
        Transport::Ib6,
        Transport::Ib7,
    ];

    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// The RDMA transport for device slot `index`, if it exists.
    pub const fn ib(index: usize) -> Option<Self> {
        if index < MAX_IB_DEVICES {
            Some(IB_TRANSPORTS[index])
        } else {
            None
        }
    }

    /// Device slot of an RDMA transport; `None` for `CudaIpc`.
    pub const fn ib_index(self) -> Option<usize> {
        match self {
            Transport::CudaIpc => None,
            other => Some((other as u32).trailing_zeros() as usize - 1),
        }
    }

    pub const fn is_ib(self) -> bool {
        !matches!(self, Transport::CudaIpc)
    }

    /// Parse a single-bit value back into a transport.
    pub fn from_bit(bit: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.bit() == bit)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Transport::CudaIpc => "CudaIpc",
            Transport::Ib0 => "Ib0",
            Transport::Ib1 => "Ib1",
            Transport::Ib2 => "Ib2",
            Transport::Ib3 => "Ib3",
            Transport::Ib4 => "Ib4",
            Transport::Ib5 => "Ib5",
            Transport::Ib6 => "Ib6",
            Transport::Ib7 => "Ib7",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of [`Transport`]s supported by a memory region or requested by a
/// caller.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransportFlags(u32);

const fn union_of_all() -> u32 {
    let mut bits = 0;
    let mut i = 0;
    while i < Transport::ALL.len() {
        bits |= Transport::ALL[i].bit();
        i += 1;
    }
    bits
}

impl TransportFlags {
    pub const NONE: Self = Self(0);
    /// Union of every defined transport; derived from [`Transport::ALL`].
    pub const ALL: Self = Self(union_of_all());

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build a set from raw bits, rejecting undefined bits.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn contains(self, transport: Transport) -> bool {
        self.0 & transport.bit() != 0
    }

    pub const fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// True if any RDMA device bit is set.
    pub fn has_ib(self) -> bool {
        self.iter().any(Transport::is_ib)
    }

    /// Contained transports in bit order.
    pub fn iter(self) -> impl Iterator<Item = Transport> {
        Transport::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl From<Transport> for TransportFlags {
    fn from(t: Transport) -> Self {
        Self(t.bit())
    }
}

impl FromIterator<Transport> for TransportFlags {
    fn from_iter<I: IntoIterator<Item = Transport>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, |acc, t| acc | t)
    }
}

impl BitOr for TransportFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOr<Transport> for TransportFlags {
    type Output = Self;
    fn bitor(self, rhs: Transport) -> Self {
        self.union(rhs.into())
    }
}

impl BitOr for Transport {
    type Output = TransportFlags;
    fn bitor(self, rhs: Self) -> TransportFlags {
        TransportFlags::from(self) | rhs
    }
}

impl BitOrAssign for TransportFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitOrAssign<Transport> for TransportFlags {
    fn bitor_assign(&mut self, rhs: Transport) {
        self.0 |= rhs.bit();
    }
}

impl BitAnd for TransportFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl BitAndAssign for TransportFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl fmt::Display for TransportFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        for (i, t) in self.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(t.name())?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransportFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportFlags({self})")
    }
}
