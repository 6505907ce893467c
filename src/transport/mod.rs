pub mod driver;
mod flags;
pub mod loopback;

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "rdma")]
pub mod verbs;

pub use flags::{MAX_IB_DEVICES, Transport, TransportFlags};
