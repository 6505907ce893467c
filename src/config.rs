//! Runtime-configurable parameters for fabriclink.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `FABRICLINK_`) or by constructing a custom `CommConfig`.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Tuning parameters for rendezvous, registration and RDMA transport.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Interface address the rendezvous root binds to when a unique id is
    /// generated. Must be reachable by every rank.
    pub bootstrap_ifaddr: IpAddr,

    /// How long a rank keeps retrying to reach the rendezvous root before
    /// construction fails.
    pub connect_timeout: Duration,

    /// Pause between connection attempts to the rendezvous root.
    pub connect_retry_interval: Duration,

    /// Upper bound on a single `flush()` waiting for RDMA completions.
    pub cq_poll_timeout: Duration,

    /// Send queue and completion queue depth of each RDMA queue pair.
    pub ib_queue_depth: usize,

    /// Physical port used on every RDMA device.
    pub ib_port: u8,

    /// GID table index used for addressing (RoCE and IB).
    pub ib_gid_index: u8,

    /// Overrides the host identity used to decide whether two ranks share
    /// a node (and can therefore use GPU IPC).
    pub host_id: Option<String>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            bootstrap_ifaddr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(60),
            connect_retry_interval: Duration::from_millis(100),
            cq_poll_timeout: Duration::from_secs(30),
            ib_queue_depth: 1024,
            ib_port: 1,
            ib_gid_index: 0,
            host_id: None,
        }
    }
}

impl CommConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `FABRICLINK_BOOTSTRAP_IFADDR`
    /// - `FABRICLINK_CONNECT_TIMEOUT_SECS`
    /// - `FABRICLINK_CONNECT_RETRY_MS`
    /// - `FABRICLINK_CQ_POLL_TIMEOUT_SECS`
    /// - `FABRICLINK_IB_QUEUE_DEPTH`
    /// - `FABRICLINK_IB_PORT`
    /// - `FABRICLINK_IB_GID_INDEX`
    /// - `FABRICLINK_HOSTID`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a caller-supplied lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = lookup("FABRICLINK_BOOTSTRAP_IFADDR") {
            if let Ok(addr) = v.parse::<IpAddr>() {
                cfg.bootstrap_ifaddr = addr;
            }
        }
        if let Some(v) = lookup("FABRICLINK_CONNECT_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.connect_timeout = Duration::from_secs(s);
            }
        }
        if let Some(v) = lookup("FABRICLINK_CONNECT_RETRY_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.connect_retry_interval = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("FABRICLINK_CQ_POLL_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.cq_poll_timeout = Duration::from_secs(s);
            }
        }
        if let Some(v) = lookup("FABRICLINK_IB_QUEUE_DEPTH") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.ib_queue_depth = n;
                }
            }
        }
        if let Some(v) = lookup("FABRICLINK_IB_PORT") {
            if let Ok(n) = v.parse::<u8>() {
                cfg.ib_port = n;
            }
        }
        if let Some(v) = lookup("FABRICLINK_IB_GID_INDEX") {
            if let Ok(n) = v.parse::<u8>() {
                cfg.ib_gid_index = n;
            }
        }
        if let Some(v) = lookup("FABRICLINK_HOSTID") {
            if !v.is_empty() {
                cfg.host_id = Some(v);
            }
        }

        cfg
    }
}
