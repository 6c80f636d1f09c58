use crate::types::Ipv4Addr;

/// Error type for all data-plane programming: netlink, sysctl, packet
/// filter, interface discovery, and subnet allocation.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command {cmd:?} failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no usable underlay interface found")]
    NoUsableInterface,

    #[error("unknown network provider {0:?}")]
    UnknownProvider(String),

    #[error("network {0:?} has no IPv4 configuration")]
    MissingIpv4(String),

    #[error("invalid allocation range: min={min} max={max} size={size}")]
    InvalidRange {
        min: Ipv4Addr,
        max: Ipv4Addr,
        size: u8,
    },

    #[error("network {0:?} is full")]
    NetworkFull(String),

    #[error("tunnel interface {0:?} has no MAC address")]
    EmptyVtepMac(String),

    #[error("malformed MAC address {0:?}")]
    MalformedMac(String),

    #[error("subnet record is missing {0}")]
    IncompleteSubnet(&'static str),

    #[error("failed to decode provider config: {0}")]
    Config(#[from] serde_json::Error),
}

pub type NetworkResult<T> = Result<T, NetworkError>;
