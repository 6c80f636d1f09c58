// Core data model shared by the control loops, the store backends, and the
// kernel data-plane programming.

pub mod cni;
pub mod ipv4;
pub mod network;
pub mod subnet;

pub use cni::CniConfig;
pub use ipv4::{AddrError, Ipv4Addr, Ipv4Net};
pub use network::{Network, ProviderConfig, PROVIDER_VXLAN};
pub use subnet::{Subnet, DEFAULT_SUBNET_TTL};
