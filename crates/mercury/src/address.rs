//! # Process Addresses
//!
//! Every process in the cluster is identified by the IPv4 endpoint its Nub is
//! bound to. [`Address`] is the key of every channel map and peer registry, so
//! it is a small `Copy` value with a total order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::MercuryError;

/// Endpoint of a Mercury process: IPv4 host plus UDP port.
///
/// Ordering compares the host first and then the port, which keeps registry
/// iteration grouped by machine.
///
/// # Examples
///
/// ```rust
/// use mercury::Address;
///
/// let addr: Address = "10.0.0.7:20013".parse().unwrap();
/// assert_eq!(addr.port(), 20013);
/// assert_eq!(addr.to_string(), "10.0.0.7:20013");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    ip: u32,
    port: u16,
}

impl Address {
    /// The null address, used where no peer is known yet.
    pub const NONE: Address = Address { ip: 0, port: 0 };

    /// Creates an address from a host and a port.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: u32::from(ip),
            port,
        }
    }

    /// The host part of the address.
    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// The UDP port of the address.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this is [`Address::NONE`].
    pub fn is_none(&self) -> bool {
        self.ip == 0 && self.port == 0
    }

    /// Whether both addresses live on the same machine.
    pub fn same_host(&self, other: &Address) -> bool {
        self.ip == other.ip
    }

    /// Converts into a socket address for the UDP layer.
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for Address {
    type Error = MercuryError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => Err(MercuryError::Network(format!(
                "IPv6 endpoints are not supported: {v6}"
            ))),
        }
    }
}

impl FromStr for Address {
    type Err = MercuryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddrV4 = s
            .parse()
            .map_err(|e| MercuryError::Network(format!("Invalid address '{s}': {e}")))?;
        Ok(addr.into())
    }
}
