//! Local/remote classification of peer addresses.
//!
//! The hub partitions its connections by where the peer lives. What counts
//! as "local" is a policy, so it sits behind [`AddressClassifier`]; the
//! default [`PrivateNetworkClassifier`] treats loopback and private ranges as
//! local. Any `Fn(&IpAddr) -> Locality` closure works as a classifier too.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Which partition a peer belongs to.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Locality {
    Local,
    Remote,
}

/// Decides whether a peer address is local or remote.
///
/// Implementations must be thread-safe as they are shared by every
/// aggregate call on the hub.
pub trait AddressClassifier: Send + Sync + 'static {
    fn classify(&self, addr: &IpAddr) -> Locality;
}

impl<F> AddressClassifier for F
where
    F: Fn(&IpAddr) -> Locality + Send + Sync + 'static,
{
    fn classify(&self, addr: &IpAddr) -> Locality {
        self(addr)
    }
}

/// Loopback, private, link-local and unspecified ranges are local.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateNetworkClassifier;

impl PrivateNetworkClassifier {
    fn is_local_v4(addr: &Ipv4Addr) -> bool {
        addr.is_loopback() || addr.is_private() || addr.is_link_local() || addr.is_unspecified()
    }

    fn is_local_v6(addr: &Ipv6Addr) -> bool {
        if let Some(mapped) = addr.to_ipv4_mapped() {
            return Self::is_local_v4(&mapped);
        }
        let first = addr.segments()[0];
        addr.is_loopback()
            || addr.is_unspecified()
            // fc00::/7 unique local
            || (first & 0xfe00) == 0xfc00
            // fe80::/10 link local
            || (first & 0xffc0) == 0xfe80
    }
}

impl AddressClassifier for PrivateNetworkClassifier {
    fn classify(&self, addr: &IpAddr) -> Locality {
        let local = match addr {
            IpAddr::V4(v4) => Self::is_local_v4(v4),
            IpAddr::V6(v6) => Self::is_local_v6(v6),
        };
        if local {
            Locality::Local
        } else {
            Locality::Remote
        }
    }
}
