//! Overlay-network membership predicate.
//!
//! The proxy trusts the overlay mesh as its sole authentication boundary, so
//! admission first checks that the peer's address actually falls inside the
//! mesh's reserved ranges rather than, say, the public internet reaching the
//! listener directly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};

/// CGNAT /10 used by the overlay vendor for IPv4 peers.
const OVERLAY_V4_CIDR: &str = "100.64.0.0/10";
/// ULA /48 used for IPv6 peers.
const OVERLAY_V6_CIDR: &str = "fd7a:115c:a1e0::/48";

fn v4_net() -> Ipv4Net {
    Ipv4Net::from_str(OVERLAY_V4_CIDR).expect("overlay v4 CIDR is a constant")
}

fn v6_net() -> Ipv6Net {
    Ipv6Net::from_str(OVERLAY_V6_CIDR).expect("overlay v6 CIDR is a constant")
}

/// True if `ip` falls within either of the fixed overlay ranges.
pub fn is_overlay_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4_net().contains(&v4),
        IpAddr::V6(v6) => v6_net().contains(&v6),
    }
}

/// Extract the host portion from a peer address string, which may be a bare
/// IP, an `ip:port` pair, or a bracketed IPv6 form (`[::1]:1234`).
pub fn parse_peer_host(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        // [ipv6]:port or [ipv6]
        let end = rest.find(']')?;
        return Ipv6Addr::from_str(&rest[..end]).ok().map(IpAddr::V6);
    }
    if let Ok(ip) = IpAddr::from_str(addr) {
        return Some(ip);
    }
    // host:port form — only valid if host is a bare IPv4 (IPv6 without
    // brackets is ambiguous with the port separator and is rejected).
    if let Some((host, _port)) = addr.rsplit_once(':') {
        if let Ok(v4) = Ipv4Addr::from_str(host) {
            return Some(IpAddr::V4(v4));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_cgnat_v4() {
        let ip: IpAddr = "100.100.1.2".parse().unwrap();
        assert!(is_overlay_addr(ip));
    }

    #[test]
    fn rejects_public_v4() {
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        assert!(!is_overlay_addr(ip));
    }

    #[test]
    fn accepts_ula_v6() {
        let ip: IpAddr = "fd7a:115c:a1e0::1".parse().unwrap();
        assert!(is_overlay_addr(ip));
    }

    #[test]
    fn rejects_public_v6() {
        let ip: IpAddr = "2001:4860:4860::8888".parse().unwrap();
        assert!(!is_overlay_addr(ip));
    }

    #[test]
    fn parses_bracketed_ipv6_with_port() {
        let ip = parse_peer_host("[fd7a:115c:a1e0::1]:54321").unwrap();
        assert_eq!(ip, "fd7a:115c:a1e0::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parses_v4_with_port() {
        let ip = parse_peer_host("100.64.0.5:443").unwrap();
        assert_eq!(ip, "100.64.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parses_bare_v4() {
        let ip = parse_peer_host("100.64.0.5").unwrap();
        assert_eq!(ip, "100.64.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_malformed_peer() {
        assert!(parse_peer_host("not-an-address").is_none());
    }
}
