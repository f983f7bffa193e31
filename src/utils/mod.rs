/// Utility functions shared across the proxy
use std::net::{IpAddr, UdpSocket};

use lazy_static::lazy_static;

/// Calculate CRC16/XMODEM checksum (used for Redis Cluster slot calculation)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Extract the hash tag from a key for slot calculation
///
/// Only the substring between the first `{` and the following `}` is hashed,
/// and only when that substring is non-empty.
pub fn extract_hash_tag(key: &str) -> &str {
    if let Some(start) = key.find('{') {
        if let Some(len) = key[start + 1..].find('}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

lazy_static! {
    static ref LOCAL_IP: Option<String> = discover_local_ip();
}

/// Best-effort IPv4 address of the local host, cached after the first call
///
/// Used only to group replicas by rack (same first two octets). Returns
/// `None` when discovery fails; callers must degrade gracefully.
pub fn local_ip() -> Option<&'static str> {
    LOCAL_IP.as_deref()
}

fn discover_local_ip() -> Option<String> {
    // connecting a UDP socket does not send any packet, it only selects
    // the outbound interface
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() => Some(v4.to_string()),
        _ => None,
    }
}

/// First two octets of an IPv4 address, with a trailing dot (`10.4.`)
///
/// Endpoints sharing this prefix are regarded as living in the same IDC.
pub fn idc_prefix(ip: &str) -> Option<String> {
    let mut octets = ip.splitn(3, '.');
    let first = octets.next()?;
    let second = octets.next()?;
    octets.next()?;
    Some(format!("{}.{}.", first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16() {
        // These values must match Redis cluster slot calculation
        assert_eq!(crc16(b"123456789"), 12739);
        assert_eq!(crc16(b"foo"), 44950);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn test_extract_hash_tag() {
        assert_eq!(extract_hash_tag("foo{bar}baz"), "bar");
        assert_eq!(extract_hash_tag("no_tag"), "no_tag");
        assert_eq!(extract_hash_tag("empty{}tag"), "empty{}tag");
        assert_eq!(extract_hash_tag("{user1000}.following"), "user1000");
        assert_eq!(extract_hash_tag("{x}abc"), "x");
        assert_eq!(extract_hash_tag("a{b{c}d}"), "b{c");
        assert_eq!(extract_hash_tag("unclosed{tag"), "unclosed{tag");
    }

    #[test]
    fn test_idc_prefix() {
        assert_eq!(idc_prefix("10.4.17.164").as_deref(), Some("10.4."));
        assert_eq!(idc_prefix("192.168.1.1").as_deref(), Some("192.168."));
        assert_eq!(idc_prefix("10.4").as_deref(), None);
    }
}
