use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid IPv4 byte array, expected 4 bytes but got {0}")]
    InvalidLength(usize),
    #[error("sender {0} is not an IPv4 address")]
    NotIpv4(IpAddr),
}

/// Formats a packed IPv4 address as dotted decimal, most significant byte first.
pub fn address_to_text(address: u32) -> String {
    let [a, b, c, d] = address.to_be_bytes();
    format!("{a}.{b}.{c}.{d}")
}

/// Packs exactly four bytes into an address in network byte order.
pub fn bytes_to_address(bytes: &[u8]) -> Result<u32, AddrError> {
    let address_array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| AddrError::InvalidLength(bytes.len()))?;
    Ok(u32::from_be_bytes(address_array))
}

pub fn convert_socket_to_address(source_address: SocketAddr) -> Result<u32, AddrError> {
    match source_address.ip() {
        IpAddr::V4(ip) => bytes_to_address(&ip.octets()),
        //dual stack sockets hand us v4 senders as ::ffff:a.b.c.d
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(mapped) => bytes_to_address(&mapped.octets()),
            None => Err(AddrError::NotIpv4(IpAddr::V6(ip))),
        },
    }
}
