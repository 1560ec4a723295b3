//! `host:port` address syntax shared by the handshake, gossip and the
//! candidate store.
//!
//! A host is a domain name (dot-separated labels ending in an alphabetic
//! TLD), `localhost`, or a dotted IPv4 address.  Ports are 1..=65535.

use {
    crate::error::{GeoWebError, Result},
    regex::Regex,
    std::{net::Ipv4Addr, sync::LazyLock},
};

static DOMAIN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$")
        .expect("static domain regex")
});

static DOTTED_QUAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,3}(?:\.[0-9]{1,3}){3}$").expect("static ipv4 regex"));

/// Whether `host` is a domain name, `localhost`, or a dotted IPv4 address.
pub fn is_valid_hostname(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    if DOTTED_QUAD.is_match(host) {
        return host.parse::<Ipv4Addr>().is_ok();
    }
    DOMAIN_NAME.is_match(host)
}

/// Whether `port` is usable as a remote port.
pub fn is_valid_port(port: u32) -> bool {
    (1..=65_535).contains(&port)
}

/// Whether `address` is a well-formed `host:port` string.
pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}

/// Split a `host:port` string into its parts.
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    let invalid = || GeoWebError::InvalidAddress(address.to_string());
    let mut parts = address.split(':');
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    // `u32::from_str` also takes a leading `+`
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let port: u32 = port.parse().map_err(|_| invalid())?;
    if !is_valid_hostname(host) || !is_valid_port(port) {
        return Err(invalid());
    }
    let port = u16::try_from(port).map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Join a host and port into the canonical `host:port` form.
pub fn format_address(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}
