//! Field-level validation shared by Node Service create/update paths.

use crate::error::NodeError;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::LazyLock;

static DOMAIN_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$")
        .expect("static regex is valid")
});

pub const ALLOWED_PROTOCOLS: &[&str] = &[
    "vless",
    "vmess",
    "trojan",
    "shadowsocks",
    "wireguard",
    "socks",
    "http",
];

/// Trims whitespace and strips a leading scheme and trailing slash, e.g.
/// `" https://1.2.3.4/ "` -> `"1.2.3.4"`.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

/// Accepts an IPv4/IPv6 literal, the literal `localhost`, or a
/// dot-separated domain matching the RFC-style label pattern.
pub fn validate_address(address: &str) -> Result<(), NodeError> {
    if address.is_empty() {
        return Err(NodeError::InvalidAddress("address must not be empty".into()));
    }
    if address == "localhost" {
        return Ok(());
    }
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if DOMAIN_RE.is_match(address) {
        return Ok(());
    }
    Err(NodeError::InvalidAddress(format!("invalid address: {address}")))
}

pub fn validate_port(port: u16) -> Result<(), NodeError> {
    if port == 0 {
        return Err(NodeError::InvalidNode("port must be in [1,65535]".into()));
    }
    Ok(())
}

pub fn validate_weight(weight: u8) -> Result<(), NodeError> {
    if !(1..=100).contains(&weight) {
        return Err(NodeError::InvalidNode("weight must be in [1,100]".into()));
    }
    Ok(())
}

pub fn validate_threshold(value: u8, field: &str) -> Result<(), NodeError> {
    if value > 100 {
        return Err(NodeError::InvalidNode(format!("{field} must be in [0,100]")));
    }
    Ok(())
}

pub fn validate_ip_whitelist(entries: &[String]) -> Result<(), NodeError> {
    for entry in entries {
        if entry.parse::<IpNetwork>().is_err() && entry.parse::<IpAddr>().is_err() {
            return Err(NodeError::InvalidNode(format!(
                "invalid ip whitelist entry: {entry}"
            )));
        }
    }
    Ok(())
}

pub fn validate_tls_domain(tls_enabled: bool, domain: Option<&str>) -> Result<(), NodeError> {
    if !tls_enabled {
        return Ok(());
    }
    match domain {
        Some(d) if DOMAIN_RE.is_match(d) => Ok(()),
        _ => Err(NodeError::InvalidNode(
            "tls_domain must be a valid domain when tls is enabled".into(),
        )),
    }
}

pub fn validate_protocols(protocols: &[String]) -> Result<(), NodeError> {
    for proto in protocols {
        if !ALLOWED_PROTOCOLS.iter().any(|p| p.eq_ignore_ascii_case(proto)) {
            return Err(NodeError::InvalidNode(format!("unsupported protocol: {proto}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ipv4_literal() {
        assert!(validate_address("192.168.1.1").is_ok());
    }

    #[test]
    fn accepts_ipv6_literal() {
        assert!(validate_address("::1").is_ok());
    }

    #[test]
    fn accepts_localhost() {
        assert!(validate_address("localhost").is_ok());
    }

    #[test]
    fn accepts_domain() {
        assert!(validate_address("node1.example.com").is_ok());
    }

    #[test]
    fn rejects_bad_addresses() {
        for bad in ["256.256.256.256", "192.168.1", "-x.com", ".x.com", ""] {
            assert!(validate_address(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn normalizes_scheme_and_trailing_slash() {
        assert_eq!(normalize_address(" https://1.2.3.4/ "), "1.2.3.4");
        assert_eq!(normalize_address("http://example.com/"), "example.com");
    }

    #[test]
    fn whitelist_accepts_cidr_and_literal() {
        assert!(validate_ip_whitelist(&["10.0.0.0/8".into(), "1.2.3.4".into()]).is_ok());
        assert!(validate_ip_whitelist(&["not-an-ip".into()]).is_err());
    }

    #[test]
    fn protocols_case_insensitive() {
        assert!(validate_protocols(&["VMess".into(), "trojan".into()]).is_ok());
        assert!(validate_protocols(&["carrier-pigeon".into()]).is_err());
    }
}
