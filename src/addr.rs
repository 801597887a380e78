//! Address literals of the form `<proto>://<host:port>`.
//!
//! Supported protocols are `tcp`, `tcp4` and `tcp6`; an absent protocol
//! defaults to `tcp`. The whole literal is case-insensitive. A `tcp4`
//! literal must resolve to an IPv4 socket address and `tcp6` to IPv6; plain
//! `tcp` infers the family from the host part. An empty host binds the
//! wildcard address of the inferred family.

use std::net::SocketAddr;

use crate::error::Error;

/// Parse an address literal into a socket address.
pub fn parse_addr(literal: &str) -> Result<SocketAddr, Error> {
    let lower = literal.to_ascii_lowercase();
    let (proto, rest) = match lower.split_once("://") {
        Some((p, r)) => (p, r),
        None => ("tcp", lower.as_str()),
    };

    let host_port = match rest.strip_prefix(':') {
        // ":4589" style literals bind the wildcard address.
        Some(port) if proto == "tcp6" => format!("[::]:{port}"),
        Some(port) => format!("0.0.0.0:{port}"),
        None => rest.to_string(),
    };

    let addr: SocketAddr = host_port
        .parse()
        .map_err(|_| Error::InvalidAddress(literal.to_string()))?;

    match proto {
        "tcp" => Ok(addr),
        "tcp4" if addr.is_ipv4() => Ok(addr),
        "tcp6" if addr.is_ipv6() => Ok(addr),
        "tcp4" | "tcp6" => Err(Error::InvalidAddress(format!(
            "{literal}: address family does not match protocol"
        ))),
        _ => Err(Error::InvalidAddress(format!(
            "{literal}: unsupported protocol {proto}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_literal_defaults_to_tcp() {
        let addr = parse_addr("127.0.0.1:8080").unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn proto_prefix() {
        let addr = parse_addr("tcp4://127.0.0.1:4589").unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 4589);

        let addr = parse_addr("tcp6://[::1]:4589").unwrap();
        assert!(addr.is_ipv6());
    }

    #[test]
    fn case_insensitive() {
        let addr = parse_addr("TCP4://127.0.0.1:80").unwrap();
        assert!(addr.is_ipv4());
    }

    #[test]
    fn wildcard_host() {
        let addr = parse_addr("tcp4://:4589").unwrap();
        assert_eq!(addr, "0.0.0.0:4589".parse().unwrap());

        let addr = parse_addr("tcp6://:4589").unwrap();
        assert!(addr.is_ipv6());
    }

    #[test]
    fn family_mismatch_rejected() {
        assert!(parse_addr("tcp4://[::1]:80").is_err());
        assert!(parse_addr("tcp6://127.0.0.1:80").is_err());
    }

    #[test]
    fn unknown_proto_rejected() {
        assert!(parse_addr("udp://127.0.0.1:80").is_err());
        assert!(parse_addr("tcp://not-an-address").is_err());
    }
}
