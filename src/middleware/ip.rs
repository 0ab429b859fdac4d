//! Client identity extraction from peer addresses and proxy headers.
//!
//! Both extractors return a canonical IP text form: IPv4-mapped IPv6
//! addresses come back as IPv4, IPv6 in shortest form, never with brackets
//! or a port. Work is bounded by a single pass over the header bytes, so
//! oversized headers cannot cause proportional allocation.

use crate::error::Error;
use crate::middleware::{KeyFunc, RequestInfo};
use http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Key when the server did not provide a peer address.
const UNKNOWN_PEER: &str = "unknown";

/// Key function extracting the client IP from `X-Forwarded-For`,
/// `X-Real-IP`, then the peer address.
///
/// The forwarded headers are believed without verification, which a direct
/// client can spoof; extracted values are still validated as IPs so garbage
/// cannot fill the store with junk keys. Behind known proxies, use
/// [`trusted_proxy_key`] instead.
pub fn client_ip_key() -> KeyFunc {
    Arc::new(|info: &RequestInfo<'_>| {
        if let Some(xff) = header_str(info.headers, X_FORWARDED_FOR) {
            // Only the first comma-separated segment matters; scanning for
            // the comma keeps the work independent of how many hops an
            // attacker stuffs into the header.
            let first = match xff.find(',') {
                Some(idx) => &xff[..idx],
                None => xff,
            };
            let first = first.trim();
            if !first.is_empty() {
                if let Some(ip) = parse_ip(strip_port(first)) {
                    return ip.to_string();
                }
            }
        }

        if let Some(xri) = header_str(info.headers, X_REAL_IP) {
            if let Some(ip) = parse_ip(strip_port(xri.trim())) {
                return ip.to_string();
            }
        }

        peer_key(info)
    })
}

/// Key function that believes `X-Forwarded-For` only when the request
/// arrives through a known proxy.
///
/// `trusted_proxies` entries are CIDRs (`10.0.0.0/8`) or bare IPs (treated
/// as `/32` or `/128`). The chain is walked right to left across every
/// header line; the first hop outside the trusted set is the client. A
/// segment that does not parse is skipped, never counted as a trusted hop.
pub fn trusted_proxy_key<I, S>(trusted_proxies: I) -> Result<KeyFunc, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut networks = Vec::new();
    for entry in trusted_proxies {
        let entry = entry.as_ref();
        let net = entry
            .parse::<IpNet>()
            .ok()
            .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from));
        match net {
            Some(net) => networks.push(net),
            None => return Err(Error::InvalidTrustedProxy(entry.to_string())),
        }
    }

    Ok(Arc::new(move |info: &RequestInfo<'_>| {
        let Some(peer) = info.peer_addr else {
            return UNKNOWN_PEER.to_string();
        };
        let peer_ip = canonical(peer.ip());

        // An untrusted peer is the authority: nothing it forwarded can be
        // believed.
        if !is_trusted(&networks, peer_ip) {
            return peer_ip.to_string();
        }

        // Walk all header lines right to left. HTTP headers are
        // multi-valued; looking at only the first line would let a second
        // injected line bypass the walk.
        let mut saw_header = false;
        for value in info.headers.get_all(X_FORWARDED_FOR).iter().rev() {
            saw_header = true;
            let Ok(line) = value.to_str() else { continue };
            for segment in line.rsplit(',') {
                let segment = segment.trim();
                if segment.is_empty() {
                    continue;
                }
                let Some(ip) = parse_ip(strip_port(segment)) else { continue };
                if !is_trusted(&networks, ip) {
                    return ip.to_string();
                }
            }
        }
        if !saw_header {
            return peer_ip.to_string();
        }

        // Every hop is trusted: the left-most segment of the first line is
        // the client as reported by our own proxies.
        if let Some(first_line) = header_str(info.headers, X_FORWARDED_FOR) {
            let first = match first_line.find(',') {
                Some(idx) => &first_line[..idx],
                None => first_line,
            };
            let first = first.trim();
            if !first.is_empty() {
                let cleaned = strip_port(first);
                return match cleaned.parse::<IpAddr>() {
                    Ok(ip) => canonical(ip).to_string(),
                    Err(_) => cleaned.to_string(),
                };
            }
        }
        peer_ip.to_string()
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_trusted(networks: &[IpNet], ip: IpAddr) -> bool {
    networks.iter().any(|net| net.contains(&ip))
}

fn peer_key(info: &RequestInfo<'_>) -> String {
    match info.peer_addr {
        Some(addr) => canonical(addr.ip()).to_string(),
        None => UNKNOWN_PEER.to_string(),
    }
}

/// Parse an IP after canonicalization. Returns `None` for anything that is
/// not a valid address.
fn parse_ip(s: &str) -> Option<IpAddr> {
    s.parse::<IpAddr>().ok().map(canonical)
}

/// IPv4-mapped IPv6 addresses compare and print as their IPv4 form.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

/// Strip a port (and IPv6 brackets) from an address without allocating.
///
/// `1.2.3.4:8080` becomes `1.2.3.4`, `[::1]:443` becomes `::1`, and a bare
/// IPv6 address (multiple colons, no brackets) is returned unchanged.
fn strip_port(addr: &str) -> &str {
    if addr.is_empty() {
        return addr;
    }
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            // Malformed; let the parser reject it.
            None => addr,
        };
    }
    match addr.find(':') {
        Some(first) => {
            if addr[first + 1..].contains(':') {
                // More than one colon: bare IPv6.
                addr
            } else {
                &addr[..first]
            }
        }
        None => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Method};
    use std::net::SocketAddr;

    fn info<'a>(
        headers: &'a HeaderMap,
        peer: Option<SocketAddr>,
        method: &'a Method,
    ) -> RequestInfo<'a> {
        RequestInfo { headers, peer_addr: peer, method, path: "/" }
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn strip_port_handles_all_shapes() {
        assert_eq!(strip_port("1.2.3.4:8080"), "1.2.3.4");
        assert_eq!(strip_port("1.2.3.4"), "1.2.3.4");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("[broken"), "[broken");
        assert_eq!(strip_port(""), "");
    }

    #[test]
    fn canonical_unmaps_ipv4_in_ipv6() {
        let ip: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(canonical(ip).to_string(), "192.0.2.1");
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(canonical(ip).to_string(), "2001:db8::1");
    }

    #[test]
    fn default_prefers_first_forwarded_segment() {
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        let key = client_ip_key()(&info(&headers, peer("10.0.0.1:9999"), &method));
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn default_strips_ports_from_forwarded_segments() {
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7:12345"));
        let key = client_ip_key()(&info(&headers, peer("10.0.0.1:80"), &method));
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn default_falls_back_through_real_ip_to_peer() {
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(X_REAL_IP, HeaderValue::from_static("198.51.100.2"));
        let key = client_ip_key()(&info(&headers, peer("10.0.0.1:80"), &method));
        assert_eq!(key, "198.51.100.2");

        let headers = HeaderMap::new();
        let key = client_ip_key()(&info(&headers, peer("10.0.0.9:80"), &method));
        assert_eq!(key, "10.0.0.9");
    }

    #[test]
    fn default_ignores_invalid_forwarded_values() {
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("not-an-ip"));
        let key = client_ip_key()(&info(&headers, peer("127.0.0.1:80"), &method));
        assert_eq!(key, "127.0.0.1");
    }

    #[test]
    fn default_bounds_work_on_huge_headers() {
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        // A megabyte of junk with no commas: one scan, one verdict.
        let huge = "a".repeat(1024 * 1024);
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&huge).unwrap());
        let key = client_ip_key()(&info(&headers, peer("127.0.0.1:80"), &method));
        assert_eq!(key, "127.0.0.1");
    }

    #[test]
    fn default_canonicalizes_mapped_and_long_form_addresses() {
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("::ffff:203.0.113.9"));
        let key = client_ip_key()(&info(&headers, peer("10.0.0.1:80"), &method));
        assert_eq!(key, "203.0.113.9");

        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("2001:0db8:0000:0000:0000:0000:0000:0001"),
        );
        let key = client_ip_key()(&info(&headers, peer("10.0.0.1:80"), &method));
        assert_eq!(key, "2001:db8::1");
    }

    #[test]
    fn default_handles_missing_peer() {
        let method = Method::GET;
        let headers = HeaderMap::new();
        let key = client_ip_key()(&info(&headers, None, &method));
        assert_eq!(key, UNKNOWN_PEER);
    }

    #[test]
    fn trusted_rejects_invalid_configuration() {
        let err = match trusted_proxy_key(["10.0.0.0/8", "bogus"]) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, Error::InvalidTrustedProxy(_)));
    }

    #[test]
    fn untrusted_peer_is_the_authority() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.1"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        // The peer is not a trusted proxy, so its header is ignored.
        let key = key_func(&info(&headers, peer("192.0.2.50:443"), &method));
        assert_eq!(key, "192.0.2.50");
    }

    #[test]
    fn trusted_peer_yields_rightmost_untrusted_hop() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.1"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("198.51.100.1, 192.0.2.1"),
        );
        let key = key_func(&info(&headers, peer("10.0.0.1:1234"), &method));
        assert_eq!(key, "192.0.2.1");
    }

    #[test]
    fn trusted_hops_are_skipped_in_the_walk() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.0/8"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7, 10.0.0.2, 10.0.0.3"),
        );
        let key = key_func(&info(&headers, peer("10.0.0.1:1234"), &method));
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn walk_spans_multiple_header_lines() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.1"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.1"));
        // The later line is closer to us and must be examined first.
        let key = key_func(&info(&headers, peer("10.0.0.1:1234"), &method));
        assert_eq!(key, "203.0.113.1");
    }

    #[test]
    fn invalid_segments_are_skipped_not_trusted() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.0/8"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("198.51.100.9, garbage, 10.0.0.2"),
        );
        let key = key_func(&info(&headers, peer("10.0.0.1:1234"), &method));
        assert_eq!(key, "198.51.100.9");
    }

    #[test]
    fn ports_in_forwarded_segments_are_stripped_before_matching() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.0/8"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7:4711, 10.0.0.2:8080"),
        );
        let key = key_func(&info(&headers, peer("10.0.0.1:1234"), &method));
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn all_trusted_falls_back_to_leftmost_segment() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.0/8"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.5, 10.0.0.2"));
        let key = key_func(&info(&headers, peer("10.0.0.1:1234"), &method));
        assert_eq!(key, "10.0.0.5");
    }

    #[test]
    fn trusted_without_header_returns_peer() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.1"]).unwrap();
        let headers = HeaderMap::new();
        let key = key_func(&info(&headers, peer("10.0.0.1:1234"), &method));
        assert_eq!(key, "10.0.0.1");
    }

    #[test]
    fn trusted_matches_mapped_peer_addresses() {
        let method = Method::GET;
        let key_func = trusted_proxy_key(["10.0.0.1"]).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        // Dual-stack listeners report IPv4 peers as ::ffff:a.b.c.d.
        let key = key_func(&info(&headers, peer("[::ffff:10.0.0.1]:9000"), &method));
        assert_eq!(key, "203.0.113.7");
    }
}
