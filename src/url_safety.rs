//! SSRF guard for outbound fetches.
//!
//! A hostname string says nothing about where a request will land, so the
//! host is resolved right before the fetch and every resolved address has to
//! be public.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use futures::future::BoxFuture;
use reqwest::Url;

pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

const BLOCKED_HOSTS: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0", "::1"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("url does not parse")]
    Malformed,
    #[error("scheme {0:?} is not allowed")]
    Scheme(String),
    #[error("url has no host")]
    EmptyHost,
    #[error("host {0:?} is blocked")]
    BlockedHost(String),
    #[error("host {host:?} resolves to non-public address {ip}")]
    NonPublicAddress { host: String, ip: IpAddr },
    #[error("host {0:?} did not resolve")]
    Unresolvable(String),
}

/// Decides whether a URL may be fetched. Implemented by [`DnsUrlGuard`];
/// the seam exists so callers can swap in another policy.
pub trait UrlGuard: Send + Sync {
    fn check<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), Rejection>>;

    /// Called synchronously for every redirect hop, so no DNS here.
    fn check_redirect(&self, url: &Url) -> Result<(), Rejection> {
        check_redirect_target(url)
    }
}

/// Production guard: static checks plus just-in-time DNS resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsUrlGuard;

impl UrlGuard for DnsUrlGuard {
    fn check<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(), Rejection>> {
        Box::pin(check_url(url))
    }
}

/// `true` when `url` is safe to fetch right now.
pub async fn is_safe(url: &str) -> bool {
    match check_url(url).await {
        Ok(()) => true,
        Err(reason) => {
            log::info!("rejected unsafe url {url}: {reason}");
            false
        }
    }
}

pub async fn check_url(url: &str) -> Result<(), Rejection> {
    let parsed = Url::parse(url).map_err(|_| Rejection::Malformed)?;
    let (host, port) = static_checks(&parsed)?;

    // Literal addresses resolve without touching DNS.
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| Rejection::Unresolvable(host.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(Rejection::Unresolvable(host));
    }

    if let Some(addr) = addrs.iter().find(|a| is_blocked_ip(a.ip())) {
        return Err(Rejection::NonPublicAddress {
            host,
            ip: addr.ip(),
        });
    }
    Ok(())
}

/// Redirect hop check: the static checks plus literal-IP classification.
/// Hostnames are let through; they were not resolved.
pub fn check_redirect_target(url: &Url) -> Result<(), Rejection> {
    let (host, _) = static_checks(url)?;
    match host.parse::<IpAddr>() {
        Ok(ip) if is_blocked_ip(ip) => Err(Rejection::NonPublicAddress { host, ip }),
        _ => Ok(()),
    }
}

/// Scheme, host presence and blocked-name checks. Returns the host (without
/// IPv6 brackets) and the effective port.
fn static_checks(url: &Url) -> Result<(String, u16), Rejection> {
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(Rejection::Scheme(url.scheme().to_string()));
    }
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or(Rejection::EmptyHost)?;
    if BLOCKED_HOSTS.contains(&host.as_str()) {
        return Err(Rejection::BlockedHost(host));
    }
    let port = url.port_or_known_default().unwrap_or(80);
    Ok((host, port))
}

/// Only `http`/`https` pass. No network.
pub fn has_allowed_scheme(url: &str) -> bool {
    Url::parse(url)
        .map(|u| ALLOWED_SCHEMES.contains(&u.scheme()))
        .unwrap_or(false)
}

/// Private, loopback, link-local, multicast, reserved or unspecified.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || a == 0 // "this network"
        || (a == 100 && (64..=127).contains(&b)) // carrier-grade NAT
        || (a == 192 && b == 0 && c == 0) // IETF protocol assignments
        || (a == 198 && (b == 18 || b == 19)) // benchmarking
        || a >= 240 // reserved
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = embedded_v4(ip) {
        return is_blocked_v4(v4);
    }
    let seg = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (seg[0] & 0xff00) == 0 // ::/8, IPv4-compatible included
        || (seg[0] == 0x0100 && seg[1..4] == [0, 0, 0]) // discard-only, 100::/64
        || (seg[0] == 0x2001 && seg[1] < 0x0200) // IETF protocol assignments, 2001::/23
        || (seg[0] & 0xfe00) == 0xfc00 // unique local
        || (seg[0] & 0xffc0) == 0xfe80 // link-local
        || (seg[0] & 0xffc0) == 0xfec0 // site-local, deprecated
        || (seg[0] == 0x2001 && seg[1] == 0x0db8) // documentation
}

/// IPv4 address a v6 address routes to: mapped, NAT64 well-known prefix or
/// 6to4. These are judged by the IPv4 rules alone.
fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let from = |hi: u16, lo: u16| {
        let [a, b] = hi.to_be_bytes();
        let [c, d] = lo.to_be_bytes();
        Ipv4Addr::new(a, b, c, d)
    };
    match ip.segments() {
        [0x0064, 0xff9b, 0, 0, 0, 0, hi, lo] => Some(from(hi, lo)),
        [0x2002, hi, lo, ..] => Some(from(hi, lo)),
        _ => None,
    }
}
