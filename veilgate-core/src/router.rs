//! Destination classification: proxy, bypass, or block.
//!
//! The router is a policy oracle over line-oriented lists: each line is a
//! domain suffix, an IP address, or a CIDR range. Lookup order is block,
//! then proxy, then bypass; anything unmatched gets the default policy.

use std::net::IpAddr;

use veilgate_protocol::Address;

use crate::config::{Policy, RouterConfig};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct MatchList {
    domains: Vec<String>,
    cidrs: Vec<Cidr>,
}

#[derive(Debug, Clone, Copy)]
struct Cidr {
    net: u128,
    mask: u128,
    v4: bool,
}

impl Cidr {
    fn parse(line: &str) -> Option<Self> {
        let (ip_part, prefix) = match line.split_once('/') {
            Some((ip, len)) => (ip, len.parse::<u32>().ok()?),
            None => (line, u32::MAX),
        };
        let ip: IpAddr = ip_part.parse().ok()?;
        let (bits, width, v4) = match ip {
            IpAddr::V4(v4) => (u32::from(v4) as u128, 32u32, true),
            IpAddr::V6(v6) => (u128::from(v6), 128u32, false),
        };
        let prefix = if prefix == u32::MAX { width } else { prefix };
        if prefix > width {
            return None;
        }
        let mask = if prefix == 0 {
            0
        } else {
            (!0u128) << (width - prefix)
        };
        // v4 masks live in the low 32 bits
        let mask = if v4 { mask & 0xFFFF_FFFF } else { mask };
        Some(Self {
            net: bits & mask,
            mask,
            v4,
        })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        let (bits, v4) = match ip {
            IpAddr::V4(v4) => (u32::from(v4) as u128, true),
            IpAddr::V6(v6) => (u128::from(v6), false),
        };
        self.v4 == v4 && bits & self.mask == self.net
    }
}

impl MatchList {
    fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        match Cidr::parse(line) {
            Some(cidr) => self.cidrs.push(cidr),
            None => self.domains.push(line.to_ascii_lowercase()),
        }
    }

    fn matches(&self, addr: &Address) -> bool {
        match addr {
            Address::Ipv4(ip, _) => {
                let ip = IpAddr::V4(*ip);
                self.cidrs.iter().any(|c| c.contains(ip))
            }
            Address::Ipv6(ip, _) => {
                let ip = IpAddr::V6(*ip);
                self.cidrs.iter().any(|c| c.contains(ip))
            }
            Address::Domain(domain, _) => {
                let domain = domain.to_ascii_lowercase();
                self.domains.iter().any(|suffix| {
                    domain == *suffix
                        || (domain.len() > suffix.len()
                            && domain.ends_with(suffix.as_str())
                            && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
                })
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.cidrs.is_empty()
    }
}

pub struct Router {
    default: Policy,
    block: MatchList,
    proxy: MatchList,
    bypass: MatchList,
}

impl Router {
    pub fn from_config(cfg: &RouterConfig) -> Result<Self> {
        Ok(Self {
            default: cfg.default_policy,
            block: load_lists(&cfg.block_files)?,
            proxy: load_lists(&cfg.proxy_files)?,
            bypass: load_lists(&cfg.bypass_files)?,
        })
    }

    /// A router that sends everything to the default policy.
    pub fn all(default: Policy) -> Self {
        Self {
            default,
            block: MatchList::default(),
            proxy: MatchList::default(),
            bypass: MatchList::default(),
        }
    }

    pub fn decide(&self, addr: &Address) -> Policy {
        if self.block.matches(addr) {
            return Policy::Block;
        }
        if self.proxy.matches(addr) {
            return Policy::Proxy;
        }
        if self.bypass.matches(addr) {
            return Policy::Bypass;
        }
        self.default
    }

    pub fn has_rules(&self) -> bool {
        !(self.block.is_empty() && self.proxy.is_empty() && self.bypass.is_empty())
    }
}

fn load_lists(paths: &[String]) -> Result<MatchList> {
    let mut list = MatchList::default();
    for path in paths {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config_with_source(format!("cannot read list file {path}"), e))?;
        for line in data.lines() {
            list.push_line(line);
        }
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn router_with(block: &[&str], proxy: &[&str], bypass: &[&str]) -> Router {
        let mut r = Router::all(Policy::Proxy);
        for l in block {
            r.block.push_line(l);
        }
        for l in proxy {
            r.proxy.push_line(l);
        }
        for l in bypass {
            r.bypass.push_line(l);
        }
        r
    }

    #[test]
    fn default_policy_applies_when_nothing_matches() {
        let r = Router::all(Policy::Bypass);
        assert_eq!(r.decide(&Address::Domain("example.com".into(), 443)), Policy::Bypass);
    }

    #[test]
    fn domain_suffix_matching() {
        let r = router_with(&["ads.example"], &[], &["example.com"]);
        assert_eq!(r.decide(&Address::Domain("ads.example".into(), 80)), Policy::Block);
        assert_eq!(r.decide(&Address::Domain("tracker.ads.example".into(), 80)), Policy::Block);
        assert_eq!(r.decide(&Address::Domain("www.example.com".into(), 80)), Policy::Bypass);
        // no partial-label match
        assert_eq!(r.decide(&Address::Domain("notexample.com".into(), 80)), Policy::Proxy);
    }

    #[test]
    fn cidr_matching() {
        let r = router_with(&[], &[], &["10.0.0.0/8", "192.168.1.1"]);
        assert_eq!(r.decide(&Address::Ipv4(Ipv4Addr::new(10, 1, 2, 3), 80)), Policy::Bypass);
        assert_eq!(r.decide(&Address::Ipv4(Ipv4Addr::new(192, 168, 1, 1), 80)), Policy::Bypass);
        assert_eq!(r.decide(&Address::Ipv4(Ipv4Addr::new(192, 168, 1, 2), 80)), Policy::Proxy);
    }

    #[test]
    fn block_wins_over_other_lists() {
        let r = router_with(&["evil.example"], &["evil.example"], &["evil.example"]);
        assert_eq!(r.decide(&Address::Domain("evil.example".into(), 80)), Policy::Block);
    }

    #[test]
    fn ipv6_cidr() {
        let r = router_with(&[], &[], &["2001:db8::/32"]);
        let inside: std::net::Ipv6Addr = "2001:db8::1".parse().unwrap();
        let outside: std::net::Ipv6Addr = "2001:db9::1".parse().unwrap();
        assert_eq!(r.decide(&Address::Ipv6(inside, 80)), Policy::Bypass);
        assert_eq!(r.decide(&Address::Ipv6(outside, 80)), Policy::Proxy);
    }
}
