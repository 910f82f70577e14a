use std::net::Ipv4Addr;
use std::str::FromStr;

/// Kind of traffic a circuit will carry out of its exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Dht,
}

/// One accept/reject line of an exit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRule {
    pub accept: bool,
    pub address: u32,
    pub mask: u32,
    pub port_low: u16,
    pub port_high: u16,
}

impl PolicyRule {
    pub fn matches_address(&self, address: u32) -> bool {
        address & self.mask == self.address
    }

    pub fn matches_port(&self, port: u16) -> bool {
        self.port_low <= port && port <= self.port_high
    }

    /// `Some(accept)` when the rule covers `address:port`
    pub fn check(&self, address: u32, port: u16) -> Option<bool> {
        (self.matches_address(address) && self.matches_port(port)).then_some(self.accept)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid policy line: {0}")]
pub struct PolicyParseError(pub String);

impl FromStr for PolicyRule {
    type Err = PolicyParseError;

    /// `accept 10.0.0.0/8:80-443`, `reject *:*`, `accept 1.2.3.4/255.255.0.0:25`
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = || PolicyParseError(line.to_string());
        let (verb, target) = line.trim().split_once(' ').ok_or_else(bad)?;
        let accept = match verb {
            "accept" => true,
            "reject" => false,
            _ => return Err(bad()),
        };

        let (address_part, port_part) = target.trim().rsplit_once(':').ok_or_else(bad)?;

        let (address, mask) = if address_part == "*" {
            (0, 0)
        } else {
            let (ip, mask) = match address_part.split_once('/') {
                None => (address_part, u32::MAX),
                Some((ip, mask)) => {
                    let mask = match mask.parse::<Ipv4Addr>() {
                        Ok(dotted) => u32::from(dotted),
                        Err(_) => {
                            let bits: u32 = mask.parse().map_err(|_| bad())?;
                            match bits {
                                0 => 0,
                                1..=32 => u32::MAX << (32 - bits),
                                _ => return Err(bad()),
                            }
                        }
                    };
                    (ip, mask)
                }
            };
            let ip: Ipv4Addr = ip.parse().map_err(|_| bad())?;
            (u32::from(ip) & mask, mask)
        };

        let (port_low, port_high) = if port_part == "*" {
            (0, u16::MAX)
        } else {
            match port_part.split_once('-') {
                Some((low, high)) => (
                    low.parse().map_err(|_| bad())?,
                    high.parse().map_err(|_| bad())?,
                ),
                None => {
                    let port = port_part.parse().map_err(|_| bad())?;
                    (port, port)
                }
            }
        };

        Ok(Self {
            accept,
            address,
            mask,
            port_low,
            port_high,
        })
    }
}

/// Ordered exit policy of a relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitPolicy {
    pub rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    /// Whether exit traffic to `host:port` could be allowed.
    ///
    /// With both an address and a port the first matching rule decides.
    /// With only one of them the answer is whether any accept rule covers
    /// it. A host that is not an IPv4 literal cannot be checked, so only
    /// the port counts for it.
    pub fn allows(&self, host: Option<&str>, port: Option<u16>) -> bool {
        let host = host.filter(|h| !h.is_empty());
        let port = port.filter(|p| *p != 0);

        if host.is_none() && port.is_none() {
            return true;
        }

        let address = host
            .and_then(|h| h.parse::<Ipv4Addr>().ok())
            .map(u32::from)
            .filter(|a| *a != 0);

        match (address, port) {
            (Some(address), Some(port)) => self
                .rules
                .iter()
                .find_map(|rule| rule.check(address, port))
                .unwrap_or(false),
            (Some(address), None) => self
                .rules
                .iter()
                .any(|rule| rule.accept && rule.matches_address(address)),
            (None, Some(port)) => self
                .rules
                .iter()
                .any(|rule| rule.accept && rule.matches_port(port)),
            (None, None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(lines: &[&str]) -> ExitPolicy {
        ExitPolicy::new(lines.iter().map(|line| line.parse().unwrap()).collect())
    }

    #[test]
    fn test_parse_rules() {
        let rule: PolicyRule = "accept 10.1.2.3/8:80-443".parse().unwrap();
        assert!(rule.accept);
        assert_eq!(rule.address, u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(rule.mask, 0xFF00_0000);
        assert_eq!((rule.port_low, rule.port_high), (80, 443));

        let dotted: PolicyRule = "reject 192.168.0.0/255.255.0.0:*".parse().unwrap();
        assert!(!dotted.accept);
        assert_eq!(dotted.mask, 0xFFFF_0000);
        assert_eq!((dotted.port_low, dotted.port_high), (0, 65535));

        let all: PolicyRule = "reject *:*".parse().unwrap();
        assert_eq!((all.address, all.mask), (0, 0));

        assert!("allow *:*".parse::<PolicyRule>().is_err());
        assert!("accept 1.2.3.4/40:80".parse::<PolicyRule>().is_err());
    }

    #[test]
    fn test_first_match_wins_for_host_and_port() {
        let p = policy(&["reject 10.0.0.0/8:*", "accept *:80", "reject *:*"]);
        assert!(!p.allows(Some("10.1.1.1"), Some(80)));
        assert!(p.allows(Some("8.8.8.8"), Some(80)));
        assert!(!p.allows(Some("8.8.8.8"), Some(22)));
    }

    #[test]
    fn test_port_only_and_hostnames() {
        let p = policy(&["reject *:25", "accept *:80", "reject *:*"]);
        assert!(p.allows(None, Some(80)));
        assert!(!p.allows(None, Some(25)));
        // not an address literal, so only the port is checked
        assert!(p.allows(Some("example.com"), Some(80)));
        assert!(!p.allows(Some("example.com"), None));
    }

    #[test]
    fn test_host_only() {
        let p = policy(&["accept 1.2.0.0/16:443", "reject *:*"]);
        assert!(p.allows(Some("1.2.3.4"), None));
        assert!(!p.allows(Some("9.9.9.9"), None));
    }

    #[test]
    fn test_vacuous_destination() {
        let p = policy(&["reject *:*"]);
        assert!(p.allows(None, None));
        assert!(p.allows(Some(""), Some(0)));
        assert!(!ExitPolicy::default().allows(None, Some(80)));
    }
}
