use super::policy::{ExitPolicy, PolicyRule, Transport};
use bitmesh_common::{routing, Bandwidth, Fingerprint};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// A relay as known from the consensus and its descriptor
#[derive(Debug, Clone)]
pub struct Relay {
    pub fingerprint: Fingerprint,

    pub nickname: String,

    pub address: Option<Ipv4Addr>,

    pub or_port: u16,

    /// Consensus flags (Running, Valid, Fast, Exit, Authority, ...)
    pub flags: BTreeSet<String>,

    /// Observed bandwidth from the descriptor, or the consensus weight
    pub bandwidth: Bandwidth,

    pub exit_policy: ExitPolicy,

    /// Two letter country code, upper case
    pub country: Option<String>,

    pub allows_dht: bool,

    pub uptime: u64,

    /// Decaying count of failed circuits and connections through this relay
    pub failures: f64,

    /// Whether a descriptor has been applied yet
    pub has_descriptor: bool,
}

impl Relay {
    pub fn new(fingerprint: Fingerprint, nickname: impl Into<String>) -> Self {
        Self {
            fingerprint,
            nickname: nickname.into(),
            address: None,
            or_port: 0,
            flags: BTreeSet::new(),
            bandwidth: Bandwidth::default(),
            exit_policy: ExitPolicy::default(),
            country: None,
            allows_dht: false,
            uptime: 0,
            failures: 0.0,
            has_descriptor: false,
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_running(&self) -> bool {
        self.has_flag("Running")
    }

    pub fn is_authority(&self) -> bool {
        self.has_flag("Authority")
            || self
                .nickname
                .to_ascii_lowercase()
                .contains(routing::AUTHORITY_MARKER)
    }

    pub fn set_flags<I, S>(&mut self, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
    }

    /// Estimated chance that a circuit through this relay fails
    pub fn failure_probability(&self) -> f64 {
        self.failures / (self.failures + 2.0)
    }

    /// Selection weight: bandwidth discounted by the failure estimate
    pub fn score(&self) -> f64 {
        let bw = match self.bandwidth.as_bytes() {
            0 => routing::INITIAL_BW,
            bw => bw,
        };
        bw as f64 * (1.0 - self.failure_probability())
    }

    pub fn add_failure(&mut self, amount: f64) {
        self.failures += amount;
    }

    pub fn decay_failures(&mut self) {
        self.failures /= 2.0;
    }

    pub fn is_in_country(&self, country: Option<&str>) -> bool {
        match country {
            None => true,
            Some(wanted) => self
                .country
                .as_deref()
                .map(|ours| ours.eq_ignore_ascii_case(wanted))
                .unwrap_or(false),
        }
    }

    /// Whether the relay would carry our traffic out to the destination
    pub fn will_exit_to(&self, host: Option<&str>, port: Option<u16>, transport: Transport) -> bool {
        match transport {
            Transport::Dht => self.allows_dht,
            Transport::Tcp => self.exit_policy.allows(host, port),
        }
    }

    /// Apply the body of a server descriptor. Unknown lines are ignored.
    pub fn apply_descriptor<S: AsRef<str>>(&mut self, lines: &[S]) {
        let mut policy = ExitPolicy::default();

        for line in lines {
            let line = line.as_ref().trim();
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("router") => {
                    if let Some(nickname) = parts.next() {
                        self.nickname = nickname.to_string();
                    }
                    self.address = parts.next().and_then(|ip| ip.parse().ok());
                    self.or_port = parts.next().and_then(|port| port.parse().ok()).unwrap_or(0);
                }
                Some("bandwidth") => {
                    if let Some(observed) = parts.nth(2).and_then(|bw| bw.parse().ok()) {
                        self.bandwidth = Bandwidth::from_bytes(observed);
                    }
                }
                Some("accept") | Some("reject") => match line.parse::<PolicyRule>() {
                    Ok(rule) => policy.push(rule),
                    Err(err) => tracing::debug!("{}: {}", self.nickname, err),
                },
                Some("country") => {
                    self.country = parts
                        .next()
                        .filter(|code| *code != "??")
                        .map(str::to_ascii_uppercase);
                }
                Some("allow-dht-exit") => self.allows_dht = parts.next() == Some("1"),
                Some("uptime") => {
                    self.uptime = parts.next().and_then(|up| up.parse().ok()).unwrap_or(0);
                }
                _ => {}
            }
        }

        self.exit_policy = policy;
        self.has_descriptor = true;
    }
}
