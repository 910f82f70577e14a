/// Directory of known relays
///
/// Fed by network status documents and server descriptors arriving over the
/// control link. Relays are updated in place and only forgotten on restart.

mod policy;
mod relay;

pub use policy::{ExitPolicy, PolicyParseError, PolicyRule, Transport};
pub use relay::Relay;

use crate::control::ConsensusEntry;
use bitmesh_common::{Bandwidth, Fingerprint};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct RelayDirectory {
    relays: HashMap<Fingerprint, Relay>,
    own_fingerprint: Option<Fingerprint>,
}

impl RelayDirectory {
    pub fn new(own_fingerprint: Option<Fingerprint>) -> Self {
        Self {
            relays: HashMap::new(),
            own_fingerprint,
        }
    }

    pub fn own_fingerprint(&self) -> Option<Fingerprint> {
        self.own_fingerprint
    }

    pub fn is_own(&self, fingerprint: &Fingerprint) -> bool {
        self.own_fingerprint.as_ref() == Some(fingerprint)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&Relay> {
        self.relays.get(fingerprint)
    }

    pub fn get_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut Relay> {
        self.relays.get_mut(fingerprint)
    }

    pub fn relays(&self) -> impl Iterator<Item = &Relay> {
        self.relays.values()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn insert(&mut self, relay: Relay) {
        self.relays.insert(relay.fingerprint, relay);
    }

    /// Merge network status entries. Returns the relays that still need a
    /// descriptor fetched.
    pub fn apply_network_status(&mut self, entries: &[ConsensusEntry]) -> Vec<Fingerprint> {
        let mut missing = Vec::new();
        for entry in entries {
            let relay = self
                .relays
                .entry(entry.fingerprint)
                .or_insert_with(|| Relay::new(entry.fingerprint, entry.nickname.clone()));
            relay.nickname = entry.nickname.clone();
            relay.set_flags(entry.flags.iter().cloned());
            if !relay.has_descriptor {
                if let Some(bw) = entry.bandwidth {
                    relay.bandwidth = Bandwidth::from_bytes(bw);
                }
                missing.push(entry.fingerprint);
            }
        }
        missing
    }

    /// A new consensus replaces the flag set of every listed relay. Relays
    /// missing from it stop being Running. Failure scores decay either way.
    pub fn apply_consensus(&mut self, entries: &[ConsensusEntry]) -> Vec<Fingerprint> {
        let listed: HashSet<Fingerprint> = entries.iter().map(|e| e.fingerprint).collect();
        let missing = self.apply_network_status(entries);

        for relay in self.relays.values_mut() {
            if !listed.contains(&relay.fingerprint) {
                relay.flags.remove("Running");
            }
            relay.decay_failures();
        }

        info!(
            "Consensus applied: {} listed, {} known, {} without descriptor",
            listed.len(),
            self.relays.len(),
            missing.len()
        );
        missing
    }

    /// Returns false when the relay is unknown
    pub fn apply_descriptor<S: AsRef<str>>(&mut self, fingerprint: &Fingerprint, lines: &[S]) -> bool {
        match self.relays.get_mut(fingerprint) {
            Some(relay) => {
                relay.apply_descriptor(lines);
                true
            }
            None => {
                debug!("Descriptor for unknown relay {}", fingerprint);
                false
            }
        }
    }

    pub fn add_failure(&mut self, fingerprint: &Fingerprint, amount: f64) {
        if let Some(relay) = self.relays.get_mut(fingerprint) {
            relay.add_failure(amount);
        }
    }

    pub fn on_connection_failed(&mut self, fingerprint: &Fingerprint) {
        debug!("OR connection to {} failed", fingerprint);
        self.add_failure(fingerprint, 1.0);
    }

    /// Relays usable in paths: Running and not an authority
    pub fn usable(&self) -> impl Iterator<Item = &Relay> {
        self.relays
            .values()
            .filter(|relay| relay.is_running() && !relay.is_authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8, flags: &[&str]) -> ConsensusEntry {
        ConsensusEntry {
            nickname: format!("relay{}", byte),
            fingerprint: Fingerprint::from([byte; 20]),
            flags: flags.iter().map(|f| f.to_string()).collect(),
            bandwidth: Some(100),
        }
    }

    #[test]
    fn test_network_status_reports_missing_descriptors() {
        let mut dir = RelayDirectory::new(None);
        let missing = dir.apply_network_status(&[entry(1, &["Running"]), entry(2, &["Running"])]);
        assert_eq!(missing.len(), 2);

        let fp = Fingerprint::from([1; 20]);
        assert!(dir.apply_descriptor(&fp, &["bandwidth 1 1 900"]));
        let missing = dir.apply_network_status(&[entry(1, &["Running"]), entry(2, &["Running"])]);
        assert_eq!(missing, vec![Fingerprint::from([2; 20])]);
        assert_eq!(dir.get(&fp).unwrap().bandwidth, Bandwidth::from_bytes(900));
    }

    #[test]
    fn test_consensus_drops_running_and_decays() {
        let mut dir = RelayDirectory::new(None);
        dir.apply_network_status(&[entry(1, &["Running"]), entry(2, &["Running"])]);
        let gone = Fingerprint::from([2; 20]);
        dir.add_failure(&gone, 4.0);
        dir.on_connection_failed(&Fingerprint::from([1; 20]));

        dir.apply_consensus(&[entry(1, &["Running", "Fast"])]);

        let kept = dir.get(&Fingerprint::from([1; 20])).unwrap();
        assert!(kept.is_running());
        assert!(kept.has_flag("Fast"));
        assert!((kept.failures - 0.5).abs() < f64::EPSILON);

        let dropped = dir.get(&gone).unwrap();
        assert!(!dropped.is_running());
        assert!((dropped.failures - 2.0).abs() < f64::EPSILON);
        assert_eq!(dir.usable().count(), 1);
    }

    #[test]
    fn test_own_relay_and_unknown_descriptor() {
        let own = Fingerprint::from([9; 20]);
        let mut dir = RelayDirectory::new(Some(own));
        assert!(dir.is_own(&own));
        assert!(!dir.is_own(&Fingerprint::from([1; 20])));
        assert!(!dir.apply_descriptor(&Fingerprint::from([3; 20]), &["router x 1.1.1.1 9001"]));
        assert!(dir.is_empty());
    }
}
