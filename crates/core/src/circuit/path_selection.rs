use crate::directory::{Relay, RelayDirectory, Transport};
use bitmesh_common::{routing, Fingerprint};
use rand::Rng;
use std::collections::HashSet;

/// Criteria for selecting relays for a circuit
#[derive(Debug, Clone)]
pub struct PathSelectionCriteria {
    pub circuit_length: usize,

    /// Destination the exit must allow
    pub host: Option<String>,
    pub port: Option<u16>,

    pub exit_country: Option<String>,

    /// Exits never to pick (usually the exits of our other live circuits)
    pub ignore_exits: HashSet<Fingerprint>,

    pub transport: Transport,
}

impl Default for PathSelectionCriteria {
    fn default() -> Self {
        Self {
            circuit_length: routing::DEFAULT_CIRCUIT_LENGTH,
            host: None,
            port: None,
            exit_country: None,
            ignore_exits: HashSet::new(),
            transport: Transport::Tcp,
        }
    }
}

impl PathSelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_circuit_length(mut self, length: usize) -> Self {
        self.circuit_length = length.clamp(1, routing::MAX_CIRCUIT_LENGTH);
        self
    }

    pub fn with_destination(mut self, host: Option<&str>, port: Option<u16>) -> Self {
        self.host = host.filter(|h| !h.is_empty()).map(str::to_string);
        self.port = port.filter(|p| *p != 0);
        self
    }

    pub fn with_exit_country(mut self, country: Option<String>) -> Self {
        self.exit_country = country;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn ignore_exits<I: IntoIterator<Item = Fingerprint>>(mut self, exits: I) -> Self {
        self.ignore_exits.extend(exits);
        self
    }

    fn accepts_exit(&self, relay: &Relay) -> bool {
        relay.is_in_country(self.exit_country.as_deref())
            && relay.will_exit_to(self.host.as_deref(), self.port, self.transport)
            && !self.ignore_exits.contains(&relay.fingerprint)
    }
}

/// Bandwidth weighted path selection
///
/// The exit is chosen first among relays whose policy allows the
/// destination. The remaining hops come from the other relays, weighted up
/// by how plentiful they are relative to exits so that scarce exit capacity
/// is saved for exit traffic.
pub struct PathSelector;

impl PathSelector {
    pub fn select_path(
        directory: &RelayDirectory,
        criteria: &PathSelectionCriteria,
    ) -> Result<Vec<Fingerprint>, PathSelectionError> {
        Self::select_path_with_rng(directory, criteria, &mut rand::thread_rng())
    }

    pub fn select_path_with_rng<R: Rng + ?Sized>(
        directory: &RelayDirectory,
        criteria: &PathSelectionCriteria,
        rng: &mut R,
    ) -> Result<Vec<Fingerprint>, PathSelectionError> {
        let length = criteria.circuit_length.max(1);

        let (mut exits, middles): (Vec<&Relay>, Vec<&Relay>) =
            directory.usable().partition(|relay| criteria.accepts_exit(relay));
        let middles: Vec<&Relay> = middles
            .into_iter()
            .filter(|relay| !directory.is_own(&relay.fingerprint))
            .collect();

        if exits.len() > routing::EXIT_SCARCITY_CUTOFF || length <= 2 {
            exits.retain(|relay| !directory.is_own(&relay.fingerprint));
        }

        if exits.is_empty() {
            return Err(PathSelectionError::NoSuitableExit);
        }

        let exit_weights: Vec<f64> = exits.iter().map(|relay| relay.score()).collect();
        let exit_index = weighted_pick(&exit_weights, rng);
        let exit = exits[exit_index];

        if length <= 1 {
            return Ok(vec![exit.fingerprint]);
        }

        let ratio = 2.0 + middles.len() as f64 / exits.len() as f64;

        let mut pool: Vec<(&Relay, f64)> = middles
            .iter()
            .map(|relay| (*relay, ratio * relay.score()))
            .collect();
        pool.extend(
            exits
                .iter()
                .enumerate()
                .filter(|(index, relay)| {
                    *index != exit_index && !directory.is_own(&relay.fingerprint)
                })
                .map(|(_, relay)| (*relay, relay.score())),
        );

        let required = length - 1;
        if pool.len() < required {
            return Err(PathSelectionError::InsufficientNodes {
                available: pool.len(),
                required,
            });
        }

        let mut path = vec![exit.fingerprint];
        for _ in 0..required {
            let weights: Vec<f64> = pool.iter().map(|(_, weight)| *weight).collect();
            let (relay, _) = pool.remove(weighted_pick(&weights, rng));
            path.insert(0, relay.fingerprint);
        }

        Ok(path)
    }
}

/// Cumulative scan over `weights`. Falls back to the last index when float
/// rounding leaves `r` above the running total.
fn weighted_pick<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let r = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if cumulative >= r {
            return index;
        }
    }
    weights.len().saturating_sub(1)
}

/// Errors that can occur during path selection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathSelectionError {
    #[error("Insufficient relays available: {available} < {required}")]
    InsufficientNodes { available: usize, required: usize },

    #[error("No suitable exit relay found")]
    NoSuitableExit,
}
