/// Per-application circuit pools
///
/// Every consumer of circuits (the SOCKS front end, an internal downloader)
/// is an `Application`. It owns a set of live circuits and the streams it
/// has been handed, remembers which ports its streams go to, and can be
/// paused when the wallet runs dry.

use super::stream::{DetachPolicy, StreamId};
use super::types::{Circuit, CircuitKey};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Identifier of a circuit-consuming application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub u32);

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "app#{}", self.0)
    }
}

/// Something that can be stopped from using the network for a while
pub trait Pausable {
    fn pause(&mut self);
    fn unpause(&mut self);
    fn is_paused(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub name: String,
    pub path_length: usize,
    pub max_circuits: usize,
    pub exit_country: Option<String>,
    pub pays: bool,
    pub detach_policy: DetachPolicy,
}

impl ApplicationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path_length: bitmesh_common::routing::DEFAULT_CIRCUIT_LENGTH,
            max_circuits: bitmesh_common::routing::MAX_OPEN_CIRCUITS,
            exit_country: None,
            pays: true,
            detach_policy: DetachPolicy::Reattach,
        }
    }
}

#[derive(Debug)]
pub struct Application {
    pub id: AppId,
    pub config: ApplicationConfig,
    paused: bool,

    /// Circuits built for this application and not yet done
    pub live_circuits: BTreeSet<CircuitKey>,

    pub streams: HashSet<StreamId>,

    /// How many streams went to each destination port
    pub port_history: HashMap<u16, u32>,
}

impl Application {
    pub fn new(id: AppId, config: ApplicationConfig) -> Self {
        Self {
            id,
            config,
            paused: false,
            live_circuits: BTreeSet::new(),
            streams: HashSet::new(),
            port_history: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn record_port(&mut self, port: u16) {
        *self.port_history.entry(port).or_insert(0) += 1;
    }

    /// The destination port most streams went to. Ties go to the lower port.
    pub fn most_popular_port(&self) -> Option<u16> {
        self.port_history
            .iter()
            .max_by(|(port_a, count_a), (port_b, count_b)| {
                count_a.cmp(count_b).then(port_b.cmp(port_a))
            })
            .map(|(port, _)| *port)
    }

    pub fn add_circuit(&mut self, key: CircuitKey) {
        self.live_circuits.insert(key);
    }

    pub fn remove_circuit(&mut self, key: &CircuitKey) {
        self.live_circuits.remove(key);
    }

    pub fn clear_history(&mut self) {
        self.port_history.clear();
    }
}

impl Pausable for Application {
    fn pause(&mut self) {
        self.paused = true;
    }

    fn unpause(&mut self) {
        self.paused = false;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}

/// Order circuits by how good they are for a new stream: dirty before
/// clean, ready before launching, older before newer
pub fn compare_circuits(a: &Circuit, b: &Circuit) -> Ordering {
    b.is_dirty()
        .cmp(&a.is_dirty())
        .then(b.is_ready().cmp(&a.is_ready()))
        .then(a.created_at.cmp(&b.created_at))
}

/// The best candidate, if any
pub fn best_circuit<'a, I>(candidates: I) -> Option<&'a Circuit>
where
    I: IntoIterator<Item = &'a Circuit>,
{
    candidates.into_iter().min_by(|a, b| compare_circuits(a, b))
}
