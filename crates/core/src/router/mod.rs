/// Circuit and stream routing
///
/// The router owns every circuit, stream and application. It does no I/O:
/// control events, command replies, bank results and a once-a-second tick
/// go in, and the commands it wants sent to the daemon come out of an
/// outbox tagged with the [`Purpose`] their reply should be routed to.

mod commands;
mod dispatch;
mod events;
mod payments;
mod snapshot;

pub use dispatch::{EventDispatcher, EventHandler};
pub use snapshot::{AppSummary, CircuitSummary, RouterSnapshot};

use crate::circuit::{
    best_circuit, reason, AppId, Application, ApplicationConfig, Circuit, CircuitId, CircuitKey,
    DetachPolicy, Pausable, PathSelectionCriteria, PathSelector, Stream, StreamId, StreamStatus,
};
use crate::control::{Command, EventKind};
use crate::directory::{RelayDirectory, Transport};
use crate::payment::REASON_TIMEOUT;
use crate::wallet::Wallet;
use bitmesh_common::{routing, BitmeshError, Fingerprint, NodeConfig, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Application that receives streams nobody registered for
pub const DEFAULT_APP: AppId = AppId(0);

/// Circuit close reason used when an application is done with its circuits
pub const REASON_FINISHED: u8 = 9;

/// Finished circuits stay visible in snapshots this long
const CIRCUIT_RETENTION: Duration = Duration::from_secs(60);

/// Why a command was sent, so its reply finds its way back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purpose {
    Extend(CircuitKey),
    Attach { stream: StreamId, circuit: CircuitKey },
    Convert(CircuitKey),
    AddStartTokens(CircuitKey),
    AddTokens { circuit: CircuitKey, read: u64, write: u64 },
    SendPayment(CircuitKey),
    Descriptor(Fingerprint),
    NetworkStatus,
    /// Only a failure is worth a log line
    Fire,
}

/// A command waiting to be written to the control link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub purpose: Purpose,
    pub command: Command,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub circuit_length: usize,
    pub max_circuits: usize,
    pub payments_enabled: bool,
    pub exit_country: Option<String>,
}

impl RouterSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            circuit_length: config.circuit_length,
            max_circuits: config.max_circuits,
            payments_enabled: config.payments_enabled,
            exit_country: config.exit_country.clone(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

pub struct Router {
    settings: RouterSettings,
    directory: RelayDirectory,
    wallet: Wallet,

    circuits: HashMap<CircuitKey, Circuit>,
    circuit_ids: HashMap<CircuitId, CircuitKey>,
    /// Paying circuits by the id the first hop knows them under
    link_circuits: HashMap<(Fingerprint, u32), CircuitKey>,
    streams: HashMap<StreamId, Stream>,
    apps: BTreeMap<AppId, Application>,

    /// Source port of a client connection -> application expecting it
    expected_streams: HashMap<u16, AppId>,
    /// Applications paused because the wallet ran dry
    funds_paused: BTreeSet<AppId>,
    pending_descriptors: HashSet<Fingerprint>,

    outbox: VecDeque<Outgoing>,
    dispatcher: EventDispatcher,

    link_up: bool,
    bootstrapped: bool,
    bootstrap_progress: u32,
    logged_in: bool,

    bytes_read: u64,
    bytes_written: u64,

    next_key: u64,
    next_app: u32,
}

impl Router {
    pub fn new(settings: RouterSettings, directory: RelayDirectory, wallet: Wallet) -> Self {
        let mut default_config = ApplicationConfig::new("default");
        default_config.path_length = settings.circuit_length;
        default_config.max_circuits = settings.max_circuits;
        default_config.exit_country = settings.exit_country.clone();
        default_config.pays = settings.payments_enabled;

        let mut apps = BTreeMap::new();
        apps.insert(DEFAULT_APP, Application::new(DEFAULT_APP, default_config));

        Self {
            logged_in: !settings.payments_enabled,
            settings,
            directory,
            wallet,
            circuits: HashMap::new(),
            circuit_ids: HashMap::new(),
            link_circuits: HashMap::new(),
            streams: HashMap::new(),
            apps,
            expected_streams: HashMap::new(),
            funds_paused: BTreeSet::new(),
            pending_descriptors: HashSet::new(),
            outbox: VecDeque::new(),
            dispatcher: EventDispatcher::default(),
            link_up: false,
            bootstrapped: true,
            bootstrap_progress: 0,
            bytes_read: 0,
            bytes_written: 0,
            next_key: 1,
            next_app: DEFAULT_APP.0 + 1,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn directory(&self) -> &RelayDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut RelayDirectory {
        &mut self.directory
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn wallet_mut(&mut self) -> &mut Wallet {
        &mut self.wallet
    }

    /// Connected, authenticated and bootstrapped far enough to build circuits
    pub fn is_link_ready(&self) -> bool {
        self.link_up && self.bootstrapped
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn set_logged_in(&mut self, logged_in: bool) {
        self.logged_in = logged_in;
    }

    /// Event classes to subscribe to
    pub fn event_kinds(&self) -> Vec<EventKind> {
        self.dispatcher.kinds()
    }

    /// Drain the commands queued since the last call
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        self.outbox.drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn push(&mut self, purpose: Purpose, command: Command) {
        self.outbox.push_back(Outgoing { purpose, command });
    }

    fn allocate_key(&mut self) -> CircuitKey {
        let key = CircuitKey(self.next_key);
        self.next_key += 1;
        key
    }

    // Applications

    pub fn add_application(&mut self, config: ApplicationConfig) -> AppId {
        let id = AppId(self.next_app);
        self.next_app += 1;
        info!("Registered application {} ({})", config.name, id);
        self.apps.insert(id, Application::new(id, config));
        id
    }

    pub fn application(&self, id: AppId) -> Option<&Application> {
        self.apps.get(&id)
    }

    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.apps.values()
    }

    /// Stop an application from using the network and close what it has open
    pub fn pause_application(&mut self, id: AppId, now: Instant) {
        match self.apps.get_mut(&id) {
            Some(app) if !app.is_paused() => {
                info!("Pausing {}", app.name());
                app.pause();
            }
            _ => return,
        }
        self.close_all(id, now);
    }

    pub fn unpause_application(&mut self, id: AppId) {
        self.funds_paused.remove(&id);
        if let Some(app) = self.apps.get_mut(&id) {
            if app.is_paused() {
                info!("Unpausing {}", app.name());
                app.unpause();
            }
        }
    }

    // Lookups

    pub fn get_circuit(&self, key: CircuitKey) -> Option<&Circuit> {
        self.circuits.get(&key)
    }

    pub fn circuit_by_id(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuit_ids.get(&id).and_then(|key| self.circuits.get(key))
    }

    pub fn circuits(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.values()
    }

    pub fn get_stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    // Circuits

    /// Launch a circuit over an explicit path for `app`
    pub fn create_circuit(&mut self, app_id: AppId, path: Vec<Fingerprint>) -> Result<CircuitKey> {
        if !self.is_link_ready() {
            return Err(BitmeshError::dependency("control link is not ready"));
        }
        if path.is_empty() {
            return Err(BitmeshError::internal("empty circuit path"));
        }
        let pays = self.settings.payments_enabled;
        let key = self.allocate_key();
        let app = self
            .apps
            .get_mut(&app_id)
            .ok_or_else(|| BitmeshError::internal(format!("unknown application {}", app_id)))?;
        let pays = pays && app.config.pays;
        app.add_circuit(key);

        info!(
            "Launching {} for {} via {}",
            key,
            app.name(),
            path.iter().map(|fp| fp.to_hex()).collect::<Vec<_>>().join(",")
        );
        self.circuits.insert(key, Circuit::launch(key, app_id, path.clone(), pays));
        self.push(Purpose::Extend(key), Command::ExtendCircuit { path });
        Ok(key)
    }

    /// Pick a path for a destination and launch a circuit over it
    pub fn build_circuit(
        &mut self,
        app_id: AppId,
        host: Option<&str>,
        port: Option<u16>,
        force: bool,
        transport: Transport,
    ) -> Result<CircuitKey> {
        let app = self
            .apps
            .get(&app_id)
            .ok_or_else(|| BitmeshError::internal(format!("unknown application {}", app_id)))?;
        if !self.is_link_ready() {
            return Err(BitmeshError::dependency("control link is not ready"));
        }
        if !self.logged_in {
            return Err(BitmeshError::dependency("not logged in to the bank"));
        }
        if app.is_paused() {
            return Err(BitmeshError::dependency(format!("{} is paused", app.name())));
        }

        let live: Vec<&Circuit> = app
            .live_circuits
            .iter()
            .filter_map(|key| self.circuits.get(key))
            .filter(|circuit| circuit.is_open())
            .collect();
        if live.len() >= app.config.max_circuits && !force {
            return Err(BitmeshError::dependency(format!(
                "{} already has {} open circuits",
                app.name(),
                live.len()
            )));
        }

        let criteria = PathSelectionCriteria::new()
            .with_circuit_length(app.config.path_length)
            .with_destination(host, port)
            .with_exit_country(app.config.exit_country.clone())
            .with_transport(transport)
            .ignore_exits(live.iter().filter_map(|circuit| circuit.exit().copied()));

        let path = PathSelector::select_path(&self.directory, &criteria)
            .map_err(|err| BitmeshError::dependency(err.to_string()))?;
        self.create_circuit(app_id, path)
    }

    /// Best existing circuit for a destination, or a freshly launched one.
    /// Ready circuits win over launching ones.
    pub fn find_or_build_best_circuit(
        &mut self,
        app_id: AppId,
        host: Option<&str>,
        port: Option<u16>,
        ignore: &HashSet<CircuitKey>,
        force: bool,
        transport: Transport,
    ) -> Option<CircuitKey> {
        let app = self.apps.get(&app_id)?;
        let country = app.config.exit_country.as_deref();
        let candidates: Vec<&Circuit> = app
            .live_circuits
            .iter()
            .filter(|key| !ignore.contains(key))
            .filter_map(|key| self.circuits.get(key))
            .filter(|circuit| circuit.will_accept_connection(&self.directory, host, port, transport))
            .filter(|circuit| {
                circuit
                    .exit()
                    .and_then(|exit| self.directory.get(exit))
                    .map(|relay| relay.is_in_country(country))
                    .unwrap_or(false)
            })
            .collect();

        let found = best_circuit(candidates.iter().copied().filter(|c| c.is_ready()))
            .or_else(|| best_circuit(candidates.iter().copied().filter(|c| c.is_launching())))
            .map(|circuit| circuit.key);
        if found.is_some() {
            return found;
        }

        match self.build_circuit(app_id, host, port, force, transport) {
            Ok(key) => Some(key),
            Err(err) => {
                debug!("No circuit for {}:{}: {}", host.unwrap_or("*"), port.unwrap_or(0), err);
                None
            }
        }
    }

    /// Close a circuit. Safe to call any number of times.
    pub fn close_circuit(&mut self, key: CircuitKey, reason: u8, now: Instant) {
        let link_ready = self.link_up;
        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) if !circuit.is_done() => circuit,
            _ => return,
        };
        debug!("Closing {} (reason {})", key, reason);
        let id = circuit.id;
        match id {
            Some(id) if link_ready => {
                self.push(Purpose::Fire, Command::CloseCircuit { circuit: id });
            }
            _ => circuit.close_on_launch = true,
        }
        self.on_done(key, now);
    }

    /// Close every stream and circuit of an application
    pub fn close_all(&mut self, app_id: AppId, now: Instant) {
        let (streams, circuits) = match self.apps.get(&app_id) {
            Some(app) => (
                app.streams.iter().copied().collect::<Vec<_>>(),
                app.live_circuits.iter().copied().collect::<Vec<_>>(),
            ),
            None => return,
        };
        for stream in streams {
            self.close_stream(stream, reason::DONE, now);
        }
        for key in circuits {
            self.close_circuit(key, REASON_FINISHED, now);
        }
    }

    /// Everything that has to happen exactly once when a circuit ends
    fn on_done(&mut self, key: CircuitKey, now: Instant) {
        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) => circuit,
            None => return,
        };
        if !circuit.finish(now) {
            return;
        }

        let blamed = circuit.blame();
        let app_id = circuit.app;
        let streams = circuit.take_streams();
        let link = circuit.first_hop().copied().zip(
            circuit
                .payment
                .as_ref()
                .and_then(|channel| channel.link_circuit()),
        );
        let coins = circuit
            .payment
            .as_mut()
            .map(|channel| channel.take_unsent_coins())
            .unwrap_or_default();

        for fingerprint in &blamed {
            self.directory.add_failure(fingerprint, 1.0);
        }
        if !coins.is_empty() {
            debug!("Returning {} unsent tokens from {}", coins.len(), key);
            self.wallet.restore(coins);
        }
        if let Some(app) = self.apps.get_mut(&app_id) {
            app.remove_circuit(&key);
        }
        if let Some(link) = link {
            self.link_circuits.remove(&link);
        }

        for stream_id in streams {
            let policy = match self.streams.get_mut(&stream_id) {
                Some(stream) if !stream.is_done() && stream.circuit == Some(key) => {
                    stream.detach(false);
                    stream.detach_policy
                }
                _ => continue,
            };
            match policy {
                DetachPolicy::Reattach => self.handle_stream(stream_id, now),
                DetachPolicy::Close => self.close_stream(stream_id, reason::DESTROY, now),
            }
        }
    }

    // Streams

    /// Announce that the next stream from `source_port` belongs to `app`
    pub fn register_new_stream(&mut self, app_id: AppId, source_port: u16) {
        self.expected_streams.insert(source_port, app_id);
    }

    /// Find a circuit for a stream and attach it, or close it
    fn handle_stream(&mut self, stream_id: StreamId, now: Instant) {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) if !stream.is_done() => stream,
            _ => return,
        };
        stream.handle_attempts += 1;
        if stream.handle_attempts > routing::MAX_STREAM_ATTEMPTS {
            info!("Stream {} was handled too many times, closing it", stream_id);
            self.close_stream(stream_id, reason::CONNECT_REFUSED, now);
            return;
        }

        let app_id = stream.app;
        let host = stream.target_host.clone();
        let port = stream.target_port;
        let ignore = stream.ignore_circuits.clone();

        match self.apps.get_mut(&app_id) {
            Some(app) if !app.is_paused() => app.record_port(port),
            Some(_) => {
                debug!("Closing stream {}: {} is paused", stream_id, app_id);
                self.close_stream(stream_id, reason::MISC, now);
                return;
            }
            None => {
                self.close_stream(stream_id, reason::MISC, now);
                return;
            }
        }

        let host = (!host.is_empty()).then_some(host.as_str());
        match self.find_or_build_best_circuit(app_id, host, Some(port), &ignore, false, Transport::Tcp) {
            Some(key) => {
                if !self.attach(stream_id, key, now) {
                    self.close_stream(stream_id, reason::MISC, now);
                }
            }
            None => self.close_stream(stream_id, reason::CONNECT_REFUSED, now),
        }
    }

    /// Put a stream on a circuit: attach now if it is ready, otherwise
    /// queue it until the circuit is
    fn attach(&mut self, stream_id: StreamId, key: CircuitKey, now: Instant) -> bool {
        if !self.link_up {
            return false;
        }
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) if !stream.is_done() => stream,
            _ => return false,
        };
        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) if !circuit.is_done() => circuit,
            _ => return false,
        };

        stream.circuit = Some(key);
        let ready = circuit.is_ready();
        match circuit.id {
            Some(id) if ready => {
                circuit.mark_attached(stream_id, now);
                self.push(
                    Purpose::Attach {
                        stream: stream_id,
                        circuit: key,
                    },
                    Command::AttachStream {
                        stream: stream_id,
                        circuit: id,
                    },
                );
            }
            _ => {
                if !circuit.pending_streams.contains(&stream_id) {
                    circuit.pending_streams.push(stream_id);
                }
                if circuit.is_launching() && circuit.pending_deadline.is_none() {
                    circuit.pending_deadline =
                        Some(now + Duration::from_secs(routing::PENDING_CIRCUIT_TIMEOUT_SECS));
                }
            }
        }
        true
    }

    pub fn close_stream(&mut self, stream_id: StreamId, reason: u8, now: Instant) {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) if !stream.is_done() => stream,
            _ => return,
        };
        debug!("Closing stream {} (reason {})", stream_id, reason);
        if let Some(key) = stream.detach(false) {
            if let Some(circuit) = self.circuits.get_mut(&key) {
                circuit.remove_stream(stream_id);
            }
        }
        stream.status = StreamStatus::Closed;
        stream.ended_at = Some(now);
        if self.link_up {
            self.push(
                Purpose::Fire,
                Command::CloseStream {
                    stream: stream_id,
                    reason,
                },
            );
        }
    }

    // Link lifecycle

    pub fn on_link_ready(&mut self) {
        info!("Control link ready");
        self.link_up = true;
        self.push(Purpose::NetworkStatus, Command::GetNetworkStatus);
    }

    /// The daemon is gone and took every circuit and stream with it
    pub fn on_link_closed(&mut self, now: Instant) {
        if self.link_up {
            warn!("Control link lost, dropping {} circuits", self.circuits.len());
        }
        self.link_up = false;
        self.outbox.clear();
        self.pending_descriptors.clear();

        for circuit in self.circuits.values_mut() {
            if circuit.finish(now) {
                if let Some(channel) = circuit.payment.as_mut() {
                    let coins = channel.take_unsent_coins();
                    if !coins.is_empty() {
                        self.wallet.restore(coins);
                    }
                }
            }
            circuit.pending_streams.clear();
            circuit.streams.clear();
        }
        self.circuit_ids.clear();
        self.link_circuits.clear();
        self.streams.clear();
        for app in self.apps.values_mut() {
            app.live_circuits.clear();
            app.streams.clear();
        }
    }

    // Timers

    pub fn on_tick(&mut self, now: Instant) {
        let expired: Vec<CircuitKey> = self
            .circuits
            .values()
            .filter(|circuit| circuit.pending_expired(now))
            .map(|circuit| circuit.key)
            .collect();
        for key in expired {
            info!("{} is taking too long to launch", key);
            self.close_circuit(key, REASON_TIMEOUT, now);
        }

        self.check_payment_timeouts(now);
        self.launch_for_popular_port();
        self.prune(now);
    }

    /// Keep one clean circuit open towards each application's favourite port
    fn launch_for_popular_port(&mut self) {
        if !self.is_link_ready() || !self.logged_in {
            return;
        }
        let wanted: Vec<(AppId, u16)> = self
            .apps
            .values()
            .filter(|app| !app.is_paused())
            .filter_map(|app| {
                let port = app.most_popular_port()?;
                let has_clean = app
                    .live_circuits
                    .iter()
                    .filter_map(|key| self.circuits.get(key))
                    .any(|circuit| circuit.is_open() && !circuit.is_dirty());
                (!has_clean).then_some((app.id, port))
            })
            .collect();

        for (app_id, port) in wanted {
            match self.build_circuit(app_id, None, Some(port), false, Transport::Tcp) {
                Ok(key) => debug!("Prebuilt {} for {} port {}", key, app_id, port),
                Err(err) => debug!("Could not prebuild for {} port {}: {}", app_id, port, err),
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        let stale: Vec<(CircuitKey, Option<CircuitId>)> = self
            .circuits
            .values()
            .filter(|circuit| {
                circuit
                    .ended_at
                    .map(|ended| now.saturating_duration_since(ended) >= CIRCUIT_RETENTION)
                    .unwrap_or(false)
            })
            .map(|circuit| (circuit.key, circuit.id))
            .collect();
        for (key, id) in stale {
            self.circuits.remove(&key);
            if let Some(id) = id {
                if self.circuit_ids.get(&id) == Some(&key) {
                    self.circuit_ids.remove(&id);
                }
            }
        }
    }
}
