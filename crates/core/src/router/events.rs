use super::{Purpose, Router, DEFAULT_APP};
use crate::circuit::{reason, Circuit, CircuitKey, CircuitStatus, DetachPolicy, Stream, StreamStatus};
use crate::control::{
    BandwidthEvent, CircuitEvent, Command, ConsensusEntry, ControlEvent, OrConnEvent, Reply,
    StreamEvent,
};
use bitmesh_common::{control, Fingerprint};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

impl Router {
    /// Parse an asynchronous event and hand it to its handler
    pub fn on_event(&mut self, reply: &Reply, now: Instant, unix_now: u64) {
        let event = match ControlEvent::parse(reply) {
            Ok(Some(event)) => event,
            Ok(None) => {
                trace!("Ignoring event {}", reply.text());
                return;
            }
            Err(err) => {
                warn!("Dropping unparseable event {:?}: {}", reply.text(), err);
                return;
            }
        };
        self.dispatch(event, now, unix_now);
    }

    pub fn dispatch(&mut self, event: ControlEvent, now: Instant, unix_now: u64) {
        let kind = event.kind();
        match self.dispatcher.handler(kind) {
            Some(handler) => handler(self, event, now, unix_now),
            None => trace!("No handler for {} events", kind.as_str()),
        }
    }

    pub fn on_circuit_event(&mut self, event: CircuitEvent, now: Instant) {
        let key = match self.circuit_ids.get(&event.id) {
            Some(key) => *key,
            None => {
                self.observe_circuit(event);
                return;
            }
        };
        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) if !circuit.is_done() => circuit,
            _ => return,
        };

        circuit.current_path = event.path.clone();
        match event.status {
            CircuitStatus::Launched | CircuitStatus::Extended => circuit.status = event.status,
            CircuitStatus::Built => self.on_circuit_built(key, event.path, now),
            CircuitStatus::Failed | CircuitStatus::Closed => {
                debug!(
                    "{} {} ({})",
                    key,
                    event.status,
                    event.reason.as_deref().unwrap_or("no reason")
                );
                circuit.status = event.status;
                self.on_done(key, now);
            }
            CircuitStatus::Prelaunch | CircuitStatus::ParSetup => {}
        }
    }

    /// Circuits launched by the daemon itself or by another controller
    fn observe_circuit(&mut self, event: CircuitEvent) {
        if event.status.is_terminal() {
            return;
        }
        let key = self.allocate_key();
        trace!("Observing circuit {} as {}", event.id, key);
        self.circuits.insert(
            key,
            Circuit::observed(key, DEFAULT_APP, event.id, event.status, event.path),
        );
        self.circuit_ids.insert(event.id, key);
    }

    pub(super) fn on_circuit_built(&mut self, key: CircuitKey, path: Vec<Fingerprint>, now: Instant) {
        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) => circuit,
            None => return,
        };
        if circuit.final_path.is_empty() {
            circuit.final_path = path;
        }
        if !circuit.built_by_us {
            circuit.status = CircuitStatus::Built;
            circuit.succeeded = true;
            return;
        }

        let id = circuit.id;
        match id {
            Some(id) if circuit.payment.is_some() => {
                debug!("{} built, setting up payments", key);
                circuit.status = CircuitStatus::ParSetup;
                self.push(Purpose::Convert(key), Command::ConvertCircuitId { circuit: id });
            }
            _ => {
                circuit.status = CircuitStatus::Built;
                self.on_par_ready(key, now);
            }
        }
    }

    /// The circuit can carry streams: attach everything that was waiting
    pub(super) fn on_par_ready(&mut self, key: CircuitKey, now: Instant) {
        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) if !circuit.is_done() => circuit,
            _ => return,
        };
        circuit.status = CircuitStatus::Built;
        circuit.succeeded = true;
        circuit.pending_deadline = None;
        let pending = std::mem::take(&mut circuit.pending_streams);
        info!(
            "{} ready via {}",
            key,
            circuit
                .final_path
                .iter()
                .map(|fp| fp.to_hex())
                .collect::<Vec<_>>()
                .join(",")
        );

        for stream in pending {
            if !self.attach(stream, key, now) {
                self.close_stream(stream, reason::MISC, now);
            }
        }
    }

    pub fn on_stream_event(&mut self, event: StreamEvent, now: Instant) {
        if !self.streams.contains_key(&event.id) {
            if event.status.is_new() {
                self.on_new_stream(event, now);
            } else {
                trace!("Event for unknown stream {}", event.id);
            }
            return;
        }

        let attached_to = event
            .circuit
            .and_then(|id| self.circuit_ids.get(&id).copied());
        let stream = match self.streams.get_mut(&event.id) {
            Some(stream) => stream,
            None => return,
        };
        stream.update(&event);
        let stream_id = stream.id;

        match event.status {
            StreamStatus::SentConnect
            | StreamStatus::SentResolve
            | StreamStatus::Succeeded
            | StreamStatus::Remap => {
                if let Some(key) = attached_to {
                    if let Some(previous) = stream.circuit.filter(|previous| *previous != key) {
                        if let Some(circuit) = self.circuits.get_mut(&previous) {
                            circuit.remove_stream(stream_id);
                        }
                    }
                    stream.circuit = Some(key);
                    if let Some(circuit) = self.circuits.get_mut(&key) {
                        circuit.mark_attached(stream_id, now);
                    }
                }
            }
            StreamStatus::Detached => {
                if let Some(old) = attached_to.filter(|old| stream.circuit != Some(*old)) {
                    // Already moved on when that circuit closed
                    stream.ignore_circuits.insert(old);
                    return;
                }
                let policy = stream.detach_policy;
                if let Some(key) = stream.detach(true) {
                    if let Some(circuit) = self.circuits.get_mut(&key) {
                        circuit.remove_stream(stream_id);
                    }
                }
                debug!("Stream {} detached", stream_id);
                match policy {
                    DetachPolicy::Reattach => self.handle_stream(stream_id, now),
                    DetachPolicy::Close => self.close_stream(stream_id, reason::DESTROY, now),
                }
            }
            StreamStatus::Failed => {
                if let Some(key) = stream.detach(false) {
                    if let Some(circuit) = self.circuits.get_mut(&key) {
                        circuit.remove_stream(stream_id);
                    }
                }
            }
            StreamStatus::Closed => {
                let app_id = stream.app;
                if let Some(key) = stream.detach(false) {
                    if let Some(circuit) = self.circuits.get_mut(&key) {
                        circuit.remove_stream(stream_id);
                    }
                }
                self.streams.remove(&stream_id);
                if let Some(app) = self.apps.get_mut(&app_id) {
                    app.streams.remove(&stream_id);
                }
            }
            StreamStatus::New | StreamStatus::NewResolve => {}
        }
    }

    /// A client opened a stream: find it a circuit
    pub fn on_new_stream(&mut self, event: StreamEvent, now: Instant) {
        let source_port = event
            .source_addr
            .as_deref()
            .and_then(|addr| addr.rsplit_once(':'))
            .and_then(|(_, port)| port.parse::<u16>().ok());
        let app_id = source_port
            .and_then(|port| self.expected_streams.remove(&port))
            .filter(|app| self.apps.contains_key(app))
            .unwrap_or(DEFAULT_APP);
        let policy = self
            .apps
            .get(&app_id)
            .map(|app| app.config.detach_policy)
            .unwrap_or_default();

        let stream = Stream::from_event(&event, app_id, policy);
        if stream.is_internal {
            trace!("Leaving internal stream {} to the daemon", stream.id);
            return;
        }

        debug!(
            "New stream {} to {}:{} for {}",
            stream.id, stream.target_host, stream.target_port, app_id
        );
        let stream_id = stream.id;
        self.streams.insert(stream_id, stream);
        if let Some(app) = self.apps.get_mut(&app_id) {
            app.streams.insert(stream_id);
        }
        self.handle_stream(stream_id, now);
    }

    pub fn on_or_conn(&mut self, event: OrConnEvent) {
        if !event.is_failure() {
            return;
        }
        if let Some(fingerprint) = event.fingerprint() {
            self.directory.on_connection_failed(&fingerprint);
        }
    }

    pub fn on_bandwidth(&mut self, event: BandwidthEvent) {
        self.bytes_read = self.bytes_read.saturating_add(event.read);
        self.bytes_written = self.bytes_written.saturating_add(event.written);
    }

    pub fn on_new_descriptors(&mut self, fingerprints: Vec<Fingerprint>) {
        self.fetch_descriptors(fingerprints);
    }

    pub fn on_network_status(&mut self, entries: Vec<ConsensusEntry>) {
        let missing = self.directory.apply_network_status(&entries);
        self.fetch_descriptors(missing);
    }

    pub fn on_new_consensus(&mut self, entries: Vec<ConsensusEntry>) {
        let missing = self.directory.apply_consensus(&entries);
        self.fetch_descriptors(missing);
    }

    pub fn on_bootstrap(&mut self, progress: u32) {
        let ready = progress >= control::READY_BOOTSTRAP_PROGRESS;
        if ready && !self.bootstrapped {
            info!("Routing daemon bootstrapped ({}%)", progress);
        }
        self.bootstrap_progress = progress;
        self.bootstrapped = ready;
    }

    pub fn bootstrap_progress(&self) -> u32 {
        self.bootstrap_progress
    }

    fn fetch_descriptors(&mut self, fingerprints: Vec<Fingerprint>) {
        if !self.link_up {
            return;
        }
        for fingerprint in fingerprints {
            if self.pending_descriptors.insert(fingerprint) {
                self.push(
                    Purpose::Descriptor(fingerprint),
                    Command::GetDescriptor { fingerprint },
                );
            }
        }
    }
}
