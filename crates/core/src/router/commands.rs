use super::{Purpose, Router};
use crate::circuit::{CircuitId, CircuitKey, CircuitStatus, StreamId};
use crate::control::{parse_network_status, Command, ControlError, Reply};
use std::time::Instant;
use tracing::{debug, warn};

impl Router {
    /// Route the reply to a command taken from the outbox
    pub fn on_command_result(
        &mut self,
        purpose: Purpose,
        result: Result<Reply, ControlError>,
        now: Instant,
        unix_now: u64,
    ) {
        match purpose {
            Purpose::Extend(key) => self.on_extended(key, result, now),
            Purpose::Attach { stream, circuit } => {
                if let Err(err) = result {
                    self.on_attach_refused(stream, circuit, err, now);
                }
            }
            Purpose::Convert(key) => self.on_link_circuit(key, result, now),
            Purpose::AddStartTokens(key) => self.on_start_tokens_reply(key, result, now, unix_now),
            Purpose::AddTokens {
                circuit,
                read,
                write,
            } => self.on_tokens_reply(circuit, read, write, result, now, unix_now),
            Purpose::SendPayment(key) => {
                if let Err(err) = result {
                    warn!("Payment cell on {} was refused: {}", key, err);
                }
            }
            Purpose::Descriptor(fingerprint) => {
                self.pending_descriptors.remove(&fingerprint);
                match result {
                    Ok(reply) => {
                        self.directory.apply_descriptor(&fingerprint, &data_lines(&reply));
                    }
                    Err(err) => debug!("No descriptor for {}: {}", fingerprint, err),
                }
            }
            Purpose::NetworkStatus => match result {
                Ok(reply) => {
                    let entries = parse_network_status(&data_lines(&reply));
                    let missing = self.directory.apply_consensus(&entries);
                    self.on_new_descriptors(missing);
                }
                Err(err) => warn!("Failed to fetch network status: {}", err),
            },
            Purpose::Fire => {
                if let Err(err) = result {
                    debug!("Command failed: {}", err);
                }
            }
        }
    }

    fn on_extended(&mut self, key: CircuitKey, result: Result<Reply, ControlError>, now: Instant) {
        let id = match result.and_then(|reply| parse_extended(&reply)) {
            Ok(id) => id,
            Err(err) => {
                warn!("Failed to launch {}: {}", key, err);
                if let Some(circuit) = self.circuits.get_mut(&key) {
                    if !circuit.is_done() {
                        circuit.status = CircuitStatus::Failed;
                    }
                }
                self.on_done(key, now);
                return;
            }
        };

        // Events for the new id may have arrived before this reply
        let early = self
            .circuit_ids
            .insert(id, key)
            .filter(|other| *other != key)
            .and_then(|other| self.circuits.remove(&other));

        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) => circuit,
            None => {
                self.circuit_ids.remove(&id);
                self.push(Purpose::Fire, Command::CloseCircuit { circuit: id });
                return;
            }
        };
        circuit.id = Some(id);
        if circuit.is_done() || circuit.close_on_launch {
            debug!("Closing {} now that it is known as {}", key, id);
            self.push(Purpose::Fire, Command::CloseCircuit { circuit: id });
            return;
        }
        debug!("{} launched as circuit {}", key, id);

        if let Some(early) = early {
            circuit.current_path = early.current_path.clone();
            match early.status {
                CircuitStatus::Built => self.on_circuit_built(key, early.current_path, now),
                status if status.is_terminal() => {
                    circuit.status = status;
                    self.on_done(key, now);
                }
                status => circuit.status = status,
            }
        }
    }

    fn on_attach_refused(
        &mut self,
        stream_id: StreamId,
        key: CircuitKey,
        err: ControlError,
        now: Instant,
    ) {
        debug!("Stream {} refused by {}: {}", stream_id, key, err);
        if let Some(circuit) = self.circuits.get_mut(&key) {
            circuit.remove_stream(stream_id);
        }
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };
        if stream.circuit == Some(key) {
            stream.detach(true);
        } else {
            stream.ignore_circuits.insert(key);
            return;
        }
        if !err.is_fatal() {
            self.handle_stream(stream_id, now);
        }
    }
}

/// `EXTENDED <id>`
fn parse_extended(reply: &Reply) -> Result<CircuitId, ControlError> {
    reply
        .text()
        .split_whitespace()
        .last()
        .and_then(|id| id.parse().ok())
        .map(CircuitId)
        .ok_or_else(|| ControlError::Protocol(format!("bad EXTENDCIRCUIT reply {:?}", reply.text())))
}

/// Body of every data block in a reply
pub(super) fn data_lines(reply: &Reply) -> Vec<String> {
    reply
        .lines
        .iter()
        .flat_map(|line| line.data.iter().cloned())
        .collect()
}
