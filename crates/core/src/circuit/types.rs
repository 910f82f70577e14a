use super::pool::AppId;
use super::stream::{Stream, StreamId, StreamStatus};
use crate::control::ControlError;
use crate::directory::{RelayDirectory, Transport};
use crate::payment::{PaymentCapable, PaymentChannel};
use bitmesh_common::Fingerprint;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

/// Local handle of a circuit, valid before the daemon assigns an id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitKey(pub u64);

impl std::fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circ#{}", self.0)
    }
}

/// Circuit id assigned by the routing daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitId(pub u32);

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Circuit status as reported in CIRC events, plus the local states
/// `Prelaunch` (before the daemon knows the circuit) and `ParSetup`
/// (built, payment handshake running)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitStatus {
    Prelaunch,
    Launched,
    Extended,
    Built,
    ParSetup,
    Failed,
    Closed,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Prelaunch => "PRELAUNCH",
            CircuitStatus::Launched => "LAUNCHED",
            CircuitStatus::Extended => "EXTENDED",
            CircuitStatus::Built => "BUILT",
            CircuitStatus::ParSetup => "PAR_SETUP",
            CircuitStatus::Failed => "FAILED",
            CircuitStatus::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CircuitStatus::Failed | CircuitStatus::Closed)
    }

    pub fn is_launching(&self) -> bool {
        matches!(
            self,
            CircuitStatus::Prelaunch
                | CircuitStatus::Launched
                | CircuitStatus::Extended
                | CircuitStatus::ParSetup
        )
    }
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitStatus {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRELAUNCH" => Ok(CircuitStatus::Prelaunch),
            "LAUNCHED" => Ok(CircuitStatus::Launched),
            "EXTENDED" => Ok(CircuitStatus::Extended),
            "BUILT" => Ok(CircuitStatus::Built),
            "FAILED" => Ok(CircuitStatus::Failed),
            "CLOSED" => Ok(CircuitStatus::Closed),
            other => Err(ControlError::Protocol(format!("unknown circuit status {}", other))),
        }
    }
}

/// A circuit and the streams riding it
#[derive(Debug)]
pub struct Circuit {
    pub key: CircuitKey,

    /// Daemon id, unknown until the EXTENDCIRCUIT reply
    pub id: Option<CircuitId>,

    pub app: AppId,

    /// Relays the circuit is meant to reach, entry first
    pub final_path: Vec<Fingerprint>,

    /// Relays extended to so far
    pub current_path: Vec<Fingerprint>,

    pub status: CircuitStatus,

    /// False for circuits the daemon (or another controller) built
    pub built_by_us: bool,

    /// Whether this circuit reached BUILT and finished payment setup
    pub succeeded: bool,

    pub done: bool,

    /// Close was requested before the daemon id was known
    pub close_on_launch: bool,

    /// Streams waiting for the circuit to become ready, in arrival order
    pub pending_streams: Vec<StreamId>,

    pub streams: Vec<StreamId>,

    pub created_at: Instant,

    /// When the first stream was attached
    pub dirtied_at: Option<Instant>,

    pub ended_at: Option<Instant>,

    /// Launching circuits holding streams are abandoned after this
    pub pending_deadline: Option<Instant>,

    pub payment: Option<PaymentChannel>,
}

impl Circuit {
    /// A circuit we are about to launch over `path`
    pub fn launch(key: CircuitKey, app: AppId, path: Vec<Fingerprint>, pays: bool) -> Self {
        let payment = pays.then(|| PaymentChannel::new(path.clone()));
        Self {
            key,
            id: None,
            app,
            final_path: path,
            current_path: Vec::new(),
            status: CircuitStatus::Prelaunch,
            built_by_us: true,
            succeeded: false,
            done: false,
            close_on_launch: false,
            pending_streams: Vec::new(),
            streams: Vec::new(),
            created_at: Instant::now(),
            dirtied_at: None,
            ended_at: None,
            pending_deadline: None,
            payment,
        }
    }

    /// A circuit first seen in an event. It never carries our streams.
    pub fn observed(key: CircuitKey, app: AppId, id: CircuitId, status: CircuitStatus, path: Vec<Fingerprint>) -> Self {
        let now = Instant::now();
        let terminal = status.is_terminal();
        let final_path = if terminal || status == CircuitStatus::Built {
            path.clone()
        } else {
            Vec::new()
        };
        Self {
            key,
            id: Some(id),
            app,
            final_path,
            current_path: path,
            status,
            built_by_us: false,
            succeeded: status == CircuitStatus::Built,
            done: terminal,
            close_on_launch: false,
            pending_streams: Vec::new(),
            streams: Vec::new(),
            created_at: now,
            dirtied_at: None,
            ended_at: terminal.then_some(now),
            pending_deadline: None,
            payment: None,
        }
    }

    pub fn is_launching(&self) -> bool {
        !self.done && self.status.is_launching()
    }

    pub fn is_ready(&self) -> bool {
        !self.done && self.status == CircuitStatus::Built && self.succeeded
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_open(&self) -> bool {
        self.is_ready() || self.is_launching()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirtied_at.is_some()
    }

    pub fn exit(&self) -> Option<&Fingerprint> {
        self.final_path.last()
    }

    pub fn first_hop(&self) -> Option<&Fingerprint> {
        self.final_path.first()
    }

    pub fn will_accept_connection(
        &self,
        directory: &RelayDirectory,
        host: Option<&str>,
        port: Option<u16>,
        transport: Transport,
    ) -> bool {
        if !self.built_by_us {
            return false;
        }
        self.exit()
            .and_then(|exit| directory.get(exit))
            .map(|relay| relay.will_exit_to(host, port, transport))
            .unwrap_or(false)
    }

    /// Streams pending plus attached streams still carrying traffic
    pub fn num_active_streams(&self, streams: &HashMap<StreamId, Stream>) -> usize {
        let attached = self
            .streams
            .iter()
            .filter_map(|id| streams.get(id))
            .filter(|stream| {
                !matches!(
                    stream.status,
                    StreamStatus::Closed | StreamStatus::Failed | StreamStatus::Detached
                )
            })
            .count();
        self.pending_streams.len() + attached
    }

    /// Relays to blame for a circuit that ended. Only circuits we built are
    /// judged: the hop we failed to extend to, or every hop if the circuit
    /// was complete but never became usable.
    pub fn blame(&self) -> Vec<Fingerprint> {
        if !self.built_by_us {
            return Vec::new();
        }
        if self.current_path.len() < self.final_path.len() {
            return vec![self.final_path[self.current_path.len()]];
        }
        if !self.succeeded {
            return self.final_path.clone();
        }
        Vec::new()
    }

    /// Mark the circuit ended. Returns false if it already was.
    pub fn finish(&mut self, now: Instant) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        if !self.status.is_terminal() {
            self.status = CircuitStatus::Closed;
        }
        self.ended_at = Some(now);
        self.pending_deadline = None;
        true
    }

    /// Every stream on the circuit, pending first, leaving it empty
    pub fn take_streams(&mut self) -> Vec<StreamId> {
        let mut all = std::mem::take(&mut self.pending_streams);
        all.append(&mut self.streams);
        all
    }

    /// Forget a stream without touching its state
    pub fn remove_stream(&mut self, stream: StreamId) {
        self.pending_streams.retain(|id| *id != stream);
        self.streams.retain(|id| *id != stream);
    }

    /// Move a pending stream to the attached set
    pub fn mark_attached(&mut self, stream: StreamId, now: Instant) {
        self.pending_streams.retain(|id| *id != stream);
        if !self.streams.contains(&stream) {
            self.streams.push(stream);
        }
        self.dirtied_at.get_or_insert(now);
    }

    /// Whether the pending-stream deadline has passed while still launching
    pub fn pending_expired(&self, now: Instant) -> bool {
        matches!(self.status, CircuitStatus::Prelaunch | CircuitStatus::Launched)
            && !self.done
            && self.pending_deadline.map(|deadline| now >= deadline).unwrap_or(false)
    }
}

impl PaymentCapable for Circuit {
    fn pays(&self) -> bool {
        self.built_by_us && self.payment.is_some()
    }

    fn payment_channel(&self) -> Option<&PaymentChannel> {
        self.payment.as_ref()
    }

    fn payment_channel_mut(&mut self) -> Option<&mut PaymentChannel> {
        self.payment.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from([byte; 20])
    }

    fn circuit() -> Circuit {
        Circuit::launch(CircuitKey(1), AppId(1), vec![fp(1), fp(2), fp(3)], false)
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("BUILT".parse::<CircuitStatus>().unwrap(), CircuitStatus::Built);
        assert!("SIDEWAYS".parse::<CircuitStatus>().is_err());
        assert!(CircuitStatus::ParSetup.is_launching());
        assert!(!CircuitStatus::Built.is_launching());
        assert_eq!(CircuitId(17).to_string(), "17");
    }

    #[test]
    fn test_blame_partial_extend() {
        let mut circ = circuit();
        circ.current_path = vec![fp(1)];
        assert_eq!(circ.blame(), vec![fp(2)]);
    }

    #[test]
    fn test_blame_unfinished_payment() {
        let mut circ = circuit();
        circ.current_path = circ.final_path.clone();
        assert_eq!(circ.blame().len(), 3);

        circ.succeeded = true;
        assert!(circ.blame().is_empty());
    }

    #[test]
    fn test_observed_circuits_are_never_blamed() {
        let circ = Circuit::observed(CircuitKey(2), AppId(0), CircuitId(5), CircuitStatus::Launched, vec![]);
        assert!(circ.blame().is_empty());
        assert!(!circ.pays());
        assert!(circ.final_path.is_empty());

        let closed = Circuit::observed(CircuitKey(3), AppId(0), CircuitId(6), CircuitStatus::Closed, vec![fp(4)]);
        assert!(closed.is_done());
        assert_eq!(closed.final_path, vec![fp(4)]);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut circ = circuit();
        let now = Instant::now();
        assert!(circ.finish(now));
        assert_eq!(circ.status, CircuitStatus::Closed);
        assert!(!circ.finish(now + Duration::from_secs(1)));
        assert_eq!(circ.ended_at, Some(now));

        let mut failed = circuit();
        failed.status = CircuitStatus::Failed;
        failed.finish(now);
        assert_eq!(failed.status, CircuitStatus::Failed);
    }

    #[test]
    fn test_stream_bookkeeping() {
        let mut circ = circuit();
        circ.pending_streams = vec![StreamId(1), StreamId(2)];
        let now = Instant::now();
        circ.mark_attached(StreamId(1), now);
        assert_eq!(circ.pending_streams, vec![StreamId(2)]);
        assert_eq!(circ.streams, vec![StreamId(1)]);
        assert_eq!(circ.dirtied_at, Some(now));

        assert_eq!(circ.take_streams(), vec![StreamId(2), StreamId(1)]);
        assert!(circ.pending_streams.is_empty() && circ.streams.is_empty());
    }

    #[test]
    fn test_pending_deadline() {
        let mut circ = circuit();
        let now = Instant::now();
        circ.pending_deadline = Some(now + Duration::from_secs(15));
        assert!(!circ.pending_expired(now));
        assert!(circ.pending_expired(now + Duration::from_secs(16)));

        circ.status = CircuitStatus::Extended;
        assert!(!circ.pending_expired(now + Duration::from_secs(16)));
    }
}
