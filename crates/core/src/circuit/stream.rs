use super::pool::AppId;
use super::types::CircuitKey;
use crate::control::{ControlError, StreamEvent};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Instant;

/// Stream id assigned by the routing daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Detached,
    Failed,
    Closed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::New => "NEW",
            StreamStatus::NewResolve => "NEWRESOLVE",
            StreamStatus::Remap => "REMAP",
            StreamStatus::SentConnect => "SENTCONNECT",
            StreamStatus::SentResolve => "SENTRESOLVE",
            StreamStatus::Succeeded => "SUCCEEDED",
            StreamStatus::Detached => "DETACHED",
            StreamStatus::Failed => "FAILED",
            StreamStatus::Closed => "CLOSED",
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, StreamStatus::New | StreamStatus::NewResolve)
    }
}

impl FromStr for StreamStatus {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => StreamStatus::New,
            "NEWRESOLVE" => StreamStatus::NewResolve,
            "REMAP" => StreamStatus::Remap,
            "SENTCONNECT" => StreamStatus::SentConnect,
            "SENTRESOLVE" => StreamStatus::SentResolve,
            "SUCCEEDED" => StreamStatus::Succeeded,
            "DETACHED" => StreamStatus::Detached,
            "FAILED" => StreamStatus::Failed,
            "CLOSED" => StreamStatus::Closed,
            other => {
                return Err(ControlError::Protocol(format!("unknown stream status {}", other)))
            }
        })
    }
}

/// What happens to a stream whose circuit goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachPolicy {
    /// Hand it back to its application to find another circuit
    #[default]
    Reattach,
    Close,
}

/// Stream close reasons sent with CLOSESTREAM
pub mod reason {
    pub const MISC: u8 = 1;
    pub const CONNECT_REFUSED: u8 = 3;
    pub const DESTROY: u8 = 5;
    pub const DONE: u8 = 6;
}

/// Source address the daemon gives streams it opens for itself
const INTERNAL_SOURCE_PREFIX: char = '(';

/// Length of the `.<40 hex>.exit` suffix
const EXIT_SUFFIX_LEN: usize = 46;

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub app: AppId,
    pub status: StreamStatus,
    pub target_host: String,
    pub target_port: u16,
    pub source_addr: Option<String>,
    pub purpose: Option<String>,

    /// Opened by the daemon itself. Never handled by us.
    pub is_internal: bool,

    pub circuit: Option<CircuitKey>,

    /// Circuits this stream was detached from or refused by
    pub ignore_circuits: HashSet<CircuitKey>,

    pub handle_attempts: u32,

    pub detach_policy: DetachPolicy,

    pub created_at: Instant,
    pub ended_at: Option<Instant>,
}

impl Stream {
    pub fn from_event(event: &StreamEvent, app: AppId, detach_policy: DetachPolicy) -> Self {
        let is_internal = event
            .source_addr
            .as_deref()
            .map(|addr| addr.starts_with(INTERNAL_SOURCE_PREFIX))
            .unwrap_or(false);
        Self {
            id: event.id,
            app,
            status: event.status,
            target_host: strip_exit_notation(&event.target_host).to_string(),
            target_port: event.target_port,
            source_addr: event.source_addr.clone(),
            purpose: event.purpose.clone(),
            is_internal,
            circuit: None,
            ignore_circuits: HashSet::new(),
            handle_attempts: 0,
            detach_policy,
            created_at: Instant::now(),
            ended_at: None,
        }
    }

    /// Refresh status and target from an event
    pub fn update(&mut self, event: &StreamEvent) {
        self.status = event.status;
        self.target_host = strip_exit_notation(&event.target_host).to_string();
        self.target_port = event.target_port;
        if self.is_done() && self.ended_at.is_none() {
            self.ended_at = Some(Instant::now());
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, StreamStatus::Closed | StreamStatus::Failed)
    }

    /// The one way a stream leaves its circuit. Returns the circuit it was on.
    pub fn detach(&mut self, ignore: bool) -> Option<CircuitKey> {
        let circuit = self.circuit.take()?;
        if ignore {
            self.ignore_circuits.insert(circuit);
        }
        Some(circuit)
    }

    pub fn ignores(&self, circuit: &CircuitKey) -> bool {
        self.ignore_circuits.contains(circuit)
    }

    /// Source port of the client connection, used to match registered streams
    pub fn source_port(&self) -> Option<u16> {
        self.source_addr
            .as_deref()
            .and_then(|addr| addr.rsplit_once(':'))
            .and_then(|(_, port)| port.parse().ok())
    }
}

/// `host.<fingerprint>.exit` names the exit explicitly; keep only the host
pub fn strip_exit_notation(host: &str) -> &str {
    let cut = host.len().saturating_sub(EXIT_SUFFIX_LEN);
    if cut == 0 || !host.ends_with(".exit") || !host.is_char_boundary(cut) {
        return host;
    }
    let (name, suffix) = host.split_at(cut);
    if suffix.starts_with('.') && suffix[1..41].bytes().all(|b| b.is_ascii_hexdigit()) {
        name
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: StreamStatus, host: &str, source: Option<&str>) -> StreamEvent {
        StreamEvent {
            id: StreamId(3),
            status,
            circuit: None,
            target_host: host.to_string(),
            target_port: 80,
            reason: None,
            remote_reason: None,
            source_addr: source.map(str::to_string),
            purpose: None,
        }
    }

    #[test]
    fn test_strip_exit_notation() {
        let fp = "AB".repeat(20);
        assert_eq!(strip_exit_notation(&format!("example.com.{}.exit", fp)), "example.com");
        assert_eq!(strip_exit_notation("example.com"), "example.com");
        let not_hex = format!("example.com.{}.exit", "ZZ".repeat(20));
        assert_eq!(strip_exit_notation(&not_hex), not_hex);
    }

    #[test]
    fn test_internal_streams() {
        let internal = Stream::from_event(
            &event(StreamStatus::New, "10.0.0.1", Some("(Tor_internal):0")),
            AppId(0),
            DetachPolicy::Close,
        );
        assert!(internal.is_internal);

        let user = Stream::from_event(
            &event(StreamStatus::New, "10.0.0.1", Some("127.0.0.1:4000")),
            AppId(0),
            DetachPolicy::Reattach,
        );
        assert!(!user.is_internal);
        assert_eq!(user.source_port(), Some(4000));
    }

    #[test]
    fn test_detach_adds_to_ignore_set() {
        let mut stream = Stream::from_event(&event(StreamStatus::New, "h", None), AppId(1), DetachPolicy::Reattach);
        stream.circuit = Some(CircuitKey(8));
        assert_eq!(stream.detach(true), Some(CircuitKey(8)));
        assert!(stream.ignores(&CircuitKey(8)));
        assert_eq!(stream.detach(true), None);

        stream.circuit = Some(CircuitKey(9));
        stream.detach(false);
        assert!(!stream.ignores(&CircuitKey(9)));
    }

    #[test]
    fn test_done_statuses() {
        let mut stream = Stream::from_event(&event(StreamStatus::New, "h", None), AppId(1), DetachPolicy::Reattach);
        assert!(!stream.is_done());
        stream.update(&event(StreamStatus::Succeeded, "h", None));
        assert!(!stream.is_done());
        stream.update(&event(StreamStatus::Closed, "h", None));
        assert!(stream.is_done());
        assert!(stream.ended_at.is_some());
        assert!("BOGUS".parse::<StreamStatus>().is_err());
    }
}
