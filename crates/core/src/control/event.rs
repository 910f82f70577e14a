use super::{ControlError, Reply};
use crate::circuit::{CircuitId, CircuitStatus, StreamId, StreamStatus};
use bitmesh_common::Fingerprint;
use data_encoding::BASE64_NOPAD;
use std::collections::HashMap;

/// Event classes that can be selected with SETEVENTS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Circ,
    Stream,
    OrConn,
    Bw,
    NewDesc,
    Ns,
    NewConsensus,
    TokenLevels,
    OrCircuit,
    StatusClient,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Circ,
        EventKind::Stream,
        EventKind::OrConn,
        EventKind::Bw,
        EventKind::NewDesc,
        EventKind::Ns,
        EventKind::NewConsensus,
        EventKind::TokenLevels,
        EventKind::OrCircuit,
        EventKind::StatusClient,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Circ => "CIRC",
            EventKind::Stream => "STREAM",
            EventKind::OrConn => "ORCONN",
            EventKind::Bw => "BW",
            EventKind::NewDesc => "NEWDESC",
            EventKind::Ns => "NS",
            EventKind::NewConsensus => "NEWCONSENSUS",
            EventKind::TokenLevels => "TOKEN_LEVELS",
            EventKind::OrCircuit => "ORCIRCUIT",
            EventKind::StatusClient => "STATUS_CLIENT",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == keyword)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    pub id: CircuitId,
    pub status: CircuitStatus,
    /// Relays extended to so far
    pub path: Vec<Fingerprint>,
    pub reason: Option<String>,
    pub remote_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub id: StreamId,
    pub status: StreamStatus,
    pub circuit: Option<CircuitId>,
    pub target_host: String,
    pub target_port: u16,
    pub reason: Option<String>,
    pub remote_reason: Option<String>,
    pub source_addr: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrConnEvent {
    pub target: String,
    pub status: String,
}

impl OrConnEvent {
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        Fingerprint::from_long_name(&self.target).ok()
    }

    pub fn is_failure(&self) -> bool {
        self.status == "FAILED"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthEvent {
    pub read: u64,
    pub written: u64,
}

/// Per-circuit token bucket levels, reported by the daemon every second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLevelsEvent {
    pub circuit: CircuitId,
    pub reads: i64,
    pub writes: i64,
    pub reads_added: i64,
    pub writes_added: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrCircuitEvent {
    /// One payment cell arrived from the relay at `hop` on `link_circuit`
    Payment {
        hop: Fingerprint,
        link_circuit: u32,
        cell: String,
    },
    Closed {
        hop: Fingerprint,
        link_circuit: u32,
    },
}

/// One router entry of a network status document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusEntry {
    pub nickname: String,
    pub fingerprint: Fingerprint,
    pub flags: Vec<String>,
    pub bandwidth: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Circuit(CircuitEvent),
    Stream(StreamEvent),
    OrConn(OrConnEvent),
    Bandwidth(BandwidthEvent),
    NewDescriptors(Vec<Fingerprint>),
    NetworkStatus(Vec<ConsensusEntry>),
    NewConsensus(Vec<ConsensusEntry>),
    TokenLevels(TokenLevelsEvent),
    OrCircuit(OrCircuitEvent),
    Bootstrap { progress: u32 },
}

impl ControlEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ControlEvent::Circuit(_) => EventKind::Circ,
            ControlEvent::Stream(_) => EventKind::Stream,
            ControlEvent::OrConn(_) => EventKind::OrConn,
            ControlEvent::Bandwidth(_) => EventKind::Bw,
            ControlEvent::NewDescriptors(_) => EventKind::NewDesc,
            ControlEvent::NetworkStatus(_) => EventKind::Ns,
            ControlEvent::NewConsensus(_) => EventKind::NewConsensus,
            ControlEvent::TokenLevels(_) => EventKind::TokenLevels,
            ControlEvent::OrCircuit(_) => EventKind::OrCircuit,
            ControlEvent::Bootstrap { .. } => EventKind::StatusClient,
        }
    }

    /// Parse an event reply. `Ok(None)` for event kinds we do not track.
    pub fn parse(reply: &Reply) -> Result<Option<Self>, ControlError> {
        let first = reply
            .lines
            .first()
            .ok_or_else(|| ControlError::Protocol("empty event".to_string()))?;
        let mut tokens = first.text.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();

        let kind = match EventKind::from_keyword(keyword) {
            Some(kind) => kind,
            None => return Ok(None),
        };

        let event = match kind {
            EventKind::Circ => ControlEvent::Circuit(parse_circuit(&args)?),
            EventKind::Stream => ControlEvent::Stream(parse_stream(&args)?),
            EventKind::OrConn => {
                let (target, status) = match args.as_slice() {
                    [target, status, ..] => (target.to_string(), status.to_string()),
                    _ => return Err(malformed("ORCONN", &first.text)),
                };
                ControlEvent::OrConn(OrConnEvent { target, status })
            }
            EventKind::Bw => {
                let (read, written) = match args.as_slice() {
                    [read, written, ..] => (parse_num(read, "BW")?, parse_num(written, "BW")?),
                    _ => return Err(malformed("BW", &first.text)),
                };
                ControlEvent::Bandwidth(BandwidthEvent { read, written })
            }
            EventKind::NewDesc => {
                let fingerprints = args
                    .iter()
                    .filter_map(|name| Fingerprint::from_long_name(name).ok())
                    .collect();
                ControlEvent::NewDescriptors(fingerprints)
            }
            EventKind::Ns => ControlEvent::NetworkStatus(parse_network_status(&first.data)),
            EventKind::NewConsensus => {
                ControlEvent::NewConsensus(parse_network_status(&first.data))
            }
            EventKind::TokenLevels => {
                let values = match args.as_slice() {
                    [circuit, reads, writes, reads_added, writes_added, ..] => TokenLevelsEvent {
                        circuit: CircuitId(parse_num(circuit, "TOKEN_LEVELS")?),
                        reads: parse_num(reads, "TOKEN_LEVELS")?,
                        writes: parse_num(writes, "TOKEN_LEVELS")?,
                        reads_added: parse_num(reads_added, "TOKEN_LEVELS")?,
                        writes_added: parse_num(writes_added, "TOKEN_LEVELS")?,
                    },
                    _ => return Err(malformed("TOKEN_LEVELS", &first.text)),
                };
                ControlEvent::TokenLevels(values)
            }
            EventKind::OrCircuit => ControlEvent::OrCircuit(parse_or_circuit(&args, &first.text)?),
            EventKind::StatusClient => {
                if !args.contains(&"BOOTSTRAP") {
                    return Ok(None);
                }
                let keywords = keyword_args(&args);
                match keywords.get("PROGRESS") {
                    Some(progress) => ControlEvent::Bootstrap {
                        progress: parse_num(progress, "STATUS_CLIENT")?,
                    },
                    None => return Ok(None),
                }
            }
        };

        Ok(Some(event))
    }
}

fn malformed(kind: &str, text: &str) -> ControlError {
    ControlError::Protocol(format!("malformed {} event: {}", kind, text))
}

fn parse_num<T: std::str::FromStr>(value: &str, kind: &str) -> Result<T, ControlError> {
    value
        .parse()
        .map_err(|_| ControlError::Protocol(format!("bad number {:?} in {} event", value, kind)))
}

fn keyword_args<'a>(args: &[&'a str]) -> HashMap<&'a str, &'a str> {
    args.iter()
        .copied()
        .filter_map(|arg| arg.split_once('='))
        .map(|(key, value)| (key, value.trim_matches('"')))
        .collect()
}

fn parse_circuit(args: &[&str]) -> Result<CircuitEvent, ControlError> {
    let (id, status) = match args {
        [id, status, ..] => (CircuitId(parse_num(id, "CIRC")?), *status),
        _ => return Err(malformed("CIRC", &args.join(" "))),
    };
    let status: CircuitStatus = status.parse()?;

    let path = match args.get(2) {
        Some(path) if !path.contains('=') => path
            .split(',')
            .filter_map(|name| Fingerprint::from_long_name(name).ok())
            .collect(),
        _ => Vec::new(),
    };

    let keywords = keyword_args(args);
    Ok(CircuitEvent {
        id,
        status,
        path,
        reason: keywords.get("REASON").map(|s| s.to_string()),
        remote_reason: keywords.get("REMOTE_REASON").map(|s| s.to_string()),
    })
}

fn parse_stream(args: &[&str]) -> Result<StreamEvent, ControlError> {
    let (id, status, circuit, target) = match args {
        [id, status, circuit, target, ..] => (*id, *status, *circuit, *target),
        _ => return Err(malformed("STREAM", &args.join(" "))),
    };

    let circuit: u32 = parse_num(circuit, "STREAM")?;
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| malformed("STREAM", target))?;

    let keywords = keyword_args(args);
    Ok(StreamEvent {
        id: StreamId(parse_num(id, "STREAM")?),
        status: status.parse()?,
        circuit: (circuit != 0).then_some(CircuitId(circuit)),
        target_host: host.to_string(),
        target_port: parse_num(port, "STREAM")?,
        reason: keywords.get("REASON").map(|s| s.to_string()),
        remote_reason: keywords.get("REMOTE_REASON").map(|s| s.to_string()),
        source_addr: keywords.get("SOURCE_ADDR").map(|s| s.to_string()),
        purpose: keywords.get("PURPOSE").map(|s| s.to_string()),
    })
}

fn parse_or_circuit(args: &[&str], text: &str) -> Result<OrCircuitEvent, ControlError> {
    match args {
        ["PAYMENT", hop, link_circuit, cell, ..] => Ok(OrCircuitEvent::Payment {
            hop: Fingerprint::from_long_name(hop).map_err(|_| malformed("ORCIRCUIT", text))?,
            link_circuit: parse_num(link_circuit, "ORCIRCUIT")?,
            cell: cell.to_string(),
        }),
        ["STATUS", hop, link_circuit, "CLOSED", ..] => Ok(OrCircuitEvent::Closed {
            hop: Fingerprint::from_long_name(hop).map_err(|_| malformed("ORCIRCUIT", text))?,
            link_circuit: parse_num(link_circuit, "ORCIRCUIT")?,
        }),
        _ => Err(malformed("ORCIRCUIT", text)),
    }
}

/// Parse `r`/`s`/`w` lines of a network status body. Entries whose identity
/// does not decode are skipped.
pub(crate) fn parse_network_status(lines: &[String]) -> Vec<ConsensusEntry> {
    let mut entries = Vec::new();
    let mut current: Option<ConsensusEntry> = None;

    for line in lines {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("r") => {
                entries.extend(current.take());
                let nickname = parts.next().unwrap_or_default().to_string();
                let identity = parts.next().unwrap_or_default().trim_end_matches('=');
                current = BASE64_NOPAD
                    .decode(identity.as_bytes())
                    .ok()
                    .and_then(|bytes| Fingerprint::from_slice(&bytes).ok())
                    .map(|fingerprint| ConsensusEntry {
                        nickname,
                        fingerprint,
                        flags: Vec::new(),
                        bandwidth: None,
                    });
            }
            Some("s") => {
                if let Some(entry) = current.as_mut() {
                    entry.flags = parts.map(str::to_string).collect();
                }
            }
            Some("w") => {
                if let Some(entry) = current.as_mut() {
                    entry.bandwidth = parts
                        .filter_map(|part| part.strip_prefix("Bandwidth="))
                        .find_map(|value| value.parse().ok());
                }
            }
            _ => {}
        }
    }

    entries.extend(current);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ReplyParser;

    fn event(lines: &[&str]) -> Option<ControlEvent> {
        let mut parser = ReplyParser::new();
        let reply = lines
            .iter()
            .find_map(|line| parser.feed(line).unwrap())
            .unwrap();
        ControlEvent::parse(&reply).unwrap()
    }

    fn hex(byte: &str) -> String {
        byte.repeat(20)
    }

    #[test]
    fn test_parse_circuit_event() {
        let line = format!(
            "650 CIRC 12 EXTENDED ${}~first,${}=second REASON=NONE",
            hex("AA"),
            hex("BB")
        );
        match event(&[&line]) {
            Some(ControlEvent::Circuit(circ)) => {
                assert_eq!(circ.id, CircuitId(12));
                assert_eq!(circ.status, CircuitStatus::Extended);
                assert_eq!(circ.path.len(), 2);
                assert_eq!(circ.reason.as_deref(), Some("NONE"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_circuit_event_without_path() {
        match event(&["650 CIRC 3 LAUNCHED"]) {
            Some(ControlEvent::Circuit(circ)) => {
                assert_eq!(circ.status, CircuitStatus::Launched);
                assert!(circ.path.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_stream_event() {
        let line = format!(
            "650 STREAM 44 NEW 0 example.com.{}.exit:443 SOURCE_ADDR=127.0.0.1:5555 PURPOSE=USER",
            hex("CC")
        );
        match event(&[&line]) {
            Some(ControlEvent::Stream(stream)) => {
                assert_eq!(stream.id, StreamId(44));
                assert_eq!(stream.status, StreamStatus::New);
                assert_eq!(stream.circuit, None);
                assert_eq!(stream.target_port, 443);
                assert_eq!(stream.source_addr.as_deref(), Some("127.0.0.1:5555"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_token_levels_and_bootstrap() {
        assert_eq!(
            event(&["650 TOKEN_LEVELS 5 100 -3 10 0"]),
            Some(ControlEvent::TokenLevels(TokenLevelsEvent {
                circuit: CircuitId(5),
                reads: 100,
                writes: -3,
                reads_added: 10,
                writes_added: 0,
            }))
        );
        assert_eq!(
            event(&["650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=85 TAG=loading"]),
            Some(ControlEvent::Bootstrap { progress: 85 })
        );
        assert_eq!(event(&["650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED"]), None);
    }

    #[test]
    fn test_parse_or_circuit() {
        let line = format!("650 ORCIRCUIT PAYMENT {} 77 QUJDRA", hex("0A"));
        match event(&[&line]) {
            Some(ControlEvent::OrCircuit(OrCircuitEvent::Payment { link_circuit, cell, .. })) => {
                assert_eq!(link_circuit, 77);
                assert_eq!(cell, "QUJDRA");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_consensus_block() {
        let identity = BASE64_NOPAD.encode(&[0x11; 20]);
        let r_line = format!("r relay1 {} digest 2024-01-01 00:00:00 10.0.0.1 9001 0", identity);
        let parsed = event(&[
            "650+NEWCONSENSUS",
            &r_line,
            "s Exit Fast Running Valid",
            "w Bandwidth=512",
            "r broken !!notbase64",
            ".",
            "650 OK",
        ]);
        match parsed {
            Some(ControlEvent::NewConsensus(entries)) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].nickname, "relay1");
                assert_eq!(entries[0].fingerprint, Fingerprint::from([0x11; 20]));
                assert!(entries[0].flags.contains(&"Running".to_string()));
                assert_eq!(entries[0].bandwidth, Some(512));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        assert_eq!(event(&["650 ADDRMAP foo bar"]), None);
    }
}
