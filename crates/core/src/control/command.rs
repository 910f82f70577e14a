use super::EventKind;
use crate::circuit::{CircuitId, StreamId};
use bitmesh_common::Fingerprint;

/// Requests understood by the routing daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Authenticate { secret: String },

    SetEvents(Vec<EventKind>),

    /// Launch a new circuit over `path`. Replies `250 EXTENDED <id>`.
    ExtendCircuit { path: Vec<Fingerprint> },

    AttachStream { stream: StreamId, circuit: CircuitId },

    CloseCircuit { circuit: CircuitId },

    CloseStream { stream: StreamId, reason: u8 },

    /// Add (or with zeroes, query) tokens in the daemon's buckets for a
    /// circuit. Replies `250 <read> <write>`.
    AddTokens {
        first_hop: Fingerprint,
        link_circuit: u32,
        read: u64,
        write: u64,
    },

    /// Relay one payment cell `hops` hops down a circuit
    SendPayment {
        first_hop: Fingerprint,
        link_circuit: u32,
        cell: String,
        hops: u8,
    },

    /// Translate a circuit id into the id used on the link to the first hop
    ConvertCircuitId { circuit: CircuitId },

    GetDescriptor { fingerprint: Fingerprint },

    GetNetworkStatus,
}

impl Command {
    /// Wire form without the trailing CRLF
    pub fn to_line(&self) -> String {
        match self {
            Command::Authenticate { secret } => {
                format!("AUTHENTICATE \"{}\"", secret.replace('\\', "\\\\").replace('"', "\\\""))
            }
            Command::SetEvents(kinds) => {
                let names: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
                if names.is_empty() {
                    "SETEVENTS".to_string()
                } else {
                    format!("SETEVENTS {}", names.join(" "))
                }
            }
            Command::ExtendCircuit { path } => {
                let hops: Vec<String> = path.iter().map(|fp| fp.to_hex()).collect();
                format!("EXTENDCIRCUIT 0 {}", hops.join(","))
            }
            Command::AttachStream { stream, circuit } => {
                format!("ATTACHSTREAM {} {}", stream, circuit)
            }
            Command::CloseCircuit { circuit } => format!("CLOSECIRCUIT {}", circuit),
            Command::CloseStream { stream, reason } => format!("CLOSESTREAM {} {}", stream, reason),
            Command::AddTokens {
                first_hop,
                link_circuit,
                read,
                write,
            } => format!("ADDTOKENS {} {} {} {}", first_hop, link_circuit, read, write),
            Command::SendPayment {
                first_hop,
                link_circuit,
                cell,
                hops,
            } => format!("SENDPAYMENT {} {} {} {} 0", first_hop, link_circuit, cell, hops),
            Command::ConvertCircuitId { circuit } => format!("CONVERTCIRCID {}", circuit),
            Command::GetDescriptor { fingerprint } => format!("GETINFO desc/id/{}", fingerprint),
            Command::GetNetworkStatus => "GETINFO ns/all".to_string(),
        }
    }

    pub fn is_authenticate(&self) -> bool {
        matches!(self, Command::Authenticate { .. })
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Authenticate { .. } => "AUTHENTICATE",
            Command::SetEvents(_) => "SETEVENTS",
            Command::ExtendCircuit { .. } => "EXTENDCIRCUIT",
            Command::AttachStream { .. } => "ATTACHSTREAM",
            Command::CloseCircuit { .. } => "CLOSECIRCUIT",
            Command::CloseStream { .. } => "CLOSESTREAM",
            Command::AddTokens { .. } => "ADDTOKENS",
            Command::SendPayment { .. } => "SENDPAYMENT",
            Command::ConvertCircuitId { .. } => "CONVERTCIRCID",
            Command::GetDescriptor { .. } => "GETINFO desc",
            Command::GetNetworkStatus => "GETINFO ns",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from([byte; 20])
    }

    #[test]
    fn test_extend_circuit_line() {
        let cmd = Command::ExtendCircuit {
            path: vec![fp(0xAA), fp(0x01)],
        };
        assert_eq!(
            cmd.to_line(),
            format!("EXTENDCIRCUIT 0 {},{}", "AA".repeat(20), "01".repeat(20))
        );
    }

    #[test]
    fn test_payment_lines() {
        let add = Command::AddTokens {
            first_hop: fp(0x10),
            link_circuit: 7,
            read: 5120,
            write: 5120,
        };
        assert_eq!(add.to_line(), format!("ADDTOKENS {} 7 5120 5120", "10".repeat(20)));

        let pay = Command::SendPayment {
            first_hop: fp(0x10),
            link_circuit: 7,
            cell: "QUJD".to_string(),
            hops: 2,
        };
        assert_eq!(pay.to_line(), format!("SENDPAYMENT {} 7 QUJD 2 0", "10".repeat(20)));
    }

    #[test]
    fn test_simple_lines() {
        assert_eq!(
            Command::AttachStream {
                stream: StreamId(4),
                circuit: CircuitId(9)
            }
            .to_line(),
            "ATTACHSTREAM 4 9"
        );
        assert_eq!(
            Command::CloseStream {
                stream: StreamId(4),
                reason: 5
            }
            .to_line(),
            "CLOSESTREAM 4 5"
        );
        assert_eq!(
            Command::SetEvents(vec![EventKind::Circ, EventKind::Stream]).to_line(),
            "SETEVENTS CIRC STREAM"
        );
        assert_eq!(
            Command::Authenticate {
                secret: "pa\"ss".to_string()
            }
            .to_line(),
            "AUTHENTICATE \"pa\\\"ss\""
        );
    }
}
