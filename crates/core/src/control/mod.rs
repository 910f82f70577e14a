/// Control link to the local routing daemon
///
/// The daemon speaks a line based protocol: every request gets exactly one
/// reply, replies come back in request order, and asynchronous events are
/// interleaved with them under the 6xx status class.

mod command;
mod event;
mod link;
mod reply;

pub use command::Command;
pub use event::{
    BandwidthEvent, CircuitEvent, ConsensusEntry, ControlEvent, EventKind, OrCircuitEvent,
    OrConnEvent, StreamEvent, TokenLevelsEvent,
};
pub use link::{ControlLink, LinkEvent, Ticket};
pub(crate) use event::parse_network_status;
pub use reply::{Reply, ReplyLine, ReplyParser};

use bitmesh_common::BitmeshError;

/// Errors raised by the control link
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// Malformed input from the daemon. The link is closed afterwards.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon refused a command
    #[error("request rejected ({code}): {message}")]
    Request { code: u16, message: String },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("control link closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl ControlError {
    /// Whether the failure leaves the link usable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Closed | Self::Io(_))
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<ControlError> for BitmeshError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Protocol(msg) => BitmeshError::Protocol(msg),
            ControlError::Request { code, message } => BitmeshError::Request { code, message },
            ControlError::NotAuthenticated | ControlError::AlreadyAuthenticated => {
                BitmeshError::Protocol(err.to_string())
            }
            ControlError::Closed | ControlError::Io(_) => BitmeshError::Dependency(err.to_string()),
        }
    }
}
