pub mod bank;
pub mod circuit;
pub mod control;
pub mod directory;
pub mod node;
pub mod payment;
pub mod router;
pub mod wallet;

pub use node::Node;

// Re-export the control protocol
pub use control::{
    Command, ControlError, ControlEvent, ControlLink, EventKind, LinkEvent, Reply, ReplyLine,
    Ticket,
};

// Re-export circuit and stream types
pub use circuit::{
    AppId, Application, ApplicationConfig, Circuit, CircuitId, CircuitKey, CircuitStatus,
    DetachPolicy, Pausable, PathSelectionCriteria, PathSelectionError, PathSelector, Stream,
    StreamId, StreamStatus,
};

// Re-export directory types
pub use directory::{ExitPolicy, Relay, RelayDirectory, Transport};

// Re-export payment and wallet types
pub use bank::{BankClient, BankError, BankRequest, BankResponse, BankResult};
pub use payment::{PaymentCapable, PaymentChannel, PaymentError};
pub use wallet::{CreditStatus, Token, Wallet, WalletError, WalletStats};

pub use router::{Router, RouterSettings, RouterSnapshot, DEFAULT_APP};
