/// Client side of the token bank protocol
///
/// Requests go out one at a time over a length-prefixed TCP connection.
/// Every frame starts with `version u8 | seq u16 | type u8`; the bank echoes
/// the header so a reply can be matched to the request it answers.

mod backoff;
mod client;
pub(crate) mod codec;

pub use backoff::Backoff;
pub use client::{BankClient, BankResult};

use crate::wallet::{IntervalInfo, Token};
use bitmesh_common::BitmeshError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankRequest {
    Acquire { count: u32 },
    /// An empty deposit only asks for the balance and interval schedule
    Deposit { tokens: Vec<Token> },
}

impl BankRequest {
    pub fn message_type(&self) -> u8 {
        use bitmesh_common::bank;
        match self {
            BankRequest::Acquire { .. } => bank::MSG_ACQUIRE,
            BankRequest::Deposit { .. } => bank::MSG_DEPOSIT,
        }
    }
}

/// Bank verdict on one deposited token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositStatus {
    Accepted,
    Invalid,
    AlreadyDeposited,
    DoubleSpent,
}

impl DepositStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(DepositStatus::Accepted),
            b'1' => Some(DepositStatus::Invalid),
            b'2' => Some(DepositStatus::AlreadyDeposited),
            b'3' => Some(DepositStatus::DoubleSpent),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            DepositStatus::Accepted => b'0',
            DepositStatus::Invalid => b'1',
            DepositStatus::AlreadyDeposited => b'2',
            DepositStatus::DoubleSpent => b'3',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankResponse {
    Acquired { tokens: Vec<Token>, balance: u64 },
    AcquireRefused { code: u8, balance: u64 },
    Deposited {
        balance: u64,
        info: IntervalInfo,
        statuses: Vec<DepositStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BankError {
    #[error("bank connection failed: {0}")]
    Io(String),

    #[error("bank did not answer in time")]
    Timeout,

    #[error("reply sequence {got} does not match request {expected}")]
    ReplayDetected { expected: u16, got: u16 },

    #[error("malformed bank reply: {0}")]
    Malformed(String),

    #[error("bank frame of {0} bytes is too large")]
    FrameTooLarge(usize),

    #[error("bank client stopped")]
    Closed,
}

impl From<std::io::Error> for BankError {
    fn from(err: std::io::Error) -> Self {
        BankError::Io(err.to_string())
    }
}

impl From<BankError> for BitmeshError {
    fn from(err: BankError) -> Self {
        match err {
            BankError::Timeout => BitmeshError::Timeout("bank request".to_string()),
            BankError::ReplayDetected { expected, got } => {
                BitmeshError::ReplayDetected { expected, got }
            }
            BankError::Io(msg) => BitmeshError::Dependency(msg),
            BankError::Closed => BitmeshError::Dependency(err.to_string()),
            other => BitmeshError::Protocol(other.to_string()),
        }
    }
}
