/// Local store of bank tokens
///
/// Tokens are grouped by the interval they were issued in. A token can be
/// spent during its own interval and the next one; after that it is only
/// good for depositing back, and once the bank moves on again it is
/// dropped.

mod token;
mod wallet;

pub use token::{generate_bank_key, Token, TOKEN_LEN};
pub use wallet::{CreditStatus, IntervalInfo, Wallet, WalletStats};

use bitmesh_common::BitmeshError;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("duplicate token {0}")]
    DuplicateToken(String),

    #[error("token {0} has a bad signature")]
    InvalidToken(String),

    #[error("corrupt wallet data: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WalletError> for BitmeshError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientFunds { needed, available } => {
                BitmeshError::InsufficientFunds { needed, available }
            }
            WalletError::DuplicateToken(id) => BitmeshError::DuplicateToken(id),
            WalletError::Io(err) => BitmeshError::Io(err),
            other => BitmeshError::Serialization(other.to_string()),
        }
    }
}
