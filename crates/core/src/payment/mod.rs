/// Per-circuit payments to the relays of circuits we build
///
/// Each paying circuit owns a [`PaymentChannel`]. The channel decides how
/// many tokens to buy, builds the payment messages and tracks receipts, but
/// never talks to the daemon itself: every step returns the commands it
/// needs sent as [`ChannelAction`]s.

mod channel;
pub mod wire;

pub use channel::{ChannelAction, ChannelStats, PaymentChannel, Refill, REASON_REQUESTED, REASON_TIMEOUT};
pub use wire::{Framer, MerchantToken, PaymentMessage};

use bitmesh_common::BitmeshError;

/// Anything carrying a payment channel
pub trait PaymentCapable {
    /// Whether traffic on this circuit must be paid for
    fn pays(&self) -> bool;

    fn payment_channel(&self) -> Option<&PaymentChannel>;

    fn payment_channel_mut(&mut self) -> Option<&mut PaymentChannel>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("malformed payment message: {0}")]
    Malformed(String),

    #[error("unknown payment message type {0}")]
    UnknownType(u8),

    #[error("message from {0} which is not on this circuit")]
    UnknownHop(String),

    #[error("receipt for unknown payment {0}")]
    UnknownPayment(u32),

    #[error("payment of {0} tokens is out of range")]
    BadAmount(u64),

    #[error("payment cell is not valid base64")]
    BadCell,
}

impl From<PaymentError> for BitmeshError {
    fn from(err: PaymentError) -> Self {
        BitmeshError::Protocol(err.to_string())
    }
}
