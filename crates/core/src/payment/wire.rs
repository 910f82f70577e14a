/// Payment message encoding
///
/// A message is framed as `len u16 | type u8 | payload`, where `len` covers
/// the type byte and the payload. Frames travel in fixed size cells: each
/// cell holds up to 507 bytes, is padded with spaces and base64 encoded
/// without padding for the SENDPAYMENT command. A cell never carries the
/// start of a second frame, so whatever follows a complete frame is filler.

use super::PaymentError;
use crate::wallet::{Token, TOKEN_LEN};
use bitmesh_common::{payment, Fingerprint, FINGERPRINT_LEN};
use data_encoding::BASE64_NOPAD;

pub const MSG_SETUP: u8 = 1;
pub const MSG_SETUP_REPLY: u8 = 2;
pub const MSG_PAYMENT: u8 = 3;
pub const MSG_RECEIPT: u8 = 4;
pub const MSG_BANK_RELAY: u8 = 5;

/// Coin type tag for bank issued tokens
pub const COIN_TYPE_TOKEN: u8 = 1;

pub const MERCHANT_TOKEN_LEN: usize = 4 + 32;

/// A payment slot handed out by a relay. One is spent per payment unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerchantToken {
    pub request_id: u32,
    pub slot: [u8; 32],
}

/// What we pay one hop for, and with which of its slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOrder {
    pub version: u8,
    pub read: u32,
    pub write: u32,
    pub payment_id: u32,
    /// Merchant request ids, one per unit
    pub request_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentMessage {
    Setup {
        version: u8,
    },
    SetupReply {
        version: u8,
        hop: Fingerprint,
        tokens: Vec<MerchantToken>,
    },
    Payment(PaymentOrder),
    Receipt {
        version: u8,
        hop: Fingerprint,
        payment_id: u32,
        tokens: Vec<MerchantToken>,
    },
    /// Sent to the first hop, which hands `bank_message` to the bank and
    /// forwards `order` to hop `hop_index`
    BankRelay {
        version: u8,
        hop_index: u8,
        bank_message: Vec<u8>,
        order: PaymentOrder,
    },
}

impl PaymentMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            PaymentMessage::Setup { .. } => MSG_SETUP,
            PaymentMessage::SetupReply { .. } => MSG_SETUP_REPLY,
            PaymentMessage::Payment(_) => MSG_PAYMENT,
            PaymentMessage::Receipt { .. } => MSG_RECEIPT,
            PaymentMessage::BankRelay { .. } => MSG_BANK_RELAY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaymentMessage::Setup { .. } => "setup",
            PaymentMessage::SetupReply { .. } => "setup_reply",
            PaymentMessage::Payment(_) => "payment",
            PaymentMessage::Receipt { .. } => "receipt",
            PaymentMessage::BankRelay { .. } => "bank_relay",
        }
    }

    /// Full frame, length prefix included
    pub fn encode(&self) -> Vec<u8> {
        let mut body = vec![self.message_type()];
        match self {
            PaymentMessage::Setup { version } => body.push(*version),
            PaymentMessage::SetupReply { version, hop, tokens } => {
                body.push(*version);
                body.extend_from_slice(hop.as_bytes());
                write_merchant_tokens(&mut body, tokens);
            }
            PaymentMessage::Payment(order) => order.encode_into(&mut body),
            PaymentMessage::Receipt {
                version,
                hop,
                payment_id,
                tokens,
            } => {
                body.push(*version);
                body.extend_from_slice(hop.as_bytes());
                body.extend_from_slice(&payment_id.to_be_bytes());
                write_merchant_tokens(&mut body, tokens);
            }
            PaymentMessage::BankRelay {
                version,
                hop_index,
                bank_message,
                order,
            } => {
                body.push(*version);
                body.push(*hop_index);
                write_lenstr(&mut body, bank_message);
                let mut inner = Vec::new();
                order.encode_into(&mut inner);
                write_lenstr(&mut body, &inner);
            }
        }

        let mut frame = Vec::with_capacity(body.len() + 2);
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode `type | payload`, without the length prefix
    pub fn decode(body: &[u8]) -> Result<Self, PaymentError> {
        let mut reader = Reader::new(body);
        let msg_type = reader.u8()?;
        let message = match msg_type {
            MSG_SETUP => PaymentMessage::Setup {
                version: reader.u8()?,
            },
            MSG_SETUP_REPLY => PaymentMessage::SetupReply {
                version: reader.u8()?,
                hop: reader.fingerprint()?,
                tokens: reader.merchant_tokens()?,
            },
            MSG_PAYMENT => PaymentMessage::Payment(PaymentOrder::decode(&mut reader)?),
            MSG_RECEIPT => PaymentMessage::Receipt {
                version: reader.u8()?,
                hop: reader.fingerprint()?,
                payment_id: reader.u32()?,
                tokens: reader.merchant_tokens()?,
            },
            MSG_BANK_RELAY => {
                let version = reader.u8()?;
                let hop_index = reader.u8()?;
                let bank_message = reader.lenstr()?.to_vec();
                let mut inner = Reader::new(reader.lenstr()?);
                PaymentMessage::BankRelay {
                    version,
                    hop_index,
                    bank_message,
                    order: PaymentOrder::decode(&mut inner)?,
                }
            }
            other => return Err(PaymentError::UnknownType(other)),
        };
        Ok(message)
    }
}

impl PaymentOrder {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.extend_from_slice(&self.read.to_be_bytes());
        out.extend_from_slice(&self.write.to_be_bytes());
        out.extend_from_slice(&self.payment_id.to_be_bytes());
        out.push(self.request_ids.len() as u8);
        for request_id in &self.request_ids {
            out.push(COIN_TYPE_TOKEN);
            out.extend_from_slice(&request_id.to_be_bytes());
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, PaymentError> {
        let version = reader.u8()?;
        let read = reader.u32()?;
        let write = reader.u32()?;
        let payment_id = reader.u32()?;
        let count = reader.u8()?;
        let mut request_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let coin_type = reader.u8()?;
            if coin_type != COIN_TYPE_TOKEN {
                return Err(PaymentError::Malformed(format!("coin type {}", coin_type)));
            }
            request_ids.push(reader.u32()?);
        }
        Ok(Self {
            version,
            read,
            write,
            payment_id,
            request_ids,
        })
    }
}

/// The part of a bank relay message the bank reads: each unit pairs one of
/// our tokens with the merchant slot it pays
pub fn encode_bank_message(units: &[(Token, MerchantToken)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + units.len() * (TOKEN_LEN + 32));
    out.push(units.len() as u8);
    for (token, merchant) in units {
        out.extend_from_slice(&token.to_bytes());
        out.extend_from_slice(&merchant.slot);
    }
    out
}

/// Split a frame into encoded SENDPAYMENT cells
pub fn to_cells(frame: &[u8]) -> Vec<String> {
    frame
        .chunks(payment::CELL_PAYLOAD_BYTES)
        .map(|chunk| {
            let mut cell = chunk.to_vec();
            cell.resize(payment::CELL_PAYLOAD_BYTES, b' ');
            BASE64_NOPAD.encode(&cell)
        })
        .collect()
}

pub fn decode_cell(cell: &str) -> Result<Vec<u8>, PaymentError> {
    BASE64_NOPAD
        .decode(cell.trim().trim_end_matches('=').as_bytes())
        .map_err(|_| PaymentError::BadCell)
}

/// Reassembles frames from incoming cells
#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one cell. Returns the message once its frame is complete.
    pub fn push(&mut self, cell: &[u8]) -> Result<Option<PaymentMessage>, PaymentError> {
        self.buffer.extend_from_slice(cell);
        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.buffer.len() - 2 < len {
            return Ok(None);
        }

        let buffer = std::mem::take(&mut self.buffer);
        if len == 0 {
            return Err(PaymentError::Malformed("empty frame".to_string()));
        }
        PaymentMessage::decode(&buffer[2..2 + len]).map(Some)
    }

    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn write_merchant_tokens(out: &mut Vec<u8>, tokens: &[MerchantToken]) {
    out.push(tokens.len() as u8);
    for token in tokens {
        out.extend_from_slice(&token.request_id.to_be_bytes());
        out.extend_from_slice(&token.slot);
    }
}

fn write_lenstr(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PaymentError> {
        if self.bytes.len() < len {
            return Err(PaymentError::Malformed(format!(
                "needed {} bytes, {} left",
                len,
                self.bytes.len()
            )));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, PaymentError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PaymentError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn fingerprint(&mut self) -> Result<Fingerprint, PaymentError> {
        Fingerprint::from_slice(self.take(FINGERPRINT_LEN)?)
            .map_err(|err| PaymentError::Malformed(err.to_string()))
    }

    fn lenstr(&mut self) -> Result<&'a [u8], PaymentError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn merchant_tokens(&mut self) -> Result<Vec<MerchantToken>, PaymentError> {
        let count = self.u8()?;
        let mut tokens = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let request_id = self.u32()?;
            let mut slot = [0u8; 32];
            slot.copy_from_slice(self.take(32)?);
            tokens.push(MerchantToken { request_id, slot });
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merchant(id: u32) -> MerchantToken {
        MerchantToken {
            request_id: id,
            slot: [id as u8; 32],
        }
    }

    #[test]
    fn test_setup_frame_layout() {
        let frame = PaymentMessage::Setup { version: 1 }.encode();
        assert_eq!(frame, vec![0, 2, MSG_SETUP, 1]);

        let cells = to_cells(&frame);
        assert_eq!(cells.len(), 1);
        let raw = decode_cell(&cells[0]).unwrap();
        assert_eq!(raw.len(), payment::CELL_PAYLOAD_BYTES);
        assert_eq!(&raw[..4], frame.as_slice());
        assert!(raw[4..].iter().all(|b| *b == b' '));
    }

    #[test]
    fn test_framer_reassembles_across_cells() {
        let message = PaymentMessage::Receipt {
            version: 1,
            hop: Fingerprint::from([9u8; 20]),
            payment_id: 77,
            tokens: (0..20).map(merchant).collect(),
        };
        let frame = message.encode();
        assert!(frame.len() > payment::CELL_PAYLOAD_BYTES);

        let cells = to_cells(&frame);
        assert_eq!(cells.len(), 2);

        let mut framer = Framer::new();
        assert_eq!(framer.push(&decode_cell(&cells[0]).unwrap()).unwrap(), None);
        assert!(framer.is_mid_frame());
        assert_eq!(framer.push(&decode_cell(&cells[1]).unwrap()).unwrap(), Some(message));
        assert!(!framer.is_mid_frame());
    }

    #[test]
    fn test_bank_relay_layout() {
        let order = PaymentOrder {
            version: 1,
            read: 10240,
            write: 0,
            payment_id: 3,
            request_ids: vec![5],
        };
        let message = PaymentMessage::BankRelay {
            version: 1,
            hop_index: 2,
            bank_message: vec![1, 2, 3],
            order: order.clone(),
        };
        let frame = message.encode();
        // len, type, version, hop index, then the bank message length
        assert_eq!(&frame[2..5], &[MSG_BANK_RELAY, 1, 2]);
        assert_eq!(&frame[5..9], &3u32.to_be_bytes());
        assert_eq!(PaymentMessage::decode(&frame[2..]).unwrap(), message);

        let mut inner = Vec::new();
        order.encode_into(&mut inner);
        // version, read, write, id, count, then coin type + request id
        assert_eq!(inner.len(), 1 + 4 + 4 + 4 + 1 + 5);
        assert_eq!(inner[13], 1);
        assert_eq!(inner[14], COIN_TYPE_TOKEN);
    }

    #[test]
    fn test_bad_input() {
        assert_eq!(PaymentMessage::decode(&[9]), Err(PaymentError::UnknownType(9)));
        assert!(matches!(
            PaymentMessage::decode(&[MSG_RECEIPT, 1, 0xAA]),
            Err(PaymentError::Malformed(_))
        ));
        assert_eq!(decode_cell("!!not base64"), Err(PaymentError::BadCell));

        let mut framer = Framer::new();
        assert!(framer.push(&[0, 0, b' ', b' ']).is_err());
        assert!(!framer.is_mid_frame());
    }

    #[test]
    fn test_bank_message_units() {
        let key = crate::wallet::generate_bank_key();
        let token = Token::issue(&key, 1, 1);
        let bytes = encode_bank_message(&[(token.clone(), merchant(4))]);
        assert_eq!(bytes.len(), 1 + TOKEN_LEN + 32);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..1 + TOKEN_LEN], &token.to_bytes()[..]);
    }
}
