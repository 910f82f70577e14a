use super::{BankError, BankRequest, BankResponse, DepositStatus};
use crate::wallet::{IntervalInfo, Token, TOKEN_LEN};
use bitmesh_common::bank;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub version: u8,
    pub seq: u16,
    pub msg_type: u8,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.push(self.msg_type);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BankError> {
        if bytes.len() < HEADER_LEN {
            return Err(BankError::Malformed("short header".to_string()));
        }
        Ok(Self {
            version: bytes[0],
            seq: u16::from_be_bytes([bytes[1], bytes[2]]),
            msg_type: bytes[3],
        })
    }
}

pub(crate) fn encode_request(seq: u16, request: &BankRequest) -> Vec<u8> {
    let mut out = Vec::new();
    Header {
        version: bank::PROTOCOL_VERSION,
        seq,
        msg_type: request.message_type(),
    }
    .encode(&mut out);

    match request {
        BankRequest::Acquire { count } => out.extend_from_slice(&count.to_be_bytes()),
        BankRequest::Deposit { tokens } => {
            out.extend_from_slice(&(tokens.len() as u32).to_be_bytes());
            for token in tokens {
                out.extend_from_slice(&token.to_bytes());
            }
        }
    }
    out
}

/// Check the echoed header and decode the body of a reply to `request`
pub(crate) fn decode_response(
    seq: u16,
    request: &BankRequest,
    frame: &[u8],
) -> Result<BankResponse, BankError> {
    let header = Header::decode(frame)?;
    if header.seq != seq {
        return Err(BankError::ReplayDetected {
            expected: seq,
            got: header.seq,
        });
    }
    if header.version != bank::PROTOCOL_VERSION || header.msg_type != request.message_type() {
        return Err(BankError::Malformed(format!(
            "unexpected header {:?} for {:?}",
            header,
            request.message_type()
        )));
    }

    let mut body = Reader::new(&frame[HEADER_LEN..]);
    match request {
        BankRequest::Acquire { .. } => {
            let code = body.u8()?;
            let balance = u64::from(body.u32()?);
            if code != 0 {
                return Ok(BankResponse::AcquireRefused { code, balance });
            }
            let count = body.u32()? as usize;
            let mut tokens = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                tokens.push(
                    Token::from_bytes(body.take(TOKEN_LEN)?)
                        .map_err(|err| BankError::Malformed(err.to_string()))?,
                );
            }
            Ok(BankResponse::Acquired { tokens, balance })
        }
        BankRequest::Deposit { .. } => {
            let balance = u64::from(body.u32()?);
            let current = body.u32()?;
            let expires_current = u64::from(body.u32()?);
            let expires_next = u64::from(body.u32()?);
            let statuses = body
                .rest()
                .iter()
                .map(|byte| {
                    DepositStatus::from_byte(*byte).ok_or_else(|| {
                        BankError::Malformed(format!("deposit status {:?}", *byte as char))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(BankResponse::Deposited {
                balance,
                info: IntervalInfo {
                    current,
                    expires_current,
                    expires_next,
                },
                statuses,
            })
        }
    }
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), BankError> {
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, BankError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > bank::MAX_FRAME_SIZE {
        return Err(BankError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BankError> {
        if self.bytes.len() < len {
            return Err(BankError::Malformed(format!(
                "needed {} bytes, {} left",
                len,
                self.bytes.len()
            )));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, BankError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, BankError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }
}

/// Reply encoders for the bank side of the protocol
#[cfg(test)]
pub(crate) mod server {
    use super::*;

    pub fn acquire_reply(seq: u16, tokens: &[Token], balance: u32) -> Vec<u8> {
        let mut out = Vec::new();
        Header {
            version: bank::PROTOCOL_VERSION,
            seq,
            msg_type: bank::MSG_ACQUIRE,
        }
        .encode(&mut out);
        out.push(0);
        out.extend_from_slice(&balance.to_be_bytes());
        out.extend_from_slice(&(tokens.len() as u32).to_be_bytes());
        for token in tokens {
            out.extend_from_slice(&token.to_bytes());
        }
        out
    }

    pub fn deposit_reply(seq: u16, balance: u32, info: IntervalInfo, statuses: &[DepositStatus]) -> Vec<u8> {
        let mut out = Vec::new();
        Header {
            version: bank::PROTOCOL_VERSION,
            seq,
            msg_type: bank::MSG_DEPOSIT,
        }
        .encode(&mut out);
        out.extend_from_slice(&balance.to_be_bytes());
        out.extend_from_slice(&info.current.to_be_bytes());
        out.extend_from_slice(&(info.expires_current as u32).to_be_bytes());
        out.extend_from_slice(&(info.expires_next as u32).to_be_bytes());
        out.extend(statuses.iter().map(|status| status.to_byte()));
        out
    }

    /// Parse a request frame: header plus the acquire count or deposited tokens
    pub fn parse_request(frame: &[u8]) -> (Header, BankRequest) {
        let header = Header::decode(frame).unwrap();
        let mut body = Reader::new(&frame[HEADER_LEN..]);
        let request = if header.msg_type == bank::MSG_ACQUIRE {
            BankRequest::Acquire {
                count: body.u32().unwrap(),
            }
        } else {
            let count = body.u32().unwrap();
            let tokens = (0..count)
                .map(|_| Token::from_bytes(body.take(TOKEN_LEN).unwrap()).unwrap())
                .collect();
            BankRequest::Deposit { tokens }
        };
        (header, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::generate_bank_key;

    #[test]
    fn test_acquire_reply_decodes() {
        let key = generate_bank_key();
        let tokens = vec![Token::issue(&key, 2, 1), Token::issue(&key, 2, 1)];
        let request = BankRequest::Acquire { count: 2 };
        let frame = server::acquire_reply(9, &tokens, 40);

        match decode_response(9, &request, &frame).unwrap() {
            BankResponse::Acquired { tokens: got, balance } => {
                assert_eq!(got, tokens);
                assert_eq!(balance, 40);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_refused_acquire() {
        let mut frame = Vec::new();
        Header {
            version: bank::PROTOCOL_VERSION,
            seq: 1,
            msg_type: bank::MSG_ACQUIRE,
        }
        .encode(&mut frame);
        frame.push(2);
        frame.extend_from_slice(&5u32.to_be_bytes());

        assert_eq!(
            decode_response(1, &BankRequest::Acquire { count: 30 }, &frame).unwrap(),
            BankResponse::AcquireRefused { code: 2, balance: 5 }
        );
    }

    #[test]
    fn test_sequence_mismatch_is_replay() {
        let frame = server::acquire_reply(4, &[], 0);
        assert_eq!(
            decode_response(5, &BankRequest::Acquire { count: 1 }, &frame).unwrap_err(),
            BankError::ReplayDetected { expected: 5, got: 4 }
        );
    }

    #[test]
    fn test_deposit_reply() {
        let info = IntervalInfo {
            current: 3,
            expires_current: 1000,
            expires_next: 2000,
        };
        let statuses = [DepositStatus::Accepted, DepositStatus::DoubleSpent];
        let frame = server::deposit_reply(7, 12, info, &statuses);
        let request = BankRequest::Deposit { tokens: vec![] };
        assert_eq!(
            decode_response(7, &request, &frame).unwrap(),
            BankResponse::Deposited {
                balance: 12,
                info,
                statuses: statuses.to_vec()
            }
        );

        let mut bad = frame.clone();
        *bad.last_mut().unwrap() = b'9';
        assert!(matches!(decode_response(7, &request, &bad), Err(BankError::Malformed(_))));
    }

    #[test]
    fn test_truncated_body() {
        let mut frame = server::acquire_reply(1, &[Token::issue(&generate_bank_key(), 1, 1)], 3);
        frame.truncate(frame.len() - 10);
        assert!(matches!(
            decode_response(1, &BankRequest::Acquire { count: 1 }, &frame),
            Err(BankError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_and_limit() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");

        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(BankError::FrameTooLarge(_))));
    }
}
