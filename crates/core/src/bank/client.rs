use super::codec::{decode_response, encode_request, read_frame, write_frame};
use super::{BankError, BankRequest, BankResponse};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A finished bank request
#[derive(Debug, Clone)]
pub struct BankResult {
    pub request: BankRequest,
    pub outcome: Result<BankResponse, BankError>,
}

/// Handle to the bank worker. Requests are served strictly in order, one
/// at a time; results come back on the channel returned by `spawn`.
#[derive(Debug, Clone)]
pub struct BankClient {
    requests: mpsc::UnboundedSender<BankRequest>,
}

impl BankClient {
    pub fn spawn(addr: String, timeout: Duration) -> (Self, mpsc::UnboundedReceiver<BankResult>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            addr,
            timeout,
            seq: 0,
            connection: None,
        };
        tokio::spawn(worker.run(request_rx, result_tx));

        (Self { requests: request_tx }, result_rx)
    }

    pub fn submit(&self, request: BankRequest) -> Result<(), BankError> {
        self.requests.send(request).map_err(|_| BankError::Closed)
    }
}

struct Worker {
    addr: String,
    timeout: Duration,
    seq: u16,
    connection: Option<TcpStream>,
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<BankRequest>,
        results: mpsc::UnboundedSender<BankResult>,
    ) {
        while let Some(request) = requests.recv().await {
            self.seq = self.seq.wrapping_add(1);
            let seq = self.seq;

            let outcome = match tokio::time::timeout(self.timeout, self.exchange(seq, &request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BankError::Timeout),
            };

            if let Err(err) = &outcome {
                warn!("Bank request {} failed: {}", seq, err);
                self.connection = None;
            } else {
                debug!("Bank request {} answered", seq);
            }

            if results.send(BankResult { request, outcome }).is_err() {
                break;
            }
        }
        debug!("Bank worker stopped");
    }

    async fn exchange(&mut self, seq: u16, request: &BankRequest) -> Result<BankResponse, BankError> {
        if self.connection.is_none() {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            self.connection = Some(stream);
        }
        let stream = self.connection.as_mut().ok_or(BankError::Closed)?;

        write_frame(stream, &encode_request(seq, request)).await?;
        let frame = read_frame(stream).await?;
        decode_response(seq, request, &frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::codec::server;
    use crate::bank::DepositStatus;
    use crate::wallet::{generate_bank_key, IntervalInfo, Token};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_requests_served_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let key = generate_bank_key();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                let frame = match read_frame(&mut socket).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let (header, request) = server::parse_request(&frame);
                let reply = match request {
                    BankRequest::Acquire { count } => {
                        let tokens: Vec<Token> =
                            (0..count).map(|_| Token::issue(&key, 1, 1)).collect();
                        server::acquire_reply(header.seq, &tokens, 100)
                    }
                    BankRequest::Deposit { tokens } => {
                        let info = IntervalInfo {
                            current: 2,
                            expires_current: 50,
                            expires_next: 100,
                        };
                        let statuses = vec![DepositStatus::Accepted; tokens.len()];
                        server::deposit_reply(header.seq, 99, info, &statuses)
                    }
                };
                write_frame(&mut socket, &reply).await.unwrap();
            }
        });

        let (client, mut results) = BankClient::spawn(addr, Duration::from_secs(5));
        client.submit(BankRequest::Acquire { count: 3 }).unwrap();
        client.submit(BankRequest::Deposit { tokens: vec![] }).unwrap();

        let first = results.recv().await.unwrap();
        match first.outcome.unwrap() {
            BankResponse::Acquired { tokens, balance } => {
                assert_eq!(tokens.len(), 3);
                assert_eq!(balance, 100);
            }
            other => panic!("unexpected {:?}", other),
        }

        let second = results.recv().await.unwrap();
        assert_eq!(second.request, BankRequest::Deposit { tokens: vec![] });
        assert!(matches!(
            second.outcome.unwrap(),
            BankResponse::Deposited { balance: 99, .. }
        ));
    }

    #[tokio::test]
    async fn test_replayed_reply_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut socket).await.unwrap();
            let (header, _) = server::parse_request(&frame);
            let stale = server::acquire_reply(header.seq.wrapping_sub(1), &[], 0);
            write_frame(&mut socket, &stale).await.unwrap();
        });

        let (client, mut results) = BankClient::spawn(addr, Duration::from_secs(5));
        client.submit(BankRequest::Acquire { count: 1 }).unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(
            result.outcome.unwrap_err(),
            BankError::ReplayDetected { expected: 1, got: 0 }
        );
    }

    #[tokio::test]
    async fn test_unreachable_bank_and_timeout() {
        // bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (client, mut results) = BankClient::spawn(addr, Duration::from_secs(5));
        client.submit(BankRequest::Deposit { tokens: vec![] }).unwrap();
        assert!(matches!(results.recv().await.unwrap().outcome, Err(BankError::Io(_))));

        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap().to_string();
        let (client, mut results) = BankClient::spawn(addr, Duration::from_millis(200));
        client.submit(BankRequest::Acquire { count: 1 }).unwrap();
        assert!(matches!(results.recv().await.unwrap().outcome, Err(BankError::Timeout)));
        drop(silent);
    }
}
