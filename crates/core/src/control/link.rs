use super::{Command, ControlError, EventKind, Reply, ReplyParser};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

const UNAUTHENTICATED: u8 = 0;
const AUTHENTICATING: u8 = 1;
const AUTHENTICATED: u8 = 2;

/// Handle for a request submitted with [`ControlLink::submit_tracked`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

/// Everything the link reports back, in the order it came off the wire
#[derive(Debug)]
pub enum LinkEvent {
    /// An asynchronous event reply (6xx)
    Event(Reply),

    /// The reply to a tracked request
    Reply {
        ticket: Ticket,
        result: Result<Reply, ControlError>,
    },

    /// The link is gone. Carries the error that killed it, if any.
    Closed(Option<ControlError>),
}

enum Waiter {
    Oneshot(oneshot::Sender<Result<Reply, ControlError>>),
    Ticket(Ticket),
}

struct Outgoing {
    line: String,
    waiter: Waiter,
}

/// Client side of the control connection
///
/// A background task owns the socket. Requests are written in submission
/// order and replies are matched to them first in, first out.
pub struct ControlLink {
    requests: mpsc::UnboundedSender<Outgoing>,
    auth_state: AtomicU8,
    next_ticket: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl ControlLink {
    /// Connect to the daemon's control port over TCP
    pub async fn connect(
        addr: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), ControlError> {
        debug!("Connecting control link to {}", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Run the link over an already open byte stream
    pub fn from_stream<S>(stream: S) -> (Self, mpsc::UnboundedReceiver<LinkEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_link(reader, writer, request_rx, event_tx, closed.clone()));

        let link = Self {
            requests: request_tx,
            auth_state: AtomicU8::new(UNAUTHENTICATED),
            next_ticket: AtomicU64::new(1),
            closed,
        };
        (link, event_rx)
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state.load(Ordering::SeqCst) == AUTHENTICATED
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.requests.is_closed()
    }

    /// Authenticate. Must succeed once before anything else is accepted.
    pub async fn authenticate(&self, secret: &str) -> Result<(), ControlError> {
        self.send(&Command::Authenticate {
            secret: secret.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Send a command and wait for its reply
    pub async fn send(&self, command: &Command) -> Result<Reply, ControlError> {
        if command.is_authenticate() {
            self.auth_state
                .compare_exchange(
                    UNAUTHENTICATED,
                    AUTHENTICATING,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .map_err(|_| ControlError::AlreadyAuthenticated)?;

            let result = self.roundtrip(command).await;
            let next = if result.is_ok() {
                AUTHENTICATED
            } else {
                UNAUTHENTICATED
            };
            self.auth_state.store(next, Ordering::SeqCst);
            return result;
        }

        self.require_authenticated()?;
        self.roundtrip(command).await
    }

    /// Queue a command whose reply is delivered as [`LinkEvent::Reply`] on
    /// the event channel, ordered with the events around it
    pub fn submit_tracked(&self, command: &Command) -> Result<Ticket, ControlError> {
        if command.is_authenticate() {
            return Err(ControlError::AlreadyAuthenticated);
        }
        self.require_authenticated()?;

        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        self.enqueue(command, Waiter::Ticket(ticket))?;
        Ok(ticket)
    }

    /// Select the event classes the daemon should report
    pub async fn subscribe(&self, kinds: &[EventKind]) -> Result<(), ControlError> {
        self.send(&Command::SetEvents(kinds.to_vec())).await.map(|_| ())
    }

    fn require_authenticated(&self) -> Result<(), ControlError> {
        if self.is_closed() {
            return Err(ControlError::Closed);
        }
        if !self.is_authenticated() {
            return Err(ControlError::NotAuthenticated);
        }
        Ok(())
    }

    async fn roundtrip(&self, command: &Command) -> Result<Reply, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(command, Waiter::Oneshot(tx))?;
        rx.await.map_err(|_| ControlError::Closed)?
    }

    fn enqueue(&self, command: &Command, waiter: Waiter) -> Result<(), ControlError> {
        trace!("Control link -> {}", command.name());
        self.requests
            .send(Outgoing {
                line: command.to_line(),
                waiter,
            })
            .map_err(|_| ControlError::Closed)
    }
}

fn deliver(
    waiter: Waiter,
    result: Result<Reply, ControlError>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) {
    match waiter {
        Waiter::Oneshot(tx) => {
            let _ = tx.send(result);
        }
        Waiter::Ticket(ticket) => {
            let _ = events.send(LinkEvent::Reply { ticket, result });
        }
    }
}

async fn run_link<R, W>(
    reader: R,
    mut writer: W,
    mut requests: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut parser = ReplyParser::new();
    let mut pending: VecDeque<Waiter> = VecDeque::new();

    let failure = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(outgoing) = request else {
                    break None;
                };
                let mut line = outgoing.line;
                line.push_str("\r\n");
                if let Err(err) = writer.write_all(line.as_bytes()).await {
                    let err = ControlError::from(err);
                    deliver(outgoing.waiter, Err(err.clone()), &events);
                    break Some(err);
                }
                pending.push_back(outgoing.waiter);
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Some(ControlError::Closed),
                    Err(err) => break Some(err.into()),
                };

                let reply = match parser.feed(&line) {
                    Ok(Some(reply)) => reply,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!("Malformed control line, closing link: {}", err);
                        break Some(err);
                    }
                };

                if reply.is_event() {
                    if !reply.is_bare_event_ok() {
                        let _ = events.send(LinkEvent::Event(reply));
                    }
                    continue;
                }

                match pending.pop_front() {
                    Some(waiter) => deliver(waiter, reply.into_result(), &events),
                    None => {
                        break Some(ControlError::Protocol(format!(
                            "reply without a request: {} {}",
                            reply.code(),
                            reply.text()
                        )))
                    }
                }
            }
        }
    };

    closed.store(true, Ordering::SeqCst);
    let error = failure.clone().unwrap_or(ControlError::Closed);

    for waiter in pending.drain(..) {
        deliver(waiter, Err(error.clone()), &events);
    }
    requests.close();
    while let Ok(outgoing) = requests.try_recv() {
        deliver(outgoing.waiter, Err(error.clone()), &events);
    }

    let _ = writer.shutdown().await;
    debug!("Control link closed: {:?}", failure);
    let _ = events.send(LinkEvent::Closed(failure));
}
