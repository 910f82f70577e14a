/// Node runtime
///
/// Owns the [`Router`] and feeds it from one loop: control link events and
/// replies, bank results and the timers. Whatever the router queued is
/// written to the link after every step.

use crate::bank::{Backoff, BankClient, BankResult};
use crate::control::{ControlError, ControlLink, LinkEvent, Ticket};
use crate::directory::RelayDirectory;
use crate::router::{Outgoing, Purpose, Router, RouterSettings, RouterSnapshot};
use crate::wallet::Wallet;
use anyhow::{Context, Result};
use bitmesh_common::{control, Fingerprint, NodeConfig, Timestamp};
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

const TICK: Duration = Duration::from_secs(1);

/// How a connected session ended
enum SessionEnd {
    LinkLost,
    Shutdown,
}

pub struct Node {
    config: NodeConfig,
    router: Router,
    bank: BankClient,
    bank_results: mpsc::UnboundedReceiver<BankResult>,
    snapshots: watch::Sender<RouterSnapshot>,
}

impl Node {
    /// Load the wallet and set up the router. Must run inside a tokio
    /// runtime: the bank worker is spawned here.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        info!("Initializing bitmesh node...");

        let bank_key = parse_bank_key(&config.bank_key)?;
        if config.payments_enabled && bank_key.is_none() {
            warn!("No bank key configured, acquired tokens will not be verified");
        }

        let own_fingerprint = config
            .own_fingerprint
            .as_deref()
            .map(|hex| hex.parse::<Fingerprint>())
            .transpose()
            .context("invalid own_fingerprint")?;
        if let Some(fingerprint) = &own_fingerprint {
            info!("Running alongside relay {}", fingerprint);
        }

        let wallet = if config.data_dir.is_empty() {
            Wallet::new(bank_key)
        } else {
            let dir = PathBuf::from(&config.data_dir).join("wallet");
            Wallet::open(dir.clone(), bank_key)
                .with_context(|| format!("failed to open wallet in {}", dir.display()))?
        };

        let router = Router::new(
            RouterSettings::from_config(&config),
            RelayDirectory::new(own_fingerprint),
            wallet,
        );
        let (bank, bank_results) = BankClient::spawn(config.bank_addr.clone(), config.bank_timeout());
        let (snapshots, _) = watch::channel(router.snapshot());

        Ok(Self {
            config,
            router,
            bank,
            bank_results,
            snapshots,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// For registering applications before [`Node::run`]
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Snapshots published once a second while the node runs
    pub fn subscribe_snapshots(&self) -> watch::Receiver<RouterSnapshot> {
        self.snapshots.subscribe()
    }

    /// Run until `shutdown` flips (or its sender is dropped). Reconnects to
    /// the routing daemon with backoff whenever the link drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = Backoff::new(
            Duration::from_secs(control::RECONNECT_BASE_SECS),
            Duration::from_secs(control::RECONNECT_MAX_SECS),
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match self.connect().await {
                Ok((link, events)) => {
                    backoff.reset();
                    match self.drive(link, events, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::LinkLost => backoff.next_delay(),
                    }
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Control link to {} failed: {}, retrying in {}s",
                        self.config.control_addr,
                        err,
                        delay.as_secs()
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.finish();
        Ok(())
    }

    async fn connect(
        &self,
    ) -> Result<(ControlLink, mpsc::UnboundedReceiver<LinkEvent>), ControlError> {
        let (link, events) = ControlLink::connect(&self.config.control_addr).await?;
        link.authenticate(&self.config.control_secret).await?;
        link.subscribe(&self.router.event_kinds()).await?;
        info!("Connected to routing daemon at {}", self.config.control_addr);
        Ok((link, events))
    }

    /// One connected session
    async fn drive(
        &mut self,
        link: ControlLink,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut pending: HashMap<Ticket, Purpose> = HashMap::new();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let period = self.config.maintenance_interval();
        let mut maintenance = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.router.on_link_ready();
        // logs in to the bank and learns the current interval
        self.maintain_wallet();
        self.flush(&link, &mut pending);
        self.publish();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let event = event.unwrap_or(LinkEvent::Closed(None));
                    if !self.on_link_event(event, &mut pending) {
                        self.publish();
                        return SessionEnd::LinkLost;
                    }
                }
                Some(result) = self.bank_results.recv() => {
                    self.router.on_bank_result(result, Instant::now(), Timestamp::now().as_secs());
                }
                _ = tick.tick() => {
                    self.router.on_tick(Instant::now());
                    self.publish();
                }
                _ = maintenance.tick() => self.maintain_wallet(),
                _ = shutdown.changed() => {
                    self.close_everything();
                    self.flush(&link, &mut pending);
                    return SessionEnd::Shutdown;
                }
            }
            self.flush(&link, &mut pending);
        }
    }

    /// Returns false once the link is gone
    fn on_link_event(&mut self, event: LinkEvent, pending: &mut HashMap<Ticket, Purpose>) -> bool {
        let now = Instant::now();
        let unix_now = Timestamp::now().as_secs();
        match event {
            LinkEvent::Event(reply) => self.router.on_event(&reply, now, unix_now),
            LinkEvent::Reply { ticket, result } => match pending.remove(&ticket) {
                Some(purpose) => self.router.on_command_result(purpose, result, now, unix_now),
                None => debug!("Reply for unknown ticket {}", ticket.0),
            },
            LinkEvent::Closed(err) => {
                match err {
                    Some(err) => error!("Control link closed: {}", err),
                    None => warn!("Control link closed"),
                }
                pending.clear();
                self.router.on_link_closed(now);
                return false;
            }
        }
        true
    }

    /// Write everything the router queued
    fn flush(&mut self, link: &ControlLink, pending: &mut HashMap<Ticket, Purpose>) {
        for Outgoing { purpose, command } in self.router.take_outgoing() {
            match link.submit_tracked(&command) {
                Ok(ticket) => {
                    trace!("-> {} ({})", command.name(), ticket.0);
                    pending.insert(ticket, purpose);
                }
                // the Closed event that follows cleans up
                Err(err) => debug!("Dropping {}: {}", command.name(), err),
            }
        }
    }

    fn maintain_wallet(&mut self) {
        if !self.config.payments_enabled {
            return;
        }
        let unix_now = Timestamp::now().as_secs();
        for request in self.router.maintain_wallet(Instant::now(), unix_now) {
            if let Err(err) = self.bank.submit(request.clone()) {
                self.router.on_bank_result(
                    BankResult {
                        request,
                        outcome: Err(err),
                    },
                    Instant::now(),
                    unix_now,
                );
            }
        }
    }

    fn close_everything(&mut self) {
        let now = Instant::now();
        let apps: Vec<_> = self.router.applications().map(|app| app.id).collect();
        for app in apps {
            self.router.close_all(app, now);
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.router.snapshot());
    }

    fn finish(&mut self) {
        info!("Stopping bitmesh node...");
        if let Err(err) = self.router.wallet().save() {
            error!("Failed to save wallet: {}", err);
        }
        self.publish();
    }
}

/// Hex encoded ed25519 key the bank signs tokens with. Empty means none.
fn parse_bank_key(hex_key: &str) -> Result<Option<VerifyingKey>> {
    let hex_key = hex_key.trim();
    if hex_key.is_empty() {
        return Ok(None);
    }
    let bytes: [u8; 32] = hex::decode(hex_key)
        .context("bank_key is not hex")?
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow::anyhow!("bank_key has {} bytes, expected 32", bytes.len()))?;
    let key = VerifyingKey::from_bytes(&bytes).context("bank_key is not a valid ed25519 key")?;
    Ok(Some(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::generate_bank_key;

    #[test]
    fn test_parse_bank_key() {
        assert!(parse_bank_key("").unwrap().is_none());
        assert!(parse_bank_key("zz").is_err());
        assert!(parse_bank_key("abcd").is_err());

        let key = generate_bank_key().verifying_key();
        let parsed = parse_bank_key(&hex::encode(key.as_bytes())).unwrap();
        assert_eq!(parsed, Some(key));
    }

    #[tokio::test]
    async fn test_new_without_data_dir() {
        let config = NodeConfig::default().with_data_dir(String::new()).with_payments(false);
        let node = Node::new(config).await.unwrap();
        assert!(!node.router().is_link_ready());
        assert!(node.router().is_logged_in());
        assert_eq!(node.subscribe_snapshots().borrow().circuits.len(), 0);
    }

    #[tokio::test]
    async fn test_new_rejects_bad_fingerprint() {
        let mut config = NodeConfig::default().with_data_dir(String::new());
        config.own_fingerprint = Some("not-a-fingerprint".to_string());
        assert!(Node::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_disconnected() {
        let config = NodeConfig::default()
            .with_data_dir(String::new())
            .with_control_addr("127.0.0.1:1".to_string());
        let node = Node::new(config).await.unwrap();
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(node.run(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
