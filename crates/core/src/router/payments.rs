use super::{Purpose, Router};
use crate::bank::{BankRequest, BankResponse, BankResult};
use crate::circuit::{AppId, CircuitKey, Pausable};
use crate::control::{Command, ControlError, OrCircuitEvent, Reply, TokenLevelsEvent};
use crate::payment::{wire, ChannelAction, PaymentCapable, PaymentChannel, REASON_REQUESTED};
use crate::wallet::CreditStatus;
use bitmesh_common::Fingerprint;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

impl Router {
    /// First hop and link circuit id of a paying circuit
    fn link_of(&self, key: CircuitKey) -> Option<(Fingerprint, u32)> {
        let circuit = self.circuits.get(&key)?;
        let link_circuit = circuit.payment_channel()?.link_circuit()?;
        Some((*circuit.first_hop()?, link_circuit))
    }

    /// Turn what a payment channel asked for into commands
    pub(super) fn apply_channel_actions(
        &mut self,
        key: CircuitKey,
        actions: Vec<ChannelAction>,
        now: Instant,
    ) {
        for action in actions {
            match action {
                ChannelAction::Send { hops, message } => {
                    let (first_hop, link_circuit) = match self.link_of(key) {
                        Some(link) => link,
                        None => {
                            warn!("Cannot send {} on {}: no link circuit", message.name(), key);
                            continue;
                        }
                    };
                    trace!("{} -> {} to hop {}", key, message.name(), hops);
                    for cell in wire::to_cells(&message.encode()) {
                        self.push(
                            Purpose::SendPayment(key),
                            Command::SendPayment {
                                first_hop,
                                link_circuit,
                                cell,
                                hops,
                            },
                        );
                    }
                }
                ChannelAction::AddStartTokens { read, write } => {
                    if let Some((first_hop, link_circuit)) = self.link_of(key) {
                        self.push(
                            Purpose::AddStartTokens(key),
                            Command::AddTokens {
                                first_hop,
                                link_circuit,
                                read,
                                write,
                            },
                        );
                    }
                }
                ChannelAction::AddTokens { read, write } => {
                    if let Some((first_hop, link_circuit)) = self.link_of(key) {
                        self.push(
                            Purpose::AddTokens {
                                circuit: key,
                                read,
                                write,
                            },
                            Command::AddTokens {
                                first_hop,
                                link_circuit,
                                read,
                                write,
                            },
                        );
                    }
                }
                ChannelAction::Close { reason } => self.close_circuit(key, reason, now),
                ChannelAction::Ready => self.on_par_ready(key, now),
            }
        }
    }

    /// `CONVERTCIRCID` answered: payments can start
    pub(super) fn on_link_circuit(
        &mut self,
        key: CircuitKey,
        result: Result<Reply, ControlError>,
        now: Instant,
    ) {
        let link_circuit = match result.map(|reply| parse_link_circuit(reply.text())) {
            Ok(Some(link_circuit)) => link_circuit,
            Ok(None) => {
                warn!("Bad CONVERTCIRCID reply for {}", key);
                self.close_circuit(key, REASON_REQUESTED, now);
                return;
            }
            Err(err) => {
                warn!("Could not convert the id of {}: {}", key, err);
                self.close_circuit(key, REASON_REQUESTED, now);
                return;
            }
        };

        let circuit = match self.circuits.get_mut(&key) {
            Some(circuit) if !circuit.is_done() => circuit,
            _ => return,
        };
        let first_hop = match circuit.first_hop() {
            Some(hop) => *hop,
            None => return,
        };
        let actions = match circuit.payment_channel_mut() {
            Some(channel) => {
                channel.set_link_circuit(link_circuit);
                channel.start_setup(now)
            }
            None => return,
        };
        self.link_circuits.insert((first_hop, link_circuit), key);
        debug!("{} is circuit {} on the link to {}", key, link_circuit, first_hop);
        self.apply_channel_actions(key, actions, now);
    }

    pub(super) fn on_start_tokens_reply(
        &mut self,
        key: CircuitKey,
        result: Result<Reply, ControlError>,
        now: Instant,
        unix_now: u64,
    ) {
        let (reads, writes) = match result.map(|reply| parse_levels(reply.text())) {
            Ok(Some(levels)) => levels,
            Ok(None) => {
                warn!("Bad ADDTOKENS reply for {}", key);
                return;
            }
            Err(err) => {
                warn!("Start tokens for {} were refused: {}", key, err);
                return;
            }
        };
        match self.circuit_channel(key) {
            Some(channel) => channel.on_start_tokens_added(reads, writes),
            None => return,
        }
        self.refill_circuit(key, false, now, unix_now);
    }

    pub(super) fn on_tokens_reply(
        &mut self,
        key: CircuitKey,
        read: u64,
        write: u64,
        result: Result<Reply, ControlError>,
        now: Instant,
        unix_now: u64,
    ) {
        let (reads, writes) = match result.map(|reply| parse_levels(reply.text())) {
            Ok(Some(levels)) => levels,
            Ok(None) => {
                warn!("Bad ADDTOKENS reply for {}", key);
                return;
            }
            Err(err) => {
                warn!("Tokens for {} were refused: {}", key, err);
                return;
            }
        };
        match self.circuit_channel(key) {
            Some(channel) => channel.on_tokens_added(read, write, reads, writes),
            None => return,
        }
        self.refill_circuit(key, false, now, unix_now);
    }

    fn circuit_channel(&mut self, key: CircuitKey) -> Option<&mut PaymentChannel> {
        self.circuits
            .get_mut(&key)
            .filter(|circuit| !circuit.is_done())
            .and_then(|circuit| circuit.payment_channel_mut())
    }

    pub fn on_token_levels(&mut self, event: TokenLevelsEvent, now: Instant, unix_now: u64) {
        let key = match self.circuit_ids.get(&event.circuit) {
            Some(key) => *key,
            None => return,
        };
        let (read, written) = match self.circuit_channel(key) {
            Some(channel) => channel.on_token_levels(&event),
            None => return,
        };
        trace!("{} moved {} bytes in, {} bytes out", key, read, written);
        self.refill_circuit(key, false, now, unix_now);
    }

    /// Buy more traffic for a circuit if it is running low
    pub fn refill_circuit(&mut self, key: CircuitKey, force: bool, now: Instant, unix_now: u64) {
        if !self.settings.payments_enabled || !self.link_up {
            return;
        }
        let app = match self.circuits.get(&key) {
            Some(circuit) if !circuit.is_done() => circuit.app,
            _ => return,
        };
        if self.apps.get(&app).map(|app| app.is_paused()).unwrap_or(true) {
            return;
        }

        let actions = match self
            .circuits
            .get_mut(&key)
            .and_then(|circuit| circuit.payment.as_mut())
        {
            Some(channel) => channel.refill(force, &mut self.wallet, now, unix_now),
            None => return,
        };
        self.apply_channel_actions(key, actions, now);
    }

    pub fn on_or_circuit(&mut self, event: OrCircuitEvent, now: Instant, unix_now: u64) {
        match event {
            OrCircuitEvent::Payment {
                hop,
                link_circuit,
                cell,
            } => {
                let key = match self.link_circuits.get(&(hop, link_circuit)) {
                    Some(key) => *key,
                    None => {
                        trace!("Payment cell for unknown link circuit {} via {}", link_circuit, hop);
                        return;
                    }
                };
                let result = match self
                    .circuits
                    .get_mut(&key)
                    .filter(|circuit| !circuit.is_done())
                    .and_then(|circuit| circuit.payment.as_mut())
                {
                    Some(channel) => channel.handle_cell(&cell, &mut self.wallet, now, unix_now),
                    None => return,
                };
                match result {
                    Ok(actions) => self.apply_channel_actions(key, actions, now),
                    Err(err) => {
                        warn!("Bad payment message on {}: {}", key, err);
                        self.close_circuit(key, REASON_REQUESTED, now);
                    }
                }
            }
            OrCircuitEvent::Closed { hop, link_circuit } => {
                if let Some(key) = self.link_circuits.get(&(hop, link_circuit)).copied() {
                    debug!("{} closed by {}", key, hop);
                    self.close_circuit(key, REASON_REQUESTED, now);
                }
            }
        }
    }

    pub(super) fn check_payment_timeouts(&mut self, now: Instant) {
        let late: Vec<(CircuitKey, u8)> = self
            .circuits
            .values()
            .filter(|circuit| !circuit.is_done())
            .filter_map(|circuit| match circuit.payment_channel()?.check_timeouts(now)? {
                ChannelAction::Close { reason } => Some((circuit.key, reason)),
                _ => None,
            })
            .collect();
        for (key, reason) in late {
            warn!("Payments on {} timed out", key);
            self.close_circuit(key, reason, now);
        }
    }

    // Wallet

    /// Periodic wallet upkeep. Returns the requests to send to the bank.
    pub fn maintain_wallet(&mut self, now: Instant, unix_now: u64) -> Vec<BankRequest> {
        let requests = self.wallet.maintain(unix_now);
        self.update_credit_status(now);
        requests
    }

    pub fn on_bank_result(&mut self, result: BankResult, now: Instant, unix_now: u64) {
        let BankResult { request, outcome } = result;
        if outcome.is_ok() && !self.logged_in {
            info!("Logged in to the bank");
            self.logged_in = true;
        }

        match (request, outcome) {
            (BankRequest::Acquire { .. }, Ok(BankResponse::Acquired { tokens, balance })) => {
                let added = self.wallet.on_acquired(tokens, balance, unix_now);
                debug!("Acquired {} tokens, bank balance {}", added, balance);
            }
            (BankRequest::Acquire { .. }, Ok(BankResponse::AcquireRefused { code, balance })) => {
                warn!("Bank refused to issue tokens (code {}), balance {}", code, balance);
                self.wallet.on_acquire_failed(Some(balance), unix_now);
            }
            (BankRequest::Acquire { .. }, Err(err)) => {
                warn!("Token acquisition failed: {}", err);
                self.wallet.on_acquire_failed(None, unix_now);
            }
            (
                BankRequest::Deposit { tokens },
                Ok(BankResponse::Deposited {
                    balance,
                    info,
                    statuses,
                }),
            ) => {
                self.wallet.on_deposit_result(
                    &tokens,
                    &statuses,
                    balance,
                    info,
                    unix_now,
                    &mut rand::thread_rng(),
                );
            }
            (BankRequest::Deposit { .. }, Err(err)) => {
                warn!("Deposit failed: {}", err);
                self.wallet.on_deposit_failed(unix_now);
            }
            (request, Ok(_)) => {
                warn!("Bank answered message type {} with the wrong reply", request.message_type());
            }
        }

        if let Err(err) = self.wallet.save() {
            warn!("Failed to save wallet: {}", err);
        }
        self.update_credit_status(now);
    }

    /// Pause paying applications while the wallet is empty and resume them
    /// as soon as it is not
    fn update_credit_status(&mut self, now: Instant) {
        // until the bank names the interval no token counts
        if !self.settings.payments_enabled || self.wallet.current_interval().is_none() {
            return;
        }
        match self.wallet.credit_status() {
            CreditStatus::Empty => {
                let paying: Vec<AppId> = self
                    .apps
                    .values()
                    .filter(|app| app.config.pays && !app.is_paused())
                    .map(|app| app.id)
                    .collect();
                if !paying.is_empty() {
                    warn!("Out of tokens, pausing {} applications", paying.len());
                }
                for id in paying {
                    self.funds_paused.insert(id);
                    self.pause_application(id, now);
                }
            }
            CreditStatus::Low | CreditStatus::Normal => {
                let resumed: Vec<AppId> = std::mem::take(&mut self.funds_paused).into_iter().collect();
                for id in resumed {
                    self.unpause_application(id);
                }
            }
        }
    }
}

fn parse_link_circuit(text: &str) -> Option<u32> {
    text.split_whitespace().last()?.parse().ok()
}

fn parse_numbers(text: &str) -> Vec<i64> {
    text.split_whitespace().filter_map(|part| part.parse().ok()).collect()
}

/// `<reads> <writes>` from an ADDTOKENS reply
fn parse_levels(text: &str) -> Option<(i64, i64)> {
    match parse_numbers(text).as_slice() {
        [.., reads, writes] => Some((*reads, *writes)),
        _ => None,
    }
}
