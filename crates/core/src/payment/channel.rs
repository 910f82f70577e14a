use super::wire::{self, encode_bank_message, Framer, MerchantToken, PaymentMessage, PaymentOrder};
use super::PaymentError;
use crate::control::TokenLevelsEvent;
use crate::wallet::{Token, Wallet};
use bitmesh_common::{payment, wallet as wallet_limits, Fingerprint};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit close reason for a bad payment message
pub const REASON_REQUESTED: u8 = 3;

/// Circuit close reason for a payment step that took too long
pub const REASON_TIMEOUT: u8 = 10;

/// Something the owner of the channel must do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Send `message` so that it surfaces `hops` hops down the circuit
    Send { hops: u8, message: PaymentMessage },

    /// Credit the tokens granted at setup
    AddStartTokens { read: u64, write: u64 },

    /// Credit tokens whose receipts all came back
    AddTokens { read: u64, write: u64 },

    Close { reason: u8 },

    /// Every hop answered the setup; streams may use the circuit
    Ready,
}

/// Tokens to buy for each hop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refill {
    pub read: u64,
    pub write: u64,
}

impl Refill {
    /// How much to buy so paid plus in-flight bytes stay above the low
    /// watermark. `None` if nothing is needed and `force` is not set.
    ///
    /// Purchases come in whole payment units. The cells a unit covers beyond
    /// what is missing are split evenly when both directions are short (the
    /// odd cell going to reads), or all go to the one direction that is.
    pub fn compute(
        paid_read_bytes: i64,
        paid_write_bytes: i64,
        inflight_read: u64,
        inflight_write: u64,
        force: bool,
    ) -> Option<Self> {
        let bytes_per_cell = payment::BYTES_PER_CELL;
        let low = payment::LOW_PAR_BYTES as i64;
        let shortfall = |paid: i64, inflight: u64| {
            let current = paid.saturating_add((inflight * bytes_per_cell) as i64);
            (low - current).max(0) as u64
        };
        let need_read = shortfall(paid_read_bytes, inflight_read);
        let need_write = shortfall(paid_write_bytes, inflight_write);

        if !force && need_read + need_write == 0 {
            return None;
        }

        let units = 1 + (need_read + need_write + 2 * bytes_per_cell)
            / (bytes_per_cell * payment::CELLS_PER_PAYMENT);
        let mut read = 1 + need_read / bytes_per_cell;
        let mut write = 1 + need_write / bytes_per_cell;
        let leftover = (units * payment::CELLS_PER_PAYMENT).saturating_sub(read + write);

        if force || (need_read > 0 && need_write > 0) {
            read += leftover / 2 + leftover % 2;
            write += leftover / 2;
        } else if need_read > 0 {
            read += leftover;
        } else {
            write += leftover;
        }
        Some(Self { read, write })
    }

    pub fn units(&self) -> u64 {
        (self.read + self.write) / payment::CELLS_PER_PAYMENT
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub setup_done: bool,
    pub paid_read_bytes: i64,
    pub paid_write_bytes: i64,
    pub inflight_read: u64,
    pub inflight_write: u64,
    pub pending_payments: usize,
    pub units_spent: u64,
}

#[derive(Debug)]
struct HopState {
    fingerprint: Fingerprint,
    version: u8,
    setup_done: bool,
    merchant_tokens: VecDeque<MerchantToken>,
    /// Payments waiting for this hop to hand out more merchant tokens
    queued: VecDeque<u32>,
}

#[derive(Debug)]
struct PendingPayment {
    read: u64,
    write: u64,
    units: usize,
    /// Hops whose receipt has not arrived
    awaiting: BTreeSet<usize>,
    /// Our tokens for each hop, emptied once sent
    coins: Vec<Vec<Token>>,
    deadline: Instant,
}

/// Payment state of one circuit we built
#[derive(Debug)]
pub struct PaymentChannel {
    hops: Vec<HopState>,
    /// Circuit id on the link to the first hop, once converted
    link_circuit: Option<u32>,

    setup_started: bool,
    setup_done: bool,
    initial_tokens_added: bool,
    setup_deadline: Option<Instant>,

    /// Requested before setup finished
    queued_read: u64,
    queued_write: u64,

    inflight_read: u64,
    inflight_write: u64,
    paid_read_bytes: i64,
    paid_write_bytes: i64,
    last_reads: i64,
    last_writes: i64,

    next_payment_id: u32,
    payments: HashMap<u32, PendingPayment>,
    framer: Framer,
    units_spent: u64,
}

fn par_timeout() -> Duration {
    Duration::from_secs(payment::PAR_TIMEOUT_SECS)
}

impl PaymentChannel {
    pub fn new(path: Vec<Fingerprint>) -> Self {
        let hops = path
            .into_iter()
            .map(|fingerprint| HopState {
                fingerprint,
                version: payment::PAR_VERSION,
                setup_done: false,
                merchant_tokens: VecDeque::new(),
                queued: VecDeque::new(),
            })
            .collect();
        Self {
            hops,
            link_circuit: None,
            setup_started: false,
            setup_done: false,
            initial_tokens_added: false,
            setup_deadline: None,
            queued_read: 0,
            queued_write: 0,
            inflight_read: 0,
            inflight_write: 0,
            paid_read_bytes: 0,
            paid_write_bytes: 0,
            last_reads: 0,
            last_writes: 0,
            next_payment_id: 0,
            payments: HashMap::new(),
            framer: Framer::new(),
            units_spent: 0,
        }
    }

    pub fn link_circuit(&self) -> Option<u32> {
        self.link_circuit
    }

    pub fn set_link_circuit(&mut self, link_circuit: u32) {
        self.link_circuit = Some(link_circuit);
    }

    pub fn is_setup_started(&self) -> bool {
        self.setup_started
    }

    pub fn is_setup_done(&self) -> bool {
        self.setup_done
    }

    pub fn initial_tokens_added(&self) -> bool {
        self.initial_tokens_added
    }

    pub fn inflight(&self) -> (u64, u64) {
        (self.inflight_read, self.inflight_write)
    }

    pub fn paid_bytes(&self) -> (i64, i64) {
        (self.paid_read_bytes, self.paid_write_bytes)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            setup_done: self.setup_done,
            paid_read_bytes: self.paid_read_bytes,
            paid_write_bytes: self.paid_write_bytes,
            inflight_read: self.inflight_read,
            inflight_write: self.inflight_write,
            pending_payments: self.payments.len(),
            units_spent: self.units_spent,
        }
    }

    /// Send the setup message to every hop. Only the first call does
    /// anything; the start tokens count as in flight until credited.
    pub fn start_setup(&mut self, now: Instant) -> Vec<ChannelAction> {
        if self.setup_started {
            return Vec::new();
        }
        self.setup_started = true;
        self.inflight_read += payment::START_READ_TOKENS;
        self.inflight_write += payment::START_WRITE_TOKENS;
        self.setup_deadline = Some(now + par_timeout());

        (0..self.hops.len())
            .map(|index| ChannelAction::Send {
                hops: (index + 1) as u8,
                message: PaymentMessage::Setup {
                    version: payment::PAR_VERSION,
                },
            })
            .collect()
    }

    /// Pay every hop for `read` and `write` tokens. Before setup is done the
    /// request is queued (and setup started if needed).
    pub fn request_payment(
        &mut self,
        read: u64,
        write: u64,
        wallet: &mut Wallet,
        now: Instant,
        unix_now: u64,
    ) -> Result<Vec<ChannelAction>, PaymentError> {
        let total = read + write;
        let units = total / payment::CELLS_PER_PAYMENT;
        if units == 0
            || total % payment::CELLS_PER_PAYMENT != 0
            || units > payment::MAX_MERCHANT_TOKENS as u64
        {
            return Err(PaymentError::BadAmount(total));
        }

        if !self.setup_done {
            let actions = self.start_setup(now);
            self.queued_read += read;
            self.queued_write += write;
            return Ok(actions);
        }
        Ok(self.pay(read, write, wallet, now, unix_now))
    }

    /// Top the circuit up if it runs low. Does nothing until the link
    /// circuit is known and the start tokens were credited.
    pub fn refill(
        &mut self,
        force: bool,
        wallet: &mut Wallet,
        now: Instant,
        unix_now: u64,
    ) -> Vec<ChannelAction> {
        if self.link_circuit.is_none() || !self.initial_tokens_added {
            return Vec::new();
        }
        let refill = match Refill::compute(
            self.paid_read_bytes,
            self.paid_write_bytes,
            self.inflight_read,
            self.inflight_write,
            force,
        ) {
            Some(refill) => refill,
            None => return Vec::new(),
        };

        debug!(
            "Refill: R={}|{}|{} W={}|{}|{}",
            self.paid_read_bytes / payment::BYTES_PER_CELL as i64,
            self.inflight_read,
            refill.read,
            self.paid_write_bytes / payment::BYTES_PER_CELL as i64,
            self.inflight_write,
            refill.write
        );
        match self.request_payment(refill.read, refill.write, wallet, now, unix_now) {
            Ok(actions) => actions,
            Err(err) => {
                warn!("Refill not sent: {}", err);
                Vec::new()
            }
        }
    }

    fn pay(
        &mut self,
        read: u64,
        write: u64,
        wallet: &mut Wallet,
        now: Instant,
        unix_now: u64,
    ) -> Vec<ChannelAction> {
        let units = ((read + write) / payment::CELLS_PER_PAYMENT) as usize;
        let payment_id = self.next_payment_id;
        self.next_payment_id = self.next_payment_id.wrapping_add(1);
        self.inflight_read += read;
        self.inflight_write += write;

        // all hops or none: an unfunded payment just runs into its deadline
        let mut coins = Vec::with_capacity(self.hops.len());
        for _ in 0..self.hops.len() {
            match wallet.take(units as u64 * wallet_limits::TOKEN_VALUE, unix_now) {
                Ok(tokens) => coins.push(tokens),
                Err(err) => {
                    warn!("Payment {} not sent: {}", payment_id, err);
                    wallet.restore(coins.into_iter().flatten().collect());
                    coins = Vec::new();
                    break;
                }
            }
        }
        let funded = !coins.is_empty();
        coins.resize_with(self.hops.len(), Vec::new);

        self.payments.insert(
            payment_id,
            PendingPayment {
                read,
                write,
                units,
                awaiting: (0..self.hops.len()).collect(),
                coins,
                deadline: now + par_timeout(),
            },
        );
        if !funded {
            return Vec::new();
        }

        let mut actions = Vec::new();
        for index in 0..self.hops.len() {
            if self.hops[index].merchant_tokens.len() >= units {
                actions.extend(self.send_to_hop(index, payment_id));
            } else {
                debug!("Payment {} waits for merchant tokens of hop {}", payment_id, index + 1);
                self.hops[index].queued.push_back(payment_id);
            }
        }
        actions
    }

    fn send_to_hop(&mut self, index: usize, payment_id: u32) -> Option<ChannelAction> {
        let pending = self.payments.get_mut(&payment_id)?;
        let hop = self.hops.get_mut(index)?;
        let coins = std::mem::take(pending.coins.get_mut(index)?);
        if coins.is_empty() {
            return None;
        }

        let merchant: Vec<MerchantToken> = (0..pending.units)
            .filter_map(|_| hop.merchant_tokens.pop_front())
            .collect();
        let units: Vec<(Token, MerchantToken)> = coins.into_iter().zip(merchant).collect();
        self.units_spent += units.len() as u64;

        let order = PaymentOrder {
            version: hop.version,
            read: pending.read as u32,
            write: pending.write as u32,
            payment_id,
            request_ids: units.iter().map(|(_, merchant)| merchant.request_id).collect(),
        };
        Some(ChannelAction::Send {
            hops: 1,
            message: PaymentMessage::BankRelay {
                version: payment::PAR_VERSION,
                hop_index: index as u8,
                bank_message: encode_bank_message(&units),
                order,
            },
        })
    }

    /// Feed one payment cell from the daemon
    pub fn handle_cell(
        &mut self,
        cell: &str,
        wallet: &mut Wallet,
        now: Instant,
        unix_now: u64,
    ) -> Result<Vec<ChannelAction>, PaymentError> {
        let bytes = wire::decode_cell(cell)?;
        match self.framer.push(&bytes)? {
            Some(message) => self.handle_message(message, wallet, now, unix_now),
            None => Ok(Vec::new()),
        }
    }

    pub fn handle_message(
        &mut self,
        message: PaymentMessage,
        wallet: &mut Wallet,
        now: Instant,
        unix_now: u64,
    ) -> Result<Vec<ChannelAction>, PaymentError> {
        match message {
            PaymentMessage::SetupReply { version, hop, tokens } => {
                self.on_setup_reply(version, &hop, tokens, wallet, now, unix_now)
            }
            PaymentMessage::Receipt {
                hop,
                payment_id,
                tokens,
                ..
            } => self.on_receipt(&hop, payment_id, tokens),
            other => Err(PaymentError::Malformed(format!(
                "unexpected {} message",
                other.name()
            ))),
        }
    }

    fn hop_index(&self, fingerprint: &Fingerprint) -> Result<usize, PaymentError> {
        self.hops
            .iter()
            .position(|hop| hop.fingerprint == *fingerprint)
            .ok_or_else(|| PaymentError::UnknownHop(fingerprint.to_hex()))
    }

    fn on_setup_reply(
        &mut self,
        version: u8,
        fingerprint: &Fingerprint,
        tokens: Vec<MerchantToken>,
        wallet: &mut Wallet,
        now: Instant,
        unix_now: u64,
    ) -> Result<Vec<ChannelAction>, PaymentError> {
        let index = self.hop_index(fingerprint)?;
        let hop = &mut self.hops[index];
        hop.version = version.min(payment::PAR_VERSION);
        hop.merchant_tokens.extend(tokens);
        hop.setup_done = true;
        debug!("Setup reply from hop {} ({} merchant tokens)", index + 1, hop.merchant_tokens.len());

        if self.setup_done || !self.hops.iter().all(|hop| hop.setup_done) {
            return Ok(Vec::new());
        }

        info!("Payment setup done for {} hops", self.hops.len());
        self.setup_done = true;
        self.setup_deadline = None;

        let mut actions = vec![ChannelAction::AddStartTokens {
            read: payment::START_READ_TOKENS,
            write: payment::START_WRITE_TOKENS,
        }];
        let read = std::mem::take(&mut self.queued_read);
        let write = std::mem::take(&mut self.queued_write);
        if read + write > 0 {
            actions.extend(self.pay(read, write, wallet, now, unix_now));
        }
        actions.push(ChannelAction::Ready);
        Ok(actions)
    }

    fn on_receipt(
        &mut self,
        fingerprint: &Fingerprint,
        payment_id: u32,
        tokens: Vec<MerchantToken>,
    ) -> Result<Vec<ChannelAction>, PaymentError> {
        let index = self.hop_index(fingerprint)?;
        let pending = self
            .payments
            .get_mut(&payment_id)
            .ok_or(PaymentError::UnknownPayment(payment_id))?;
        if !pending.awaiting.remove(&index) {
            return Err(PaymentError::UnknownPayment(payment_id));
        }
        let finished = pending.awaiting.is_empty();
        let (read, write) = (pending.read, pending.write);

        self.hops[index].merchant_tokens.extend(tokens);
        let mut actions = self.flush_queued(index);

        if finished {
            self.payments.remove(&payment_id);
            debug!("All receipts in for payment {}", payment_id);
            actions.push(ChannelAction::AddTokens { read, write });
        }
        Ok(actions)
    }

    /// Send payments that were waiting on merchant tokens from hop `index`
    fn flush_queued(&mut self, index: usize) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        while let Some(&payment_id) = self.hops[index].queued.front() {
            let units = match self.payments.get(&payment_id) {
                Some(pending) => pending.units,
                None => {
                    self.hops[index].queued.pop_front();
                    continue;
                }
            };
            if self.hops[index].merchant_tokens.len() < units {
                break;
            }
            self.hops[index].queued.pop_front();
            actions.extend(self.send_to_hop(index, payment_id));
        }
        actions
    }

    /// The daemon credited the start tokens. `reads`/`writes` are its new
    /// bucket levels.
    pub fn on_start_tokens_added(&mut self, reads: i64, writes: i64) {
        self.initial_tokens_added = true;
        self.inflight_read = self.inflight_read.saturating_sub(payment::START_READ_TOKENS);
        self.inflight_write = self.inflight_write.saturating_sub(payment::START_WRITE_TOKENS);
        self.set_levels(reads, writes);
    }

    pub fn on_tokens_added(&mut self, read: u64, write: u64, reads: i64, writes: i64) {
        self.inflight_read = self.inflight_read.saturating_sub(read);
        self.inflight_write = self.inflight_write.saturating_sub(write);
        self.set_levels(reads, writes);
        debug!(
            "Circuit now has R={:.2}MB W={:.2}MB",
            self.paid_read_bytes as f64 / (1024.0 * 1024.0),
            self.paid_write_bytes as f64 / (1024.0 * 1024.0)
        );
    }

    /// Apply a bucket report. Returns the bytes read and written since the
    /// previous report.
    pub fn on_token_levels(&mut self, levels: &TokenLevelsEvent) -> (i64, i64) {
        let bytes_per_cell = payment::BYTES_PER_CELL as i64;
        let read = bytes_per_cell * (self.last_reads - (levels.reads - levels.reads_added));
        let written = bytes_per_cell * (self.last_writes - (levels.writes - levels.writes_added));
        self.last_reads = levels.reads;
        self.last_writes = levels.writes;
        self.set_levels(levels.reads, levels.writes);
        (read, written)
    }

    fn set_levels(&mut self, reads: i64, writes: i64) {
        let bytes_per_cell = payment::BYTES_PER_CELL as i64;
        self.paid_read_bytes = reads.saturating_mul(bytes_per_cell);
        self.paid_write_bytes = writes.saturating_mul(bytes_per_cell);
    }

    /// `Close` once the setup or any payment has been waiting too long
    pub fn check_timeouts(&self, now: Instant) -> Option<ChannelAction> {
        let setup_late = !self.setup_done
            && self.setup_deadline.map(|deadline| now >= deadline).unwrap_or(false);
        let payment_late = self.payments.values().any(|pending| now >= pending.deadline);
        (setup_late || payment_late).then_some(ChannelAction::Close {
            reason: REASON_TIMEOUT,
        })
    }

    /// Tokens taken for payments that never went out
    pub fn take_unsent_coins(&mut self) -> Vec<Token> {
        self.payments
            .values_mut()
            .flat_map(|pending| pending.coins.iter_mut().flat_map(std::mem::take))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{generate_bank_key, IntervalInfo};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const CPP: u64 = payment::CELLS_PER_PAYMENT;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from([byte; 20])
    }

    fn funded_wallet(count: usize) -> Wallet {
        let key = generate_bank_key();
        let mut wallet = Wallet::new(Some(key.verifying_key()));
        wallet.on_new_info(
            IntervalInfo {
                current: 1,
                expires_current: 10_000,
                expires_next: 20_000,
            },
            &mut StdRng::seed_from_u64(3),
        );
        for _ in 0..count {
            wallet.add(Token::issue(&key, 1, 1)).unwrap();
        }
        wallet
    }

    fn merchant_tokens(hop: u8, count: u32) -> Vec<MerchantToken> {
        (0..count)
            .map(|id| MerchantToken {
                request_id: u32::from(hop) * 100 + id,
                slot: [hop; 32],
            })
            .collect()
    }

    fn setup_reply(hop: u8, count: u32) -> PaymentMessage {
        PaymentMessage::SetupReply {
            version: payment::PAR_VERSION,
            hop: fp(hop),
            tokens: merchant_tokens(hop, count),
        }
    }

    fn receipt(hop: u8, payment_id: u32) -> PaymentMessage {
        PaymentMessage::Receipt {
            version: payment::PAR_VERSION,
            hop: fp(hop),
            payment_id,
            tokens: merchant_tokens(hop, 1),
        }
    }

    /// Channel through setup with the start tokens credited
    fn ready_channel(wallet: &mut Wallet, now: Instant) -> PaymentChannel {
        let mut channel = PaymentChannel::new(vec![fp(1), fp(2)]);
        channel.set_link_circuit(40);
        channel.start_setup(now);
        channel.handle_message(setup_reply(1, 2), wallet, now, 0).unwrap();
        channel.handle_message(setup_reply(2, 2), wallet, now, 0).unwrap();
        channel.on_start_tokens_added(CPP as i64 / 2, CPP as i64 / 2);
        channel
    }

    #[test]
    fn test_refill_both_directions_short() {
        let refill = Refill::compute(0, 0, 0, 0, false).unwrap();
        assert_eq!(refill, Refill { read: 5120, write: 5120 });
        assert_eq!(refill.units(), 1);
    }

    #[test]
    fn test_refill_one_direction_short() {
        let low = payment::LOW_PAR_BYTES as i64;
        let refill = Refill::compute(0, low, 0, 0, false).unwrap();
        assert_eq!(refill, Refill { read: CPP - 1, write: 1 });

        let refill = Refill::compute(low, low - 1, 0, 0, false).unwrap();
        assert_eq!(refill, Refill { read: 1, write: CPP - 1 });
    }

    #[test]
    fn test_refill_counts_inflight_and_force() {
        let low = payment::LOW_PAR_BYTES as i64;
        assert_eq!(Refill::compute(low, low, 0, 0, false), None);
        // in-flight tokens cover the shortfall
        assert_eq!(Refill::compute(0, 0, 2048, 2048, false), None);

        let forced = Refill::compute(low, low, 0, 0, true).unwrap();
        assert_eq!(forced, Refill { read: 5120, write: 5120 });
    }

    #[test]
    fn test_setup_sends_to_every_hop_once() {
        let now = Instant::now();
        let mut channel = PaymentChannel::new(vec![fp(1), fp(2), fp(3)]);
        let actions = channel.start_setup(now);
        let hops: Vec<u8> = actions
            .iter()
            .map(|action| match action {
                ChannelAction::Send { hops, .. } => *hops,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(hops, vec![1, 2, 3]);
        assert_eq!(channel.inflight(), (payment::START_READ_TOKENS, payment::START_WRITE_TOKENS));
        assert!(channel.start_setup(now).is_empty());
    }

    #[test]
    fn test_setup_completion_queues_and_credits() {
        let now = Instant::now();
        let mut wallet = funded_wallet(10);
        let mut channel = PaymentChannel::new(vec![fp(1), fp(2)]);

        // a request before setup starts the setup and waits
        let actions = channel.request_payment(CPP / 2, CPP / 2, &mut wallet, now, 0).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(channel.is_setup_started());

        assert!(channel.handle_message(setup_reply(1, 2), &mut wallet, now, 0).unwrap().is_empty());
        let actions = channel.handle_message(setup_reply(2, 2), &mut wallet, now, 0).unwrap();

        assert_eq!(
            actions.first(),
            Some(&ChannelAction::AddStartTokens {
                read: payment::START_READ_TOKENS,
                write: payment::START_WRITE_TOKENS
            })
        );
        assert_eq!(actions.last(), Some(&ChannelAction::Ready));
        // the queued request went out to both hops through the first one
        let relays = actions
            .iter()
            .filter(|action| matches!(action, ChannelAction::Send { hops: 1, message: PaymentMessage::BankRelay { .. } }))
            .count();
        assert_eq!(relays, 2);
        assert_eq!(wallet.balance(), 8);
        assert_eq!(channel.inflight(), (CPP, CPP));

        channel.on_start_tokens_added(CPP as i64 / 2, CPP as i64 / 2);
        assert!(channel.initial_tokens_added());
        assert_eq!(channel.inflight(), (CPP / 2, CPP / 2));
        assert_eq!(
            channel.paid_bytes().0,
            (CPP / 2 * payment::BYTES_PER_CELL) as i64
        );
    }

    #[test]
    fn test_refill_waits_for_start_tokens() {
        let now = Instant::now();
        let mut wallet = funded_wallet(10);
        let mut channel = PaymentChannel::new(vec![fp(1), fp(2)]);
        channel.set_link_circuit(40);
        channel.start_setup(now);
        channel.handle_message(setup_reply(1, 2), &mut wallet, now, 0).unwrap();
        channel.handle_message(setup_reply(2, 2), &mut wallet, now, 0).unwrap();

        assert!(channel.refill(true, &mut wallet, now, 0).is_empty());
        assert_eq!(wallet.balance(), 10);

        channel.on_start_tokens_added(0, 0);
        assert!(!channel.refill(true, &mut wallet, now, 0).is_empty());
        assert_eq!(wallet.balance(), 8);
    }

    #[test]
    fn test_receipts_credit_tokens() {
        let now = Instant::now();
        let mut wallet = funded_wallet(10);
        let mut channel = ready_channel(&mut wallet, now);

        let actions = channel.refill(true, &mut wallet, now, 0);
        assert_eq!(actions.len(), 2);
        let inflight = channel.inflight();

        assert!(channel.handle_message(receipt(1, 0), &mut wallet, now, 0).unwrap().is_empty());
        // the same hop cannot answer twice
        assert_eq!(
            channel.handle_message(receipt(1, 0), &mut wallet, now, 0),
            Err(PaymentError::UnknownPayment(0))
        );
        let actions = channel.handle_message(receipt(2, 0), &mut wallet, now, 0).unwrap();
        assert_eq!(actions, vec![ChannelAction::AddTokens { read: 5120, write: 5120 }]);

        channel.on_tokens_added(5120, 5120, 9000, 9000);
        assert_eq!(channel.inflight(), (inflight.0 - 5120, inflight.1 - 5120));
        assert_eq!(channel.paid_bytes(), (9000 * 499, 9000 * 499));
        assert!(channel.check_timeouts(now + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_payment_waits_for_merchant_tokens() {
        let now = Instant::now();
        let mut wallet = funded_wallet(10);
        let mut channel = PaymentChannel::new(vec![fp(1)]);
        channel.set_link_circuit(1);
        channel.start_setup(now);
        channel.handle_message(setup_reply(1, 1), &mut wallet, now, 0).unwrap();
        channel.on_start_tokens_added(0, 0);

        assert_eq!(channel.refill(true, &mut wallet, now, 0).len(), 1);
        // hop 1 has no merchant tokens left, the second payment is held
        assert!(channel.refill(true, &mut wallet, now, 0).is_empty());
        assert_eq!(wallet.balance(), 8);

        let actions = channel.handle_message(receipt(1, 0), &mut wallet, now, 0).unwrap();
        assert!(matches!(actions[0], ChannelAction::Send { hops: 1, .. }));
        assert_eq!(actions[1], ChannelAction::AddTokens { read: 5120, write: 5120 });
    }

    #[test]
    fn test_unfunded_payment_times_out() {
        let now = Instant::now();
        let mut wallet = funded_wallet(1);
        let mut channel = ready_channel(&mut wallet, now);

        assert!(channel.refill(true, &mut wallet, now, 0).is_empty());
        // nothing is lost when one hop cannot be paid
        assert_eq!(wallet.balance(), 1);
        assert_eq!(channel.check_timeouts(now), None);
        assert_eq!(
            channel.check_timeouts(now + Duration::from_secs(31)),
            Some(ChannelAction::Close { reason: REASON_TIMEOUT })
        );
    }

    #[test]
    fn test_setup_timeout_and_bad_messages() {
        let now = Instant::now();
        let mut wallet = funded_wallet(0);
        let mut channel = PaymentChannel::new(vec![fp(1)]);
        assert_eq!(channel.check_timeouts(now + Duration::from_secs(100)), None);

        channel.start_setup(now);
        assert_eq!(
            channel.check_timeouts(now + Duration::from_secs(30)),
            Some(ChannelAction::Close { reason: REASON_TIMEOUT })
        );

        assert!(matches!(
            channel.handle_message(setup_reply(7, 1), &mut wallet, now, 0),
            Err(PaymentError::UnknownHop(_))
        ));
        assert!(matches!(
            channel.handle_message(PaymentMessage::Setup { version: 1 }, &mut wallet, now, 0),
            Err(PaymentError::Malformed(_))
        ));
        assert_eq!(
            channel.request_payment(100, 0, &mut wallet, now, 0),
            Err(PaymentError::BadAmount(100))
        );
    }

    #[test]
    fn test_token_levels_report_traffic() {
        let now = Instant::now();
        let mut wallet = funded_wallet(0);
        let mut channel = ready_channel(&mut wallet, now);

        let levels = TokenLevelsEvent {
            circuit: crate::circuit::CircuitId(1),
            reads: 100,
            writes: 50,
            reads_added: 0,
            writes_added: 0,
        };
        channel.on_token_levels(&levels);
        let traffic = channel.on_token_levels(&TokenLevelsEvent {
            reads: 90,
            writes: 60,
            writes_added: 20,
            ..levels
        });
        assert_eq!(traffic, (10 * 499, 10 * 499));
        assert_eq!(channel.paid_bytes(), (90 * 499, 60 * 499));
    }

    #[test]
    fn test_cells_feed_the_framer() {
        let now = Instant::now();
        let mut wallet = funded_wallet(0);
        let mut channel = PaymentChannel::new(vec![fp(1)]);
        channel.start_setup(now);

        let frame = setup_reply(1, 4).encode();
        let cells = wire::to_cells(&frame);
        let actions = channel.handle_cell(&cells[0], &mut wallet, now, 0).unwrap();
        assert_eq!(actions.last(), Some(&ChannelAction::Ready));
        assert!(channel.handle_cell("%%%", &mut wallet, now, 0).is_err());
    }
}
