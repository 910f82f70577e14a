use super::token::Token;
use super::WalletError;
use crate::bank::{Backoff, BankRequest, DepositStatus};
use bitmesh_common::wallet as limits;
use ed25519_dalek::VerifyingKey;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Interval schedule announced by the bank. Times are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalInfo {
    pub current: u32,
    pub expires_current: u64,
    pub expires_next: u64,
}

/// How much spending power is left
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CreditStatus {
    Empty,
    Low,
    Normal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WalletStats {
    pub balance: u64,
    pub depositing: u64,
    pub bank_balance: Option<u64>,
    pub interval: Option<u32>,
    pub spent: u64,
    pub acquired: u64,
    pub deposited: u64,
}

#[derive(Debug)]
pub struct Wallet {
    tokens: BTreeMap<u32, HashSet<Token>>,
    depositing: Vec<Token>,
    data_dir: Option<PathBuf>,
    bank_key: Option<VerifyingKey>,

    interval: Option<IntervalInfo>,
    /// Previous-interval tokens are not spent after this
    send_old_cutoff: Option<u64>,
    /// Previous-interval tokens start going back to the bank after this
    begin_deposit_at: Option<u64>,
    /// Extra wait past expiry before asking the bank for the new interval
    learning_delay: u64,

    bank_balance: Option<u64>,
    bank_balance_at: u64,

    acquire_in_progress: bool,
    deposit_in_progress: bool,
    deposit_backoff: Backoff,
    next_deposit_at: u64,

    spent: u64,
    acquired: u64,
    deposited: u64,
}

impl Wallet {
    pub fn new(bank_key: Option<VerifyingKey>) -> Self {
        Self {
            tokens: BTreeMap::new(),
            depositing: Vec::new(),
            data_dir: None,
            bank_key,
            interval: None,
            send_old_cutoff: None,
            begin_deposit_at: None,
            learning_delay: 0,
            bank_balance: None,
            bank_balance_at: 0,
            acquire_in_progress: false,
            deposit_in_progress: false,
            deposit_backoff: Backoff::default(),
            next_deposit_at: 0,
            spent: 0,
            acquired: 0,
            deposited: 0,
        }
    }

    /// Open the wallet stored in `dir`, creating nothing until the first save
    pub fn open(dir: impl Into<PathBuf>, bank_key: Option<VerifyingKey>) -> Result<Self, WalletError> {
        let dir = dir.into();
        let mut wallet = Self::new(bank_key);

        for token in read_records(&dir.join(limits::TOKENS_FILE))? {
            wallet.insert_unchecked(token);
        }
        wallet.depositing = read_records(&dir.join(limits::DEPOSITING_FILE))?;
        wallet.data_dir = Some(dir);

        info!(
            "Wallet loaded: {} spendable, {} being deposited",
            wallet.balance(),
            wallet.depositing.len()
        );
        Ok(wallet)
    }

    pub fn save(&self) -> Result<(), WalletError> {
        let dir = match &self.data_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        fs::create_dir_all(dir)?;
        let unspent: Vec<&Token> = self.tokens.values().flatten().collect();
        write_records(&dir.join(limits::TOKENS_FILE), unspent)?;
        write_records(&dir.join(limits::DEPOSITING_FILE), self.depositing.iter())?;
        debug!("Wallet saved to {}", dir.display());
        Ok(())
    }

    pub fn current_interval(&self) -> Option<u32> {
        self.interval.map(|info| info.current)
    }

    pub fn interval_info(&self) -> Option<IntervalInfo> {
        self.interval
    }

    pub fn bank_balance(&self) -> Option<u64> {
        self.bank_balance
    }

    /// Spendable value: tokens of the current and previous interval
    pub fn balance(&self) -> u64 {
        self.tokens
            .iter()
            .filter(|(interval, _)| self.is_spendable_interval(**interval))
            .flat_map(|(_, tokens)| tokens.iter())
            .map(|token| u64::from(token.value))
            .sum()
    }

    pub fn credit_status(&self) -> CreditStatus {
        match self.balance() {
            0 => CreditStatus::Empty,
            b if b <= limits::MIN_FUNCTIONAL_MONEY => CreditStatus::Low,
            _ => CreditStatus::Normal,
        }
    }

    pub fn stats(&self) -> WalletStats {
        WalletStats {
            balance: self.balance(),
            depositing: self.depositing.iter().map(|t| u64::from(t.value)).sum(),
            bank_balance: self.bank_balance,
            interval: self.current_interval(),
            spent: self.spent,
            acquired: self.acquired,
            deposited: self.deposited,
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquire_in_progress
    }

    pub fn is_depositing(&self) -> bool {
        self.deposit_in_progress
    }

    pub fn depositing(&self) -> &[Token] {
        &self.depositing
    }

    /// Nothing is spendable until the bank has told us the current interval
    fn is_spendable_interval(&self, interval: u32) -> bool {
        match self.current_interval() {
            Some(current) => interval == current || interval.checked_add(1) == Some(current),
            None => false,
        }
    }

    fn insert_unchecked(&mut self, token: Token) -> bool {
        self.tokens.entry(token.interval).or_default().insert(token)
    }

    fn contains(&self, token: &Token) -> bool {
        self.tokens
            .get(&token.interval)
            .map(|set| set.contains(token))
            .unwrap_or(false)
            || self.depositing.contains(token)
    }

    /// Store a token. A token already held (unspent or depositing) is refused.
    pub fn add(&mut self, token: Token) -> Result<(), WalletError> {
        if let Some(key) = &self.bank_key {
            if !token.verify(key) {
                return Err(WalletError::InvalidToken(token.short_id()));
            }
        }
        if self.contains(&token) {
            return Err(WalletError::DuplicateToken(token.short_id()));
        }
        self.insert_unchecked(token);
        Ok(())
    }

    /// Put back tokens taken for a payment that was never sent
    pub fn restore(&mut self, tokens: Vec<Token>) {
        for token in tokens {
            let value = u64::from(token.value);
            if self.insert_unchecked(token) {
                self.spent = self.spent.saturating_sub(value);
            }
        }
    }

    /// Remove tokens worth exactly `value`, oldest interval first. Nothing
    /// is removed unless the full amount can be met.
    pub fn take(&mut self, value: u64, now: u64) -> Result<Vec<Token>, WalletError> {
        let current = self.current_interval();
        let skip_previous = self.send_old_cutoff.map(|cutoff| now >= cutoff).unwrap_or(false);

        let mut chosen = Vec::new();
        let mut total = 0u64;
        'outer: for (interval, tokens) in &self.tokens {
            if !self.is_spendable_interval(*interval) {
                continue;
            }
            if skip_previous && Some(*interval) != current {
                continue;
            }
            for token in tokens {
                if total == value {
                    break 'outer;
                }
                let worth = u64::from(token.value);
                if total + worth <= value {
                    total += worth;
                    chosen.push(token.clone());
                }
            }
        }

        if total != value {
            return Err(WalletError::InsufficientFunds {
                needed: value,
                available: self.balance(),
            });
        }

        for token in &chosen {
            if let Some(set) = self.tokens.get_mut(&token.interval) {
                set.remove(token);
            }
        }
        self.tokens.retain(|_, set| !set.is_empty());
        self.spent += value;
        Ok(chosen)
    }

    /// Apply a new interval schedule from the bank
    pub fn on_new_info<R: Rng + ?Sized>(&mut self, info: IntervalInfo, rng: &mut R) {
        let advanced = self
            .current_interval()
            .map(|current| info.current > current)
            .unwrap_or(true);
        if !advanced {
            return;
        }

        let oldest_kept = info.current.saturating_sub(1);
        let stale: u64 = self
            .tokens
            .range(..oldest_kept)
            .flat_map(|(_, set)| set.iter())
            .map(|token| u64::from(token.value))
            .sum();
        self.tokens.retain(|interval, _| *interval >= oldest_kept);
        if stale > 0 {
            warn!("Dropped {} expired tokens", stale);
        }

        let length = info.expires_next.saturating_sub(info.expires_current) as f64;
        let expiry = info.expires_current as f64;
        self.send_old_cutoff = Some((expiry - 0.1 * length).max(0.0) as u64);
        self.begin_deposit_at =
            Some((expiry - 0.1 * length - rng.gen::<f64>() * 0.3 * length).max(0.0) as u64);
        self.learning_delay = (rng.gen::<f64>() * 0.25 * length) as u64;
        self.interval = Some(info);

        info!("Bank interval is now {}", info.current);
    }

    /// Decide what to ask the bank for. At most one acquisition and one
    /// deposit are outstanding at a time.
    pub fn maintain(&mut self, now: u64) -> Vec<BankRequest> {
        let mut requests = Vec::new();

        if self.bank_balance.is_some()
            && now.saturating_sub(self.bank_balance_at) > limits::BALANCE_POLL_SECS
            && self.bank_balance == Some(0)
        {
            self.bank_balance = None;
        }

        // acquisitions wait until the interval is known
        if self.interval.is_some()
            && self.balance() < limits::LOW_WATERMARK
            && !self.acquire_in_progress
        {
            let count = match self.bank_balance {
                Some(available) => limits::BATCH_SIZE.min(available),
                None => limits::BATCH_SIZE,
            };
            if count > 0 {
                self.acquire_in_progress = true;
                requests.push(BankRequest::Acquire { count: count as u32 });
            }
        }

        if self.deposit_in_progress || now < self.next_deposit_at {
            return requests;
        }

        if let (Some(info), Some(begin)) = (self.interval, self.begin_deposit_at) {
            if now >= begin {
                let previous = info.current.saturating_sub(1);
                if previous != info.current {
                    self.move_to_depositing(previous, limits::BATCH_SIZE);
                }
            }
        }

        if self.balance() > limits::HIGH_WATERMARK {
            if let Ok(surplus) = self.take(limits::BATCH_SIZE, now) {
                self.spent -= limits::BATCH_SIZE;
                self.depositing.extend(surplus);
            }
        }

        // an empty deposit is also how a fresh or reloaded wallet logs in
        let learn_interval = match self.interval {
            Some(info) => now > info.expires_current + self.learning_delay,
            None => true,
        };

        if !self.depositing.is_empty() || learn_interval {
            self.deposit_in_progress = true;
            requests.push(BankRequest::Deposit {
                tokens: self.depositing.clone(),
            });
        }

        requests
    }

    fn move_to_depositing(&mut self, interval: u32, limit: u64) {
        let Some(set) = self.tokens.get_mut(&interval) else {
            return;
        };
        let moving: Vec<Token> = set.iter().take(limit as usize).cloned().collect();
        for token in &moving {
            set.remove(token);
        }
        if set.is_empty() {
            self.tokens.remove(&interval);
        }
        self.depositing.extend(moving);
    }

    /// Tokens arrived from an acquisition. Returns how many were stored.
    pub fn on_acquired(&mut self, tokens: Vec<Token>, bank_balance: u64, now: u64) -> usize {
        self.acquire_in_progress = false;
        self.bank_balance = Some(bank_balance);
        self.bank_balance_at = now;

        let mut added = 0;
        for token in tokens {
            let value = u64::from(token.value);
            match self.add(token) {
                Ok(()) => {
                    added += 1;
                    self.acquired += value;
                }
                Err(err) => warn!("Rejected acquired token: {}", err),
            }
        }
        info!("Acquired {} tokens, bank balance {}", added, bank_balance);
        added
    }

    /// The bank refused or never answered the acquisition
    pub fn on_acquire_failed(&mut self, bank_balance: Option<u64>, now: u64) {
        self.acquire_in_progress = false;
        if let Some(balance) = bank_balance {
            self.bank_balance = Some(balance);
            self.bank_balance_at = now;
        }
    }

    /// The bank answered a deposit. Every token it reported on is gone from
    /// the depositing set, whatever its status.
    pub fn on_deposit_result(
        &mut self,
        sent: &[Token],
        statuses: &[DepositStatus],
        bank_balance: u64,
        info: IntervalInfo,
        now: u64,
        rng: &mut (impl Rng + ?Sized),
    ) {
        self.deposit_in_progress = false;
        self.deposit_backoff.reset();
        self.next_deposit_at = 0;
        self.bank_balance = Some(bank_balance);
        self.bank_balance_at = now;

        for (token, status) in sent.iter().zip(statuses) {
            match status {
                DepositStatus::Accepted => self.deposited += u64::from(token.value),
                other => warn!("Deposit of token {} refused: {:?}", token.short_id(), other),
            }
            self.depositing.retain(|held| held != token);
        }

        self.on_new_info(info, rng);
    }

    /// The deposit never reached the bank. The tokens stay queued.
    pub fn on_deposit_failed(&mut self, now: u64) {
        self.deposit_in_progress = false;
        let delay = self.deposit_backoff.next_delay();
        self.next_deposit_at = now + delay.as_secs();
        warn!("Deposit failed, retrying in {}s", delay.as_secs());
    }
}

fn read_records(path: &Path) -> Result<Vec<Token>, WalletError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut tokens = Vec::new();
    let mut rest = bytes.as_slice();
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(WalletError::Corrupt(format!("truncated length in {}", path.display())));
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return Err(WalletError::Corrupt(format!("truncated token in {}", path.display())));
        }
        tokens.push(Token::from_bytes(&rest[..len])?);
        rest = &rest[len..];
    }
    Ok(tokens)
}

/// Write to `<path>.new`, then rename over `path`
fn write_records<'a, I>(path: &Path, tokens: I) -> Result<(), WalletError>
where
    I: IntoIterator<Item = &'a Token>,
{
    let mut staging = path.as_os_str().to_owned();
    staging.push(".new");
    let staging = PathBuf::from(staging);

    {
        let mut file = fs::File::create(&staging)?;
        for token in tokens {
            let bytes = token.to_bytes();
            file.write_all(&(bytes.len() as u16).to_be_bytes())?;
            file.write_all(&bytes)?;
        }
        file.sync_all()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::generate_bank_key;
    use ed25519_dalek::SigningKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn info(current: u32) -> IntervalInfo {
        IntervalInfo {
            current,
            expires_current: 10_000,
            expires_next: 20_000,
        }
    }

    fn funded(key: &SigningKey, interval: u32, count: usize) -> Wallet {
        let mut wallet = Wallet::new(Some(key.verifying_key()));
        wallet.on_new_info(info(interval), &mut StdRng::seed_from_u64(1));
        for _ in 0..count {
            wallet.add(Token::issue(key, interval, 1)).unwrap();
        }
        wallet
    }

    #[test]
    fn test_take_exact_or_nothing() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 3);

        let taken = wallet.take(2, 0).unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(wallet.balance(), 1);

        let err = wallet.take(2, 0).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { needed: 2, available: 1 }));
        assert_eq!(wallet.balance(), 1);
        assert_eq!(wallet.stats().spent, 2);

        wallet.restore(taken);
        assert_eq!(wallet.balance(), 3);
        assert_eq!(wallet.stats().spent, 0);
    }

    #[test]
    fn test_take_never_overshoots() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 0);
        wallet.add(Token::issue(&key, 5, 3)).unwrap();
        wallet.add(Token::issue(&key, 5, 1)).unwrap();

        let taken = wallet.take(1, 0).unwrap();
        assert_eq!(taken.iter().map(|t| t.value).sum::<u32>(), 1);
        assert!(wallet.take(2, 0).is_err());
        assert_eq!(wallet.take(3, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_take_oldest_first_and_cutoff() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 0);
        let old = Token::issue(&key, 4, 1);
        wallet.add(old.clone()).unwrap();
        wallet.add(Token::issue(&key, 5, 1)).unwrap();

        let cutoff = wallet.send_old_cutoff.unwrap();
        assert_eq!(cutoff, 9_000);

        // after the cutoff the previous interval is left for depositing
        let taken = wallet.take(1, cutoff).unwrap();
        assert_eq!(taken[0].interval, 5);

        assert!(wallet.take(1, cutoff).is_err());
        assert_eq!(wallet.take(1, 0).unwrap(), vec![old]);
    }

    #[test]
    fn test_duplicate_and_forged_tokens() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 0);
        let token = Token::issue(&key, 5, 1);
        wallet.add(token.clone()).unwrap();
        assert!(matches!(wallet.add(token), Err(WalletError::DuplicateToken(_))));

        let forged = Token::issue(&generate_bank_key(), 5, 1);
        assert!(matches!(wallet.add(forged), Err(WalletError::InvalidToken(_))));
    }

    #[test]
    fn test_new_interval_drops_stale_tokens() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 2);
        wallet.add(Token::issue(&key, 4, 1)).unwrap();
        assert_eq!(wallet.balance(), 3);

        let mut rng = StdRng::seed_from_u64(2);
        wallet.on_new_info(info(6), &mut rng);
        assert_eq!(wallet.balance(), 2);
        assert_eq!(wallet.current_interval(), Some(6));

        // an older schedule is ignored
        wallet.on_new_info(info(5), &mut rng);
        assert_eq!(wallet.current_interval(), Some(6));

        let begin = wallet.begin_deposit_at.unwrap();
        assert!((6_000..=9_000).contains(&begin));
        assert!(wallet.learning_delay <= 2_500);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_bank_key();

        let mut wallet = Wallet::open(dir.path(), Some(key.verifying_key())).unwrap();
        wallet.on_new_info(info(5), &mut StdRng::seed_from_u64(3));
        for interval in [3u32, 4, 5, 5] {
            wallet.insert_unchecked(Token::issue(&key, interval, 1));
        }
        wallet.depositing.push(Token::issue(&key, 4, 1));
        wallet.save().unwrap();
        assert!(!dir.path().join("tokens.bin.new").exists());

        let mut loaded = Wallet::open(dir.path(), Some(key.verifying_key())).unwrap();
        assert_eq!(loaded.depositing().len(), 1);
        loaded.on_new_info(info(5), &mut StdRng::seed_from_u64(3));
        // the interval 3 token is stale and dropped
        assert_eq!(loaded.balance(), 3);
        assert_eq!(loaded.tokens.keys().copied().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_reloaded_wallet_spends_nothing_until_interval_known() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_bank_key();

        let mut wallet = Wallet::open(dir.path(), Some(key.verifying_key())).unwrap();
        wallet.on_new_info(info(3), &mut StdRng::seed_from_u64(5));
        for _ in 0..25 {
            wallet.add(Token::issue(&key, 3, 1)).unwrap();
        }
        wallet.save().unwrap();

        let mut loaded = Wallet::open(dir.path(), Some(key.verifying_key())).unwrap();
        assert_eq!(loaded.current_interval(), None);
        assert_eq!(loaded.balance(), 0);
        assert!(matches!(loaded.take(1, 0), Err(WalletError::InsufficientFunds { .. })));

        // the first maintenance pass asks the bank for the schedule
        assert_eq!(loaded.maintain(0), vec![BankRequest::Deposit { tokens: vec![] }]);
        assert!(loaded.maintain(1).is_empty());

        // meanwhile the bank moved two intervals on
        loaded.on_deposit_result(&[], &[], 40, info(5), 2, &mut StdRng::seed_from_u64(6));
        assert_eq!(loaded.current_interval(), Some(5));
        assert!(loaded.tokens.is_empty());
        assert_eq!(loaded.balance(), 0);
        assert!(loaded.take(1, 0).is_err());
    }

    #[test]
    fn test_previous_interval_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_bank_key();

        let mut wallet = funded(&key, 4, 0);
        wallet.data_dir = Some(dir.path().to_path_buf());
        for _ in 0..3 {
            wallet.add(Token::issue(&key, 4, 1)).unwrap();
        }
        wallet.save().unwrap();

        let mut loaded = Wallet::open(dir.path(), Some(key.verifying_key())).unwrap();
        loaded.on_new_info(info(5), &mut StdRng::seed_from_u64(7));
        assert_eq!(loaded.balance(), 3);
        assert_eq!(loaded.take(1, 0).unwrap()[0].interval, 4);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(limits::TOKENS_FILE), [0u8, 50, 1, 2]).unwrap();
        assert!(matches!(Wallet::open(dir.path(), None), Err(WalletError::Corrupt(_))));
    }

    #[test]
    fn test_maintenance_acquires_once() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 0);

        let requests = wallet.maintain(0);
        assert_eq!(requests, vec![BankRequest::Acquire { count: 30 }]);
        assert!(wallet.maintain(1).is_empty());

        let tokens: Vec<Token> = (0..30).map(|_| Token::issue(&key, 5, 1)).collect();
        assert_eq!(wallet.on_acquired(tokens, 70, 2), 30);
        assert_eq!(wallet.balance(), 30);
        assert_eq!(wallet.tokens.len(), 1);
        assert!(wallet.maintain(3).is_empty());
    }

    #[test]
    fn test_acquire_capped_by_known_bank_balance() {
        let mut wallet = funded(&generate_bank_key(), 5, 0);
        wallet.on_acquire_failed(Some(12), 0);
        assert_eq!(wallet.maintain(1), vec![BankRequest::Acquire { count: 12 }]);

        let mut broke = funded(&generate_bank_key(), 5, 0);
        broke.on_acquire_failed(Some(0), 0);
        assert!(broke.maintain(1).is_empty());
        // the balance is asked again after a while
        let later = limits::BALANCE_POLL_SECS + 5;
        assert_eq!(broke.maintain(later), vec![BankRequest::Acquire { count: 30 }]);
    }

    #[test]
    fn test_surplus_is_deposited() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 101);
        let requests = wallet.maintain(0);
        match requests.as_slice() {
            [BankRequest::Deposit { tokens }] => assert_eq!(tokens.len(), 30),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(wallet.balance(), 71);
        assert!(wallet.is_depositing());
        assert!(wallet.maintain(1).is_empty());
    }

    #[test]
    fn test_deposit_failure_keeps_tokens_and_backs_off() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 101);
        wallet.maintain(0);
        wallet.on_deposit_failed(0);
        assert_eq!(wallet.depositing().len(), 30);
        assert!(wallet.maintain(1).is_empty());

        let requests = wallet.maintain(5);
        let sent = match requests.as_slice() {
            [BankRequest::Deposit { tokens }] => tokens.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(sent.len(), 30);

        let statuses = vec![DepositStatus::Accepted; sent.len()];
        wallet.on_deposit_result(&sent, &statuses, 130, info(5), 6, &mut StdRng::seed_from_u64(4));
        assert!(wallet.depositing().is_empty());
        assert_eq!(wallet.stats().deposited, 30);
        assert_eq!(wallet.bank_balance(), Some(130));
    }

    #[test]
    fn test_previous_interval_deposited_and_empty_deposit_learns() {
        let key = generate_bank_key();
        let mut wallet = funded(&key, 5, 25);
        wallet.add(Token::issue(&key, 4, 1)).unwrap();

        let begin = wallet.begin_deposit_at.unwrap();
        let requests = wallet.maintain(begin);
        match requests.as_slice() {
            [BankRequest::Deposit { tokens }] => assert_eq!(tokens[0].interval, 4),
            other => panic!("unexpected {:?}", other),
        }
        wallet.on_deposit_failed(begin);
        wallet.depositing.clear();

        let late = 10_000 + wallet.learning_delay + 1_000;
        assert_eq!(wallet.maintain(late), vec![BankRequest::Deposit { tokens: vec![] }]);
    }

    #[test]
    fn test_credit_status() {
        let key = generate_bank_key();
        assert_eq!(funded(&key, 1, 0).credit_status(), CreditStatus::Empty);
        assert_eq!(funded(&key, 1, 20).credit_status(), CreditStatus::Low);
        assert_eq!(funded(&key, 1, 21).credit_status(), CreditStatus::Normal);
    }
}
