/// API Response types

use bitmesh_core::router::{AppSummary, CircuitSummary};
use bitmesh_core::{CreditStatus, WalletStats};
use serde::{Deserialize, Serialize};

/// Wallet response
#[derive(Debug, Serialize, Deserialize)]
pub struct WalletResponse {
    /// Spendable tokens held locally
    pub balance: u64,
    /// Tokens handed to the bank and not yet confirmed
    pub depositing: u64,
    /// Last balance reported by the bank
    pub bank_balance: Option<u64>,
    pub interval: Option<u32>,
    pub spent: u64,
    pub acquired: u64,
    pub deposited: u64,
    /// `EMPTY`, `LOW` or `NORMAL`; absent when payments are off
    pub credit: Option<String>,
}

impl WalletResponse {
    pub fn new(stats: &WalletStats, credit: Option<CreditStatus>) -> Self {
        Self {
            balance: stats.balance,
            depositing: stats.depositing,
            bank_balance: stats.bank_balance,
            interval: stats.interval,
            spent: stats.spent,
            acquired: stats.acquired,
            deposited: stats.deposited,
            credit: credit.map(|status| {
                match status {
                    CreditStatus::Empty => "EMPTY",
                    CreditStatus::Low => "LOW",
                    CreditStatus::Normal => "NORMAL",
                }
                .to_string()
            }),
        }
    }
}

/// One circuit
#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitInfo {
    pub key: u64,
    /// Id assigned by the routing daemon, once known
    pub circuit_id: Option<u32>,
    pub application: u32,
    pub status: String,
    /// Relay fingerprints, entry first
    pub path: Vec<String>,
    pub hops: usize,
    pub built_by_us: bool,
    pub open: bool,
    pub dirty: bool,
    pub streams: usize,
    pub paid: bool,
    pub paid_read_bytes: i64,
    pub paid_write_bytes: i64,
}

impl From<&CircuitSummary> for CircuitInfo {
    fn from(summary: &CircuitSummary) -> Self {
        let (paid_read_bytes, paid_write_bytes) = summary
            .payment
            .as_ref()
            .map(|stats| (stats.paid_read_bytes, stats.paid_write_bytes))
            .unwrap_or_default();
        Self {
            key: summary.key,
            circuit_id: summary.id,
            application: summary.app,
            status: summary.status.to_string(),
            path: summary.path.clone(),
            hops: summary.path.len(),
            built_by_us: summary.built_by_us,
            open: summary.open,
            dirty: summary.dirty,
            streams: summary.streams,
            paid: summary.payment.is_some(),
            paid_read_bytes,
            paid_write_bytes,
        }
    }
}

/// Circuits response
#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitsResponse {
    pub circuits: Vec<CircuitInfo>,
    /// Total number of circuits
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub id: u32,
    pub name: String,
    pub paused: bool,
    pub live_circuits: usize,
    pub streams: usize,
    pub popular_port: Option<u16>,
}

impl From<&AppSummary> for ApplicationInfo {
    fn from(app: &AppSummary) -> Self {
        Self {
            id: app.id,
            name: app.name.clone(),
            paused: app.paused,
            live_circuits: app.live_circuits,
            streams: app.streams,
            popular_port: app.popular_port,
        }
    }
}

/// Node status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Connected to the routing daemon and bootstrapped
    pub link_ready: bool,
    pub logged_in: bool,
    pub bootstrap_progress: u32,
    /// Relays in the directory
    pub relays: usize,
    pub usable_relays: usize,
    pub circuits: usize,
    /// Circuits that are built or still being built
    pub open_circuits: usize,
    pub streams: usize,
    pub applications: Vec<ApplicationInfo>,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}
