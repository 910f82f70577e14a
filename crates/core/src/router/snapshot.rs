use super::Router;
use crate::circuit::{Circuit, Pausable};
use crate::payment::ChannelStats;
use crate::wallet::{CreditStatus, WalletStats};
use serde::Serialize;

/// Point-in-time view of the router for the status API
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterSnapshot {
    pub link_ready: bool,
    pub logged_in: bool,
    pub bootstrap_progress: u32,
    pub relays: usize,
    pub usable_relays: usize,
    pub circuits: Vec<CircuitSummary>,
    pub streams: usize,
    pub applications: Vec<AppSummary>,
    pub wallet: WalletStats,
    pub credit: Option<CreditStatus>,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSummary {
    pub key: u64,
    pub id: Option<u32>,
    pub app: u32,
    pub status: &'static str,
    pub path: Vec<String>,
    pub built_by_us: bool,
    /// Built or still being built
    pub open: bool,
    pub dirty: bool,
    pub streams: usize,
    pub payment: Option<ChannelStats>,
}

impl From<&Circuit> for CircuitSummary {
    fn from(circuit: &Circuit) -> Self {
        let path = if circuit.final_path.is_empty() {
            &circuit.current_path
        } else {
            &circuit.final_path
        };
        Self {
            key: circuit.key.0,
            id: circuit.id.map(|id| id.0),
            app: circuit.app.0,
            status: circuit.status.as_str(),
            path: path.iter().map(|fp| fp.to_hex()).collect(),
            built_by_us: circuit.built_by_us,
            open: circuit.is_open(),
            dirty: circuit.is_dirty(),
            streams: circuit.streams.len() + circuit.pending_streams.len(),
            payment: circuit.payment.as_ref().map(|channel| channel.stats()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
    pub id: u32,
    pub name: String,
    pub paused: bool,
    pub live_circuits: usize,
    pub streams: usize,
    pub popular_port: Option<u16>,
}

impl Router {
    pub fn snapshot(&self) -> RouterSnapshot {
        let mut circuits: Vec<CircuitSummary> = self.circuits.values().map(CircuitSummary::from).collect();
        circuits.sort_by_key(|summary| summary.key);

        RouterSnapshot {
            link_ready: self.is_link_ready(),
            logged_in: self.logged_in,
            bootstrap_progress: self.bootstrap_progress,
            relays: self.directory.len(),
            usable_relays: self.directory.usable().count(),
            circuits,
            streams: self.streams.len(),
            applications: self
                .apps
                .values()
                .map(|app| AppSummary {
                    id: app.id.0,
                    name: app.name().to_string(),
                    paused: app.is_paused(),
                    live_circuits: app.live_circuits.len(),
                    streams: app.streams.len(),
                    popular_port: app.most_popular_port(),
                })
                .collect(),
            wallet: self.wallet.stats(),
            credit: self.settings.payments_enabled.then(|| self.wallet.credit_status()),
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
        }
    }
}
