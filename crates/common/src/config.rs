use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Control link constants
pub mod control {
    /// Default address of the routing daemon's control port
    pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9051";

    /// Reply codes that mean success
    pub const OK_CODES: [u16; 2] = [250, 251];

    /// Event replies carry a code in this class
    pub const EVENT_CODE: u16 = 650;

    /// Bootstrap progress at which the daemon can build circuits
    pub const READY_BOOTSTRAP_PROGRESS: u32 = 85;

    /// First reconnect delay after losing the link
    pub const RECONNECT_BASE_SECS: u64 = 1;

    /// Upper bound on the reconnect delay
    pub const RECONNECT_MAX_SECS: u64 = 60;
}

/// Circuit routing constants
pub mod routing {
    /// Default circuit length (number of hops)
    pub const DEFAULT_CIRCUIT_LENGTH: usize = 3;

    /// Maximum circuit length
    pub const MAX_CIRCUIT_LENGTH: usize = 8;

    /// Above this many exit candidates our own relay is never used as exit
    pub const EXIT_SCARCITY_CUTOFF: usize = 4;

    /// Bandwidth assumed for relays that have not reported any
    pub const INITIAL_BW: u64 = 100_000;

    /// Nickname marker of directory authorities
    pub const AUTHORITY_MARKER: &str = "bitmeshauth";

    /// Open circuits per application before new builds need `force`
    pub const MAX_OPEN_CIRCUITS: usize = 10;

    /// A stream handled more often than this is refused
    pub const MAX_STREAM_ATTEMPTS: u32 = 2;

    /// Launching circuits holding streams are closed after this long
    pub const PENDING_CIRCUIT_TIMEOUT_SECS: u64 = 15;
}

/// Per-circuit payment constants
pub mod payment {
    /// Payment protocol version spoken to relays
    pub const PAR_VERSION: u8 = 1;

    /// Approximate cells in one megabyte of traffic
    pub const CELLS_PER_MB: u64 = 2048;

    /// Cells covered by one payment unit
    pub const CELLS_PER_PAYMENT: u64 = 5 * CELLS_PER_MB;

    /// Bytes relayed per cell
    pub const BYTES_PER_CELL: u64 = 499;

    /// Low watermark for paid-but-unused bytes per direction
    pub const LOW_PAR_BYTES: u64 = CELLS_PER_MB * BYTES_PER_CELL;

    /// Read tokens granted at setup
    pub const START_READ_TOKENS: u64 = CELLS_PER_PAYMENT / 2;

    /// Write tokens granted at setup
    pub const START_WRITE_TOKENS: u64 = CELLS_PER_PAYMENT - START_READ_TOKENS;

    /// Time allowed for setup replies and receipts
    pub const PAR_TIMEOUT_SECS: u64 = 30;

    /// Payment units a single request may carry per hop
    pub const MAX_MERCHANT_TOKENS: usize = 4;

    /// Bytes of payment message carried by one SENDPAYMENT cell
    pub const CELL_PAYLOAD_BYTES: usize = 507;
}

/// Wallet watermarks
pub mod wallet {
    /// Acquire more tokens below this balance
    pub const LOW_WATERMARK: u64 = 20;

    /// Deposit surplus above this balance
    pub const HIGH_WATERMARK: u64 = 100;

    /// Tokens per acquisition or deposit batch
    pub const BATCH_SIZE: u64 = 30;

    /// Below this expected balance traffic is considered low on funds
    pub const MIN_FUNCTIONAL_MONEY: u64 = 20;

    /// Value of a single token
    pub const TOKEN_VALUE: u64 = 1;

    /// Interval length assumed until the bank tells us otherwise
    pub const DEFAULT_INTERVAL_SECS: u64 = 12 * 60 * 60;

    /// Seconds between maintenance passes
    pub const MAINTENANCE_INTERVAL_SECS: u64 = 10;

    /// How long an empty wallet waits before polling the bank balance again
    pub const BALANCE_POLL_SECS: u64 = 15 * 60;

    pub const TOKENS_FILE: &str = "tokens.bin";
    pub const DEPOSITING_FILE: &str = "depositing.bin";
}

/// Ledger service constants
pub mod bank {
    /// Bank wire protocol version
    pub const PROTOCOL_VERSION: u8 = 1;

    /// Message type tag of a token acquisition request
    pub const MSG_ACQUIRE: u8 = 1;

    /// Message type tag of a token deposit request
    pub const MSG_DEPOSIT: u8 = 2;

    /// Response timeout
    pub const REQUEST_TIMEOUT_SECS: u64 = 45;

    /// Largest accepted response frame (128 MB)
    pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

    /// First retry delay after a failed deposit
    pub const BACKOFF_BASE_SECS: u64 = 5;

    /// Retry delay cap
    pub const BACKOFF_MAX_SECS: u64 = 300;

    /// Default ledger address
    pub const DEFAULT_BANK_ADDR: &str = "127.0.0.1:33300";
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Control port of the local routing daemon
    pub control_addr: String,

    /// Secret sent with AUTHENTICATE
    pub control_secret: String,

    /// Ledger service address
    pub bank_addr: String,

    /// Hex encoded ed25519 key the bank signs tokens with
    pub bank_key: String,

    /// Fingerprint of our own relay, if we run one
    pub own_fingerprint: Option<String>,

    /// Number of hops per circuit
    pub circuit_length: usize,

    /// Open circuits per application
    pub max_circuits: usize,

    /// Whether circuits we build are paid for
    pub payments_enabled: bool,

    /// Two letter country code every exit must be in
    pub exit_country: Option<String>,

    /// Status API listen address
    pub api_addr: String,

    /// Data directory (wallet files)
    pub data_dir: String,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            control_addr: control::DEFAULT_CONTROL_ADDR.to_string(),
            control_secret: String::new(),
            bank_addr: bank::DEFAULT_BANK_ADDR.to_string(),
            bank_key: String::new(),
            own_fingerprint: None,
            circuit_length: routing::DEFAULT_CIRCUIT_LENGTH,
            max_circuits: routing::MAX_OPEN_CIRCUITS,
            payments_enabled: true,
            exit_country: None,
            api_addr: "127.0.0.1:9150".to_string(),
            data_dir: "./data".to_string(),
            verbose: false,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control_addr(mut self, addr: String) -> Self {
        self.control_addr = addr;
        self
    }

    pub fn with_bank_addr(mut self, addr: String) -> Self {
        self.bank_addr = addr;
        self
    }

    pub fn with_circuit_length(mut self, length: usize) -> Self {
        self.circuit_length = length.clamp(1, routing::MAX_CIRCUIT_LENGTH);
        self
    }

    pub fn with_data_dir(mut self, dir: String) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn with_payments(mut self, enabled: bool) -> Self {
        self.payments_enabled = enabled;
        self
    }

    pub fn bank_timeout(&self) -> Duration {
        Duration::from_secs(bank::REQUEST_TIMEOUT_SECS)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(wallet::MAINTENANCE_INTERVAL_SECS)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}

impl From<ConfigError> for crate::BitmeshError {
    fn from(err: ConfigError) -> Self {
        crate::BitmeshError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.control_addr, control::DEFAULT_CONTROL_ADDR);
        assert_eq!(config.circuit_length, routing::DEFAULT_CIRCUIT_LENGTH);
        assert!(config.payments_enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new()
            .with_control_addr("127.0.0.1:7000".to_string())
            .with_circuit_length(20)
            .with_payments(false)
            .with_data_dir("/tmp/data".to_string());

        assert_eq!(config.control_addr, "127.0.0.1:7000");
        assert_eq!(config.circuit_length, routing::MAX_CIRCUIT_LENGTH);
        assert!(!config.payments_enabled);
        assert_eq!(config.data_dir, "/tmp/data");
    }

    #[test]
    fn test_payment_constants() {
        assert_eq!(payment::START_READ_TOKENS + payment::START_WRITE_TOKENS, payment::CELLS_PER_PAYMENT);
        assert_eq!(payment::LOW_PAR_BYTES, 2048 * 499);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitmesh.toml");

        let mut config = NodeConfig::default();
        config.exit_country = Some("de".to_string());
        config.to_file(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.exit_country.as_deref(), Some("de"));
        assert_eq!(loaded.bank_addr, config.bank_addr);
    }
}
