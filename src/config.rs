use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub bus: BusConfig,
    pub engine: EngineConfig,
    pub settlement: SettlementConfig,
    pub chain: ChainConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    /// Unset means the in-process bus.
    pub nats_url: Option<String>,
    pub stream_name: String,
    pub durable_prefix: String,
    pub ack_wait_secs: u64,
    /// Publish attempts before a message is handed back to the broker.
    pub publish_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            stream_name: "DEX_CORE".to_string(),
            durable_prefix: "DEX_CORE".to_string(),
            ack_wait_secs: 30,
            publish_attempts: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Inbound queue bound of each pair actor.
    pub pair_queue_capacity: usize,
    /// Address the order hash commits to.
    pub exchange_address: String,
    /// Skip hash and signature checks (local simulation only).
    pub skip_signature_check: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pair_queue_capacity: 1024,
            exchange_address: format!("{:?}", ethers::types::Address::zero()),
            skip_signature_check: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_batch_size: usize,
    pub max_batch_wait_ms: u64,
    /// Gas estimation / send attempts before the batch fails.
    pub send_retry_ceiling: u32,
    pub backoff_base_ms: u64,
    pub pending_deadline_secs: u64,
    /// Same-nonce replacements before the transaction is escalated.
    pub replacement_ceiling: u32,
    pub gas_bump_percent: u64,
    pub gas_limit_multiplier_percent: u64,
    pub receipt_poll_interval_ms: u64,
    /// Native balance floor of the operator account, in wei.
    pub min_operator_balance_wei: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            max_batch_wait_ms: 500,
            send_retry_ceiling: 3,
            backoff_base_ms: 200,
            pending_deadline_secs: 60,
            replacement_ceiling: 3,
            gas_bump_percent: 20,
            gas_limit_multiplier_percent: 120,
            receipt_poll_interval_ms: 1000,
            min_operator_balance_wei: "100000000000000000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: Option<String>,
    /// Settle against the in-process chain double with the development key.
    /// Must be asked for; a missing `rpc_url` is otherwise an error.
    pub simulated: bool,
    pub chain_id: u64,
    pub exchange_address: String,
    pub operator_private_key: Option<String>,
    pub token_decimals: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            simulated: false,
            chain_id: 31337,
            exchange_address: format!("{:?}", ethers::types::Address::zero()),
            operator_private_key: None,
            token_decimals: crate::model::DEFAULT_TOKEN_DECIMALS,
        }
    }
}

/// Chain the settlement operator talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainBackend {
    Rpc(String),
    Simulated,
}

impl ChainConfig {
    pub fn backend(&self) -> Result<ChainBackend, ConfigError> {
        if self.simulated {
            return Ok(ChainBackend::Simulated);
        }
        match &self.rpc_url {
            Some(url) => Ok(ChainBackend::Rpc(url.clone())),
            None => Err(ConfigError::Message(
                "chain.rpc_url is not set; set chain.simulated = true to settle against the simulated chain"
                    .to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Unset means records are kept in memory only.
    pub redb_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 3002 }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // 1. Project defaults from config/default.{toml,json}
            .add_source(File::with_name("config/default").required(false))
            // 2. Run-mode specific overrides, e.g. config/production
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment overrides
            // e.g. DEX_SETTLEMENT__MAX_BATCH_SIZE=50
            .add_source(Environment::with_prefix("DEX").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Settings from an in-memory TOML document, skipping files and environment.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
