//! Settlement operator: batches matched trades into exchange transactions,
//! sequences them by nonce and reconciles receipts back into trade status.

pub mod batcher;
pub mod nonce;
pub mod operator;

use ethers::types::{Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::bus::BusError;
use crate::chain::ChainError;
use crate::model::Trade;
use crate::persistence::StoreError;

pub use batcher::Batcher;
pub use nonce::NonceManager;
pub use operator::SettlementOperator;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Transaction with nonce {nonce} still pending after {replacements} replacements")]
    StuckTransaction { nonce: u64, replacements: u32 },
    #[error("Settlement stalled on nonce {0}, awaiting operator recovery")]
    Stalled(u64),
}

/// A submitted settlement transaction awaiting its receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTx {
    pub batch_id: String,
    pub nonce: u64,
    pub trades: Vec<Trade>,
    /// Every hash sent for this nonce, oldest first.
    pub tx_hashes: Vec<H256>,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub calldata: Bytes,
    /// Time of the latest (re)submission.
    pub submitted_at: i64,
    pub replacements: u32,
}

/// Matched trades handed to the operator. `queued` fires once they are
/// persisted in the operator's queue; the source delivery is acked then.
#[derive(Debug)]
pub struct TradeHandoff {
    pub trades: Vec<Trade>,
    pub queued: oneshot::Sender<usize>,
}

/// Result of one receipt polling pass.
#[derive(Debug, Default, PartialEq)]
pub struct PollReport {
    pub confirmed: Vec<u64>,
    pub reverted: Vec<u64>,
    pub replaced: Vec<u64>,
}
