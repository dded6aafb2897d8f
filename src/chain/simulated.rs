//! In-process chain double.
//!
//! Accepts signed legacy transactions, enforces per-account nonce order and
//! same-nonce replacement pricing, and mines either on every send or on
//! demand. Failure injection mirrors the node errors the operator must handle.

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{keccak256, rlp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::debug;

use crate::chain::{ChainClient, ChainError};

/// First well-known development key (anvil / hardhat account #0).
pub const TEST_OPERATOR_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Minimum price increase a node accepts for a same-nonce replacement.
const REPLACEMENT_MIN_BUMP_PERCENT: u64 = 10;
const DEFAULT_GAS_ESTIMATE: u64 = 210_000;
const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SentTransaction {
    pub hash: H256,
    pub from: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: U256,
    pub data: Bytes,
}

#[derive(Debug)]
struct MempoolEntry {
    tx: SentTransaction,
    to: Option<Address>,
}

#[derive(Default)]
struct ChainState {
    confirmed_nonces: HashMap<Address, u64>,
    mempool: BTreeMap<(Address, u64), MempoolEntry>,
    receipts: HashMap<H256, TransactionReceipt>,
    balances: HashMap<Address, U256>,
    block_number: u64,
    gas_price: U256,
    gas_estimate: U256,
    hold_mining: bool,
    revert_all: bool,
    fail_estimates: u32,
    fail_sends: u32,
    sent: Vec<SentTransaction>,
    mined: Vec<SentTransaction>,
    log_subscribers: Vec<mpsc::Sender<Log>>,
}

pub struct SimulatedChain {
    state: Mutex<ChainState>,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    pub fn new() -> Self {
        let state = ChainState {
            gas_price: U256::from(1_000_000_000u64),
            gas_estimate: U256::from(DEFAULT_GAS_ESTIMATE),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set_balance(&self, account: Address, balance: U256) {
        self.state.lock().balances.insert(account, balance);
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.lock().gas_price = price;
    }

    /// Keep sent transactions in the mempool until `mine` is called.
    pub fn hold_mining(&self, hold: bool) {
        self.state.lock().hold_mining = hold;
    }

    /// Mined transactions get a status 0 receipt while set.
    pub fn set_revert(&self, revert: bool) {
        self.state.lock().revert_all = revert;
    }

    pub fn fail_next_estimates(&self, count: u32) {
        self.state.lock().fail_estimates = count;
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().fail_sends = count;
    }

    /// Every accepted transaction, replacements included, in arrival order.
    pub fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.state.lock().sent.clone()
    }

    /// Mined transactions in block order.
    pub fn mined_transactions(&self) -> Vec<SentTransaction> {
        self.state.lock().mined.clone()
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    /// Mines every executable mempool transaction, one block each.
    pub fn mine(&self) -> usize {
        let mut state = self.state.lock();
        Self::mine_locked(&mut state)
    }

    fn mine_locked(state: &mut ChainState) -> usize {
        let senders: Vec<Address> = {
            let mut s: Vec<Address> = state.mempool.keys().map(|(from, _)| *from).collect();
            s.dedup();
            s
        };
        let mut count = 0;
        for from in senders {
            loop {
                let next = state.confirmed_nonces.get(&from).copied().unwrap_or(0);
                // A gap holds back every later nonce of the account
                let Some(entry) = state.mempool.remove(&(from, next)) else {
                    break;
                };
                state.block_number += 1;
                state.confirmed_nonces.insert(from, next + 1);
                let status = if state.revert_all { 0u64 } else { 1u64 };
                let receipt = TransactionReceipt {
                    transaction_hash: entry.tx.hash,
                    from,
                    to: entry.to,
                    block_number: Some(U64::from(state.block_number)),
                    gas_used: Some(entry.tx.gas),
                    effective_gas_price: Some(entry.tx.gas_price),
                    status: Some(U64::from(status)),
                    ..Default::default()
                };
                state.receipts.insert(entry.tx.hash, receipt);
                debug!(nonce = next, tx_hash = ?entry.tx.hash, status, "Simulated block mined");

                let log = Log {
                    address: entry.to.unwrap_or_default(),
                    transaction_hash: Some(entry.tx.hash),
                    block_number: Some(U64::from(state.block_number)),
                    ..Default::default()
                };
                state.log_subscribers.retain(|sub| {
                    !matches!(
                        sub.try_send(log.clone()),
                        Err(mpsc::error::TrySendError::Closed(_))
                    )
                });
                state.mined.push(entry.tx);
                count += 1;
            }
        }
        count
    }

    fn pending_nonce_locked(state: &ChainState, account: Address) -> u64 {
        let mut nonce = state.confirmed_nonces.get(&account).copied().unwrap_or(0);
        while state.mempool.contains_key(&(account, nonce)) {
            nonce += 1;
        }
        nonce
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn estimate_gas(&self, _tx: &TypedTransaction) -> Result<U256, ChainError> {
        let mut state = self.state.lock();
        if state.fail_estimates > 0 {
            state.fail_estimates -= 1;
            return Err(ChainError::GasEstimation("execution reverted".to_string()));
        }
        Ok(state.gas_estimate)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        let mut state = self.state.lock();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(ChainError::Rejected("connection reset".to_string()));
        }

        let tx: Transaction =
            rlp::decode(raw.as_ref()).map_err(|e| ChainError::Rejected(e.to_string()))?;
        let from = tx
            .recover_from()
            .map_err(|e| ChainError::Rejected(format!("invalid sender: {}", e)))?;
        let nonce = tx.nonce.as_u64();
        let gas_price = tx.gas_price.unwrap_or_default();
        let hash = H256::from(keccak256(raw.as_ref()));

        let confirmed = state.confirmed_nonces.get(&from).copied().unwrap_or(0);
        if nonce < confirmed {
            return Err(ChainError::Rejected("nonce too low".to_string()));
        }
        if let Some(existing) = state.mempool.get(&(from, nonce)) {
            let min_price = existing.tx.gas_price * (100 + REPLACEMENT_MIN_BUMP_PERCENT) / 100;
            if gas_price < min_price {
                return Err(ChainError::Rejected(
                    "replacement transaction underpriced".to_string(),
                ));
            }
        }

        let sent = SentTransaction {
            hash,
            from,
            nonce,
            gas_price,
            gas: tx.gas,
            data: tx.input.clone(),
        };
        state.sent.push(sent.clone());
        state
            .mempool
            .insert((from, nonce), MempoolEntry { tx: sent, to: tx.to });

        if !state.hold_mining {
            Self::mine_locked(&mut state);
        }
        Ok(hash)
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        Ok(self.state.lock().receipts.get(&hash).cloned())
    }

    async fn get_pending_nonce(&self, account: Address) -> Result<U256, ChainError> {
        let state = self.state.lock();
        Ok(U256::from(Self::pending_nonce_locked(&state, account)))
    }

    async fn get_balance(&self, account: Address) -> Result<U256, ChainError> {
        Ok(self
            .state
            .lock()
            .balances
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn subscribe_logs(&self, _filter: Filter) -> Result<mpsc::Receiver<Log>, ChainError> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        self.state.lock().log_subscribers.push(tx);
        Ok(rx)
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        Ok(self.state.lock().gas_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    fn wallet() -> LocalWallet {
        TEST_OPERATOR_KEY
            .parse::<LocalWallet>()
            .unwrap()
            .with_chain_id(31337u64)
    }

    fn signed(wallet: &LocalWallet, nonce: u64, gas_price: u64) -> Bytes {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(wallet.address())
            .to(Address::repeat_byte(9))
            .nonce(nonce)
            .gas(100_000u64)
            .gas_price(gas_price)
            .chain_id(31337u64)
            .into();
        let sig = wallet.sign_transaction_sync(&tx).unwrap();
        tx.rlp_signed(&sig)
    }

    #[tokio::test]
    async fn test_auto_mining_produces_receipts() {
        let chain = SimulatedChain::new();
        let w = wallet();
        let hash = chain.send_raw_transaction(signed(&w, 0, 10)).await.unwrap();
        let receipt = chain.get_transaction_receipt(hash).await.unwrap().unwrap();
        assert_eq!(receipt.status, Some(U64::from(1)));
        assert_eq!(receipt.from, w.address());
        assert_eq!(chain.get_pending_nonce(w.address()).await.unwrap(), U256::from(1));
    }

    #[tokio::test]
    async fn test_nonce_gap_holds_later_transactions() {
        let chain = SimulatedChain::new();
        let w = wallet();
        let later = chain.send_raw_transaction(signed(&w, 1, 10)).await.unwrap();
        assert!(chain.get_transaction_receipt(later).await.unwrap().is_none());

        chain.send_raw_transaction(signed(&w, 0, 10)).await.unwrap();
        assert!(chain.get_transaction_receipt(later).await.unwrap().is_some());
        let order: Vec<u64> = chain.mined_transactions().iter().map(|t| t.nonce).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_replacement_must_outbid() {
        let chain = SimulatedChain::new();
        chain.hold_mining(true);
        let w = wallet();
        let first = chain.send_raw_transaction(signed(&w, 0, 100)).await.unwrap();
        let err = chain.send_raw_transaction(signed(&w, 0, 105)).await.unwrap_err();
        assert!(matches!(err, ChainError::Rejected(_)));

        let second = chain.send_raw_transaction(signed(&w, 0, 120)).await.unwrap();
        assert_eq!(chain.mine(), 1);
        assert!(chain.get_transaction_receipt(first).await.unwrap().is_none());
        assert!(chain.get_transaction_receipt(second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_logs_are_delivered_on_mining() {
        let chain = SimulatedChain::new();
        let mut logs = chain.subscribe_logs(Filter::new()).await.unwrap();
        let hash = chain.send_raw_transaction(signed(&wallet(), 0, 10)).await.unwrap();
        let log = logs.recv().await.unwrap();
        assert_eq!(log.transaction_hash, Some(hash));
    }
}
