use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionRequest, H256, U256, U64};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::publish_json;
use crate::chain::{encode_batch_call, ChainError};
use crate::config::{ChainConfig, SettlementConfig};
use crate::context::CoreContext;
use crate::messages::{Alert, AlertKind, ControlMessage, SettlementMessage, SettlementStatus};
use crate::metrics;
use crate::model::{Trade, TradeHash, TradeStatus};
use crate::persistence::StoreError;
use crate::settlement::{
    Batcher, NonceManager, PendingTx, PollReport, SettlementError, TradeHandoff,
};
use crate::subjects::{OPERATOR_CONTROL, TRADES_SETTLED};

pub const PENDING_METADATA_KEY: &str = "settlement.pending";
/// Trades accepted from the feed but not yet in a submitted batch.
pub const QUEUED_METADATA_KEY: &str = "settlement.queued";
/// Hashes of trades that reached SUCCESS or FAILED.
pub const SETTLED_METADATA_KEY: &str = "settlement.settled";
const SETTLEMENT_PARTITION_KEY: &str = "settlement";
const OPERATOR_PARTITION_KEY: &str = "operator";

/// Retries `op` with exponential backoff until it succeeds or `attempts` are spent.
async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    backoff_base_ms: u64,
    what: &str,
    mut op: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                let delay = backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                warn!(attempt, delay_ms = delay, error = %e, "{} failed, backing off", what);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => {
                error!(attempt, error = %e, "{} failed, giving up", what);
                return Err(e);
            }
        }
    }
}

async fn next_log(logs: &mut Option<mpsc::Receiver<Log>>) -> Option<Log> {
    match logs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Owns the operator account: one transaction per batch, nonces strictly in
/// submission order, same-nonce fee replacement for stuck transactions.
pub struct SettlementOperator {
    ctx: CoreContext,
    config: SettlementConfig,
    wallet: LocalWallet,
    exchange: Address,
    chain_id: u64,
    decimals: u32,
    min_balance: U256,
    batcher: Batcher,
    nonces: NonceManager,
    pending: BTreeMap<u64, PendingTx>,
    /// Settlement messages not yet accepted by the bus, oldest first.
    outbox: VecDeque<SettlementMessage>,
    /// Trades already finalized, so a redelivered match is never settled again.
    settled: HashSet<TradeHash>,
    /// Nonce escalated past the replacement ceiling.
    stalled: Option<u64>,
}

impl SettlementOperator {
    pub fn new(
        ctx: CoreContext,
        config: SettlementConfig,
        chain: &ChainConfig,
    ) -> Result<Self, SettlementError> {
        let key = chain.operator_private_key.as_deref().ok_or_else(|| {
            SettlementError::Configuration("operator private key not set".to_string())
        })?;
        let wallet = key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| SettlementError::Configuration(format!("invalid operator key: {}", e)))?
            .with_chain_id(chain.chain_id);
        let exchange = chain.exchange_address.parse::<Address>().map_err(|e| {
            SettlementError::Configuration(format!("invalid exchange address: {}", e))
        })?;
        let min_balance = U256::from_dec_str(&config.min_operator_balance_wei).map_err(|e| {
            SettlementError::Configuration(format!("invalid minimum operator balance: {}", e))
        })?;

        let nonces = NonceManager::new(ctx.chain.clone(), wallet.address());
        let batcher = Batcher::new(config.max_batch_size, config.max_batch_wait_ms);
        let mut operator = Self {
            ctx,
            config,
            wallet,
            exchange,
            chain_id: chain.chain_id,
            decimals: chain.token_decimals,
            min_balance,
            batcher,
            nonces,
            pending: BTreeMap::new(),
            outbox: VecDeque::new(),
            settled: HashSet::new(),
            stalled: None,
        };
        operator.restore()?;
        Ok(operator)
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn pending(&self) -> &BTreeMap<u64, PendingTx> {
        &self.pending
    }

    pub fn queued(&self) -> usize {
        self.batcher.len()
    }

    pub fn stalled_nonce(&self) -> Option<u64> {
        self.stalled
    }

    /// Queues newly matched trades and persists the queue. Trades already
    /// queued, in flight or settled are skipped.
    pub fn enqueue(&mut self, trades: Vec<Trade>) -> Result<usize, SettlementError> {
        let in_flight: HashSet<TradeHash> = self
            .pending
            .values()
            .flat_map(|p| p.trades.iter().map(|t| t.hash))
            .collect();
        let now = self.ctx.time.now_millis();
        let incoming = trades.len();
        let mut added = 0;
        for trade in trades {
            if trade.status != TradeStatus::Pending
                || in_flight.contains(&trade.hash)
                || self.settled.contains(&trade.hash)
                || self.recorded_as_submitted(&trade.hash)
            {
                debug!(trade_hash = ?trade.hash, "Trade already settling, not queued");
                continue;
            }
            if self.batcher.push(trade, now) {
                added += 1;
            }
        }
        // Also covers a redelivery after an earlier persist failed
        if incoming > 0 {
            self.persist()?;
        }
        if added > 0 {
            debug!(added, queued = self.batcher.len(), "Trades queued for settlement");
        }
        Ok(added)
    }

    /// Whether the lifecycle already recorded the trade with a transaction or an outcome.
    fn recorded_as_submitted(&self, hash: &TradeHash) -> bool {
        match self.ctx.store.get_trade(hash) {
            Ok(Some(trade)) => trade.status.is_terminal() || trade.tx_hash.is_some(),
            Ok(None) => false,
            Err(e) => {
                warn!(trade_hash = ?hash, error = %e, "Trade lookup failed, queueing anyway");
                false
            }
        }
    }

    /// Submits whatever is still queued, ignoring the batch bounds. Stays
    /// queued (and persisted) while settlement is stalled.
    pub async fn drain(&mut self) -> Result<usize, SettlementError> {
        if let Some(nonce) = self.stalled {
            warn!(nonce, queued = self.batcher.len(), "Settlement stalled, queued trades kept for restart");
            return Ok(0);
        }
        let mut submitted = 0;
        while let Some(batch) = self.batcher.take_next() {
            if self.submit_batch(batch).await?.is_some() {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    /// Submits every batch whose size or age bound is reached.
    pub async fn flush_due(&mut self) -> Result<usize, SettlementError> {
        if self.stalled.is_some() {
            return Ok(0);
        }
        let mut submitted = 0;
        while let Some(batch) = self.batcher.take_due(self.ctx.time.now_millis()) {
            if self.submit_batch(batch).await?.is_some() {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    /// Sends one settlement transaction for `trades`. Returns its nonce, or
    /// `None` when the batch failed before reaching the chain.
    pub async fn submit_batch(&mut self, trades: Vec<Trade>) -> Result<Option<u64>, SettlementError> {
        if let Some(nonce) = self.stalled {
            return Err(SettlementError::Stalled(nonce));
        }
        let batch_id = self.ctx.id.new_id();
        let calldata = match encode_batch_call(&trades, self.decimals) {
            Ok(data) => data,
            Err(e) => {
                self.fail_batch(batch_id, trades, e.to_string()).await;
                return Ok(None);
            }
        };

        let chain = self.ctx.chain.clone();
        let attempts = self.config.send_retry_ceiling;
        let backoff = self.config.backoff_base_ms;
        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(self.address())
            .to(self.exchange)
            .data(calldata.clone())
            .chain_id(self.chain_id)
            .into();

        let estimate =
            match retry_with_backoff(attempts, backoff, "Gas estimation", || chain.estimate_gas(&tx))
                .await
            {
                Ok(gas) => gas,
                Err(e) => {
                    self.fail_batch(batch_id, trades, e.to_string()).await;
                    return Ok(None);
                }
            };
        self.check_operator_balance().await;
        let gas_price =
            match retry_with_backoff(attempts, backoff, "Gas price", || chain.gas_price()).await {
                Ok(price) => price,
                Err(e) => {
                    self.fail_batch(batch_id, trades, e.to_string()).await;
                    return Ok(None);
                }
            };
        let gas_limit = estimate * self.config.gas_limit_multiplier_percent / 100;

        let nonce = loop {
            match self.nonces.reserve().await {
                Ok(n) if self.pending.contains_key(&n) => {
                    error!(nonce = n, "Reserved nonce already carries a pending transaction, skipping it");
                    self.nonces.raise_floor(n + 1);
                }
                Ok(n) => break n,
                Err(e) => {
                    self.fail_batch(batch_id, trades, e.to_string()).await;
                    return Ok(None);
                }
            }
        };
        tx.set_nonce(nonce);
        tx.set_gas(gas_limit);
        tx.set_gas_price(gas_price);

        let sent = match self.sign(&tx) {
            Ok(raw) => {
                retry_with_backoff(attempts, backoff, "Transaction send", || {
                    chain.send_raw_transaction(raw.clone())
                })
                .await
            }
            Err(e) => Err(e),
        };
        let tx_hash = match sent {
            Ok(hash) => hash,
            Err(e) => {
                self.nonces.release(nonce);
                self.fail_batch(batch_id, trades, e.to_string()).await;
                return Ok(None);
            }
        };

        let now = self.ctx.time.now_millis();
        let trades: Vec<Trade> = trades
            .into_iter()
            .map(|mut t| {
                t.tx_hash = Some(tx_hash);
                t.updated_at = now;
                t
            })
            .collect();
        info!(
            batch_id = %batch_id,
            nonce,
            tx_hash = ?tx_hash,
            trades = trades.len(),
            gas_price = %gas_price,
            "Settlement batch submitted"
        );
        self.queue_message(
            SettlementStatus::Pending,
            batch_id.clone(),
            trades.clone(),
            Some(tx_hash),
            Some(nonce),
            None,
        );
        self.pending.insert(
            nonce,
            PendingTx {
                batch_id,
                nonce,
                trades,
                tx_hashes: vec![tx_hash],
                gas_price,
                gas_limit,
                calldata,
                submitted_at: now,
                replacements: 0,
            },
        );
        self.persist()?;
        metrics::set_pending_transactions(self.pending.len() as i64);
        self.flush_outbox().await;
        Ok(Some(nonce))
    }

    /// Checks receipts in nonce order and replaces the oldest transaction
    /// once it has been pending past the deadline.
    pub async fn poll_pending(&mut self) -> Result<PollReport, SettlementError> {
        let mut report = PollReport::default();
        let now = self.ctx.time.now_millis();
        let deadline_ms = (self.config.pending_deadline_secs as i64).saturating_mul(1000);
        let mut stuck = None;
        let mut head = true;

        let nonces: Vec<u64> = self.pending.keys().copied().collect();
        for nonce in nonces {
            let Some(entry) = self.pending.get(&nonce) else {
                continue;
            };
            let hashes = entry.tx_hashes.clone();
            let submitted_at = entry.submitted_at;

            let mut receipt = None;
            // Latest replacement is the likeliest to be mined
            for hash in hashes.iter().rev() {
                match self.ctx.chain.get_transaction_receipt(*hash).await {
                    Ok(Some(r)) => {
                        receipt = Some(r);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(nonce, tx_hash = ?hash, error = %e, "Receipt lookup failed"),
                }
            }

            if let Some(receipt) = receipt {
                let success = receipt.status == Some(U64::from(1));
                self.finalize(nonce, receipt.transaction_hash, success).await;
                if success {
                    report.confirmed.push(nonce);
                } else {
                    report.reverted.push(nonce);
                }
                continue;
            }

            if head && self.stalled.is_none() && now - submitted_at >= deadline_ms {
                match self.replace(nonce).await {
                    Ok(()) => report.replaced.push(nonce),
                    Err(e) => {
                        stuck = Some(e);
                        break;
                    }
                }
            }
            head = false;
        }

        self.persist()?;
        metrics::set_pending_transactions(self.pending.len() as i64);
        self.flush_outbox().await;
        match stuck {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Clears an escalation once the operator account's nonce was recovered by hand.
    pub async fn handle_control(&mut self, message: &ControlMessage) -> Result<(), SettlementError> {
        if let ControlMessage::ResumeSettlement = message {
            self.resume().await?;
        }
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), SettlementError> {
        let Some(nonce) = self.stalled.take() else {
            return Ok(());
        };
        let now = self.ctx.time.now_millis();
        for entry in self.pending.values_mut() {
            entry.replacements = 0;
            entry.submitted_at = now;
        }
        let next = self.nonces.sync().await?;
        self.persist()?;
        metrics::set_settlement_stalled(false);
        info!(stalled_nonce = nonce, next_nonce = next, "▶️ Settlement resumed");
        Ok(())
    }

    /// Resends the transaction at `nonce` with a higher gas price.
    async fn replace(&mut self, nonce: u64) -> Result<(), SettlementError> {
        let Some(entry) = self.pending.get(&nonce) else {
            return Ok(());
        };
        if entry.replacements >= self.config.replacement_ceiling {
            let replacements = entry.replacements;
            self.stalled = Some(nonce);
            metrics::set_settlement_stalled(true);
            error!(
                nonce,
                replacements,
                batch_id = %entry.batch_id,
                "🚨 Settlement transaction stuck, manual nonce recovery required"
            );
            let message = format!(
                "settlement transaction with nonce {} stuck after {} replacements",
                nonce, replacements
            );
            self.raise_alert(AlertKind::StuckTransaction, message, Some(nonce))
                .await;
            return Err(SettlementError::StuckTransaction {
                nonce,
                replacements,
            });
        }

        let bumped = entry.gas_price * (100 + self.config.gas_bump_percent) / 100;
        let current = match self.ctx.chain.gas_price().await {
            Ok(price) => price,
            Err(e) => {
                warn!(error = %e, "Gas price lookup failed, using bumped price");
                U256::zero()
            }
        };
        let gas_price = bumped.max(current);
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.address())
            .to(self.exchange)
            .data(entry.calldata.clone())
            .chain_id(self.chain_id)
            .nonce(nonce)
            .gas(entry.gas_limit)
            .gas_price(gas_price)
            .into();
        let raw = self.sign(&tx)?;

        let now = self.ctx.time.now_millis();
        let Some(entry) = self.pending.get_mut(&nonce) else {
            return Ok(());
        };
        // A failed send still spends one attempt of the ceiling
        entry.replacements += 1;
        entry.submitted_at = now;
        match self.ctx.chain.send_raw_transaction(raw).await {
            Ok(hash) => {
                entry.tx_hashes.push(hash);
                entry.gas_price = gas_price;
                metrics::inc_replacements();
                warn!(
                    nonce,
                    tx_hash = ?hash,
                    gas_price = %gas_price,
                    attempt = entry.replacements,
                    "Replaced pending settlement transaction"
                );
            }
            Err(e) => {
                warn!(nonce, error = %e, attempt = entry.replacements, "Replacement send failed");
            }
        }
        Ok(())
    }

    async fn finalize(&mut self, nonce: u64, tx_hash: H256, success: bool) {
        let Some(entry) = self.pending.remove(&nonce) else {
            return;
        };
        let (status, reason, outcome) = if success {
            (SettlementStatus::Success, None, "success")
        } else {
            (
                SettlementStatus::Failed,
                Some("transaction reverted".to_string()),
                "reverted",
            )
        };
        metrics::inc_settlement_batches(outcome);
        info!(
            batch_id = %entry.batch_id,
            nonce,
            tx_hash = ?tx_hash,
            outcome,
            "Settlement transaction mined"
        );
        self.settled.extend(entry.trades.iter().map(|t| t.hash));
        if !success {
            let message = format!("settlement batch {} reverted in {:?}", entry.batch_id, tx_hash);
            self.raise_alert(AlertKind::SettlementFailure, message, Some(nonce))
                .await;
        }
        self.queue_message(
            status,
            entry.batch_id,
            entry.trades,
            Some(tx_hash),
            Some(nonce),
            reason,
        );
    }

    async fn fail_batch(&mut self, batch_id: String, trades: Vec<Trade>, reason: String) {
        warn!(
            batch_id = %batch_id,
            trades = trades.len(),
            reason = %reason,
            "Settlement batch failed before submission"
        );
        metrics::inc_settlement_batches("failed");
        self.settled.extend(trades.iter().map(|t| t.hash));
        self.queue_message(SettlementStatus::Failed, batch_id, trades, None, None, Some(reason));
        if let Err(e) = self.persist() {
            error!(error = %e, "Failed to persist settlement state");
        }
        self.flush_outbox().await;
    }

    fn queue_message(
        &mut self,
        status: SettlementStatus,
        batch_id: String,
        trades: Vec<Trade>,
        tx_hash: Option<H256>,
        nonce: Option<u64>,
        reason: Option<String>,
    ) {
        let timestamp = self.ctx.time.now_millis();
        let trade_status = match status {
            SettlementStatus::Pending => TradeStatus::Pending,
            SettlementStatus::Success => TradeStatus::Success,
            SettlementStatus::Failed => TradeStatus::Failed,
        };
        let trades = trades
            .into_iter()
            .map(|mut t| {
                t.status = trade_status;
                t.updated_at = timestamp;
                if tx_hash.is_some() {
                    t.tx_hash = tx_hash;
                }
                t
            })
            .collect();
        self.outbox.push_back(SettlementMessage {
            batch_id,
            status,
            trades,
            tx_hash,
            nonce,
            reason,
            timestamp,
        });
    }

    /// Publishes queued settlement messages in order, stopping at the first failure.
    pub async fn flush_outbox(&mut self) -> usize {
        let mut sent = 0;
        while let Some(message) = self.outbox.front() {
            match publish_json(
                self.ctx.bus.as_ref(),
                TRADES_SETTLED,
                SETTLEMENT_PARTITION_KEY,
                message,
            )
            .await
            {
                Ok(()) => {
                    self.outbox.pop_front();
                    sent += 1;
                }
                Err(e) => {
                    warn!(pending = self.outbox.len(), error = %e, "Settlement publish failed, will retry");
                    break;
                }
            }
        }
        sent
    }

    async fn check_operator_balance(&self) {
        match self.ctx.chain.get_balance(self.address()).await {
            Ok(balance) if balance < self.min_balance => {
                warn!(
                    balance = %balance,
                    floor = %self.min_balance,
                    "⚠️ Operator balance below floor"
                );
                let message = format!(
                    "operator {:?} balance {} below {}",
                    self.address(),
                    balance,
                    self.min_balance
                );
                self.raise_alert(AlertKind::LowOperatorBalance, message, None)
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Operator balance check failed"),
        }
    }

    async fn raise_alert(&self, kind: AlertKind, message: String, nonce: Option<u64>) {
        let alert = ControlMessage::Alert(Alert {
            kind,
            message,
            pair_key: None,
            nonce,
            timestamp: self.ctx.time.now_millis(),
        });
        if let Err(e) = publish_json(
            self.ctx.bus.as_ref(),
            OPERATOR_CONTROL,
            OPERATOR_PARTITION_KEY,
            &alert,
        )
        .await
        {
            error!(error = %e, "Failed to publish operator alert");
        }
    }

    fn sign(&self, tx: &TypedTransaction) -> Result<Bytes, ChainError> {
        let signature = self
            .wallet
            .sign_transaction_sync(tx)
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }

    fn persist(&self) -> Result<(), SettlementError> {
        let entries: Vec<&PendingTx> = self.pending.values().collect();
        let queued: Vec<&Trade> = self.batcher.trades().collect();
        let store = self.ctx.store.as_ref();
        store.save_metadata(
            PENDING_METADATA_KEY,
            serde_json::to_value(&entries).map_err(StoreError::from)?,
        )?;
        store.save_metadata(
            QUEUED_METADATA_KEY,
            serde_json::to_value(&queued).map_err(StoreError::from)?,
        )?;
        store.save_metadata(
            SETTLED_METADATA_KEY,
            serde_json::to_value(&self.settled).map_err(StoreError::from)?,
        )?;
        Ok(())
    }

    fn restore(&mut self) -> Result<(), SettlementError> {
        let store = self.ctx.store.clone();
        if let Some(value) = store.load_metadata(SETTLED_METADATA_KEY)? {
            self.settled = serde_json::from_value(value).map_err(StoreError::from)?;
        }
        if let Some(value) = store.load_metadata(PENDING_METADATA_KEY)? {
            let entries: Vec<PendingTx> = serde_json::from_value(value).map_err(StoreError::from)?;
            if !entries.is_empty() {
                info!(pending = entries.len(), "Restored pending settlement transactions");
            }
            self.pending = entries.into_iter().map(|p| (p.nonce, p)).collect();
        }
        if let Some(value) = store.load_metadata(QUEUED_METADATA_KEY)? {
            let queued: Vec<Trade> = serde_json::from_value(value).map_err(StoreError::from)?;
            let now = self.ctx.time.now_millis();
            for trade in queued {
                self.batcher.push(trade, now);
            }
            if !self.batcher.is_empty() {
                info!(queued = self.batcher.len(), "Restored queued settlement trades");
            }
        }
        if let Some(highest) = self.pending.keys().next_back() {
            self.nonces.raise_floor(highest + 1);
        }
        metrics::set_pending_transactions(self.pending.len() as i64);
        Ok(())
    }

    /// Sends every pending transaction again at its last price. A node that
    /// lost them while the operator was down takes them back; one that still
    /// holds them refuses the duplicate. Returns how many were accepted.
    pub async fn rebroadcast_pending(&mut self) -> usize {
        let mut accepted = 0;
        let nonces: Vec<u64> = self.pending.keys().copied().collect();
        for nonce in nonces {
            let Some(entry) = self.pending.get(&nonce) else {
                continue;
            };
            let tx: TypedTransaction = TransactionRequest::new()
                .from(self.address())
                .to(self.exchange)
                .data(entry.calldata.clone())
                .chain_id(self.chain_id)
                .nonce(nonce)
                .gas(entry.gas_limit)
                .gas_price(entry.gas_price)
                .into();
            let raw = match self.sign(&tx) {
                Ok(raw) => raw,
                Err(e) => {
                    error!(nonce, error = %e, "Could not sign rebroadcast");
                    continue;
                }
            };
            match self.ctx.chain.send_raw_transaction(raw).await {
                Ok(hash) => {
                    accepted += 1;
                    info!(nonce, tx_hash = ?hash, "Pending settlement transaction rebroadcast");
                    if let Some(entry) = self.pending.get_mut(&nonce) {
                        if !entry.tx_hashes.contains(&hash) {
                            entry.tx_hashes.push(hash);
                        }
                    }
                }
                Err(e) => debug!(nonce, error = %e, "Rebroadcast refused"),
            }
        }
        if accepted > 0 {
            if let Err(e) = self.persist() {
                error!(error = %e, "Failed to persist settlement state");
            }
        }
        accepted
    }

    /// One maintenance pass: retry unpublished messages, poll receipts, flush due batches.
    pub async fn tick(&mut self) -> Result<(), SettlementError> {
        self.flush_outbox().await;
        let polled = self.poll_pending().await;
        let flushed = self.flush_due().await;
        polled?;
        flushed?;
        Ok(())
    }

    /// Runs until the trade channel closes, then submits whatever is still
    /// queued. Contract logs wake the receipt poll early.
    pub async fn run(
        mut self,
        mut trades_rx: mpsc::Receiver<TradeHandoff>,
        mut control_rx: mpsc::Receiver<ControlMessage>,
    ) {
        if !self.pending.is_empty() {
            self.rebroadcast_pending().await;
        }
        let filter = Filter::new().address(self.exchange);
        let mut logs = match self.ctx.chain.subscribe_logs(filter).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(error = %e, "Log subscription unavailable, polling only");
                None
            }
        };
        let poll_every = Duration::from_millis(self.config.receipt_poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(poll_every);
        info!(operator = ?self.address(), exchange = ?self.exchange, "🚀 Settlement operator running");

        loop {
            tokio::select! {
                maybe = trades_rx.recv() => match maybe {
                    Some(handoff) => {
                        match self.enqueue(handoff.trades) {
                            Ok(added) => {
                                let _ = handoff.queued.send(added);
                            }
                            // Dropping the sender hands the delivery back
                            Err(e) => error!(error = %e, "Could not queue trades"),
                        }
                        if let Err(e) = self.flush_due().await {
                            error!(error = %e, "Batch flush failed");
                        }
                    }
                    None => break,
                },
                Some(command) = control_rx.recv() => {
                    if let Err(e) = self.handle_control(&command).await {
                        error!(error = %e, "Control command failed");
                    }
                }
                Some(log) = next_log(&mut logs) => {
                    debug!(tx_hash = ?log.transaction_hash, "Exchange log received");
                    if let Err(e) = self.poll_pending().await {
                        error!(error = %e, "Receipt poll failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Settlement tick failed");
                    }
                }
            }
        }
        match self.drain().await {
            Ok(submitted) if submitted > 0 => info!(submitted, "Queued trades submitted on shutdown"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Draining the settlement queue failed"),
        }
        self.flush_outbox().await;
        info!(
            pending = self.pending.len(),
            queued = self.batcher.len(),
            "Settlement operator stopped"
        );
    }
}
