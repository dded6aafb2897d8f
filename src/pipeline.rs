//! Wiring between the router and the components.
//!
//! `OrderIntake` validates, locks and publishes client orders on `orders.in`.
//! `Pipeline::start` subscribes one consumer group per concern:
//! - `engine`: `orders.in` → pair actors → `orders.matched`
//! - `lifecycle`: `orders.matched` → persisted orders/trades, lock releases
//! - `settlement`: `orders.matched` → settlement operator
//! - `settled`: `trades.settled` → trade status, lock releases
//! - `control`: `operator.control` → halts, settlement recovery, alerts

use ethers::types::Address;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::balance::{BalanceValidator, NonceGuard, ValidationError};
use crate::bus::{publish_json, BusError, Delivery, MessageBus, Subscription};
use crate::circuit_breaker::HaltRegistry;
use crate::config::Settings;
use crate::context::CoreContext;
use crate::dispatcher::Dispatcher;
use crate::engine::{EngineResponse, ResponseOrigin};
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::messages::{ControlMessage, EngineMessage, OrderMessage, SettlementMessage};
use crate::metrics;
use crate::model::{Order, OrderCancel, OrderHash, OrderStatus};
use crate::settlement::{SettlementError, SettlementOperator, TradeHandoff};
use crate::subjects::{self, OPERATOR_CONTROL, ORDERS_IN_WILDCARD, ORDERS_MATCHED_WILDCARD, TRADES_SETTLED};

const OPERATOR_CHANNEL_CAPACITY: usize = 1024;
const NOT_READY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Order rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Client-facing entry point: validation, nonce replay guard, balance lock.
pub struct OrderIntake {
    ctx: CoreContext,
    validator: BalanceValidator,
    nonces: NonceGuard,
    lifecycle: Arc<LifecycleManager>,
    exchange: Address,
    skip_signature_check: bool,
}

impl OrderIntake {
    pub fn new(
        ctx: CoreContext,
        lifecycle: Arc<LifecycleManager>,
        exchange: Address,
        skip_signature_check: bool,
    ) -> Self {
        Self {
            validator: BalanceValidator::new(ctx.balances.clone()),
            nonces: NonceGuard::new(),
            ctx,
            lifecycle,
            exchange,
            skip_signature_check,
        }
    }

    /// Admits `order` to matching. On a validation failure a rejection notice
    /// is published and the error returned; nothing is locked.
    pub async fn submit_order(&self, order: Order) -> Result<OrderHash, IntakeError> {
        if let Err(e) = self.admit(&order).await {
            metrics::inc_orders_rejected("intake");
            warn!(order_hash = ?order.hash, owner = ?order.owner, error = %e, "Order rejected at intake");
            self.publish_rejection(order, &e).await;
            return Err(e.into());
        }

        let pair_key = order.pair.key();
        let hash = order.hash;
        let message = OrderMessage::New(order.clone());
        if let Err(e) =
            publish_json(self.ctx.bus.as_ref(), &subjects::orders_in(&pair_key), &pair_key, &message).await
        {
            error!(order_hash = ?hash, error = %e, "Order publish failed, releasing lock");
            if let Err(release) = self.validator.release(&order, order.remaining).await {
                error!(order_hash = ?hash, error = %release, "Lock release after failed publish failed");
            }
            return Err(e.into());
        }
        info!(order_hash = ?hash, pair = %pair_key, side = %order.side, price = %order.price, amount = %order.amount, "Order accepted");
        Ok(hash)
    }

    async fn admit(&self, order: &Order) -> Result<(), ValidationError> {
        BalanceValidator::check_shape(order)?;
        if !self.skip_signature_check {
            let computed = order
                .compute_hash(self.exchange)
                .ok_or_else(|| ValidationError::Malformed("amount or price out of range".into()))?;
            if computed != order.hash {
                return Err(ValidationError::HashMismatch {
                    computed,
                    submitted: order.hash,
                });
            }
            if !order.verify_signature() {
                return Err(ValidationError::InvalidSignature(order.hash));
            }
        }
        // The nonce is spent even if the lock below fails
        self.nonces.check_and_advance(order.owner, order.nonce)?;
        self.validator.validate_and_lock(order).await
    }

    async fn publish_rejection(&self, mut order: Order, error: &ValidationError) {
        let now = self.ctx.time.now_millis();
        order.status = OrderStatus::Rejected;
        // Placeholder sequence: never applied over a record, replaced by any engine state
        order.fill_sequence = 0;
        order.updated_at = now;
        let pair_key = order.pair.key();
        let response = EngineResponse::intake_rejection(order, error.to_string(), now);
        let message = EngineMessage::Response(response);
        if let Err(e) = publish_json(
            self.ctx.bus.as_ref(),
            &subjects::orders_matched(&pair_key),
            &pair_key,
            &message,
        )
        .await
        {
            warn!(error = %e, "Rejection notice publish failed");
        }
    }

    /// Requests cancellation. The outcome arrives asynchronously on `orders.matched`.
    pub async fn cancel_order(&self, cancel: OrderCancel) -> Result<(), IntakeError> {
        if let Some(order) = self.lifecycle.order(&cancel.order_hash)? {
            if order.owner != cancel.owner {
                return Err(ValidationError::NotOwner {
                    order: cancel.order_hash,
                    caller: cancel.owner,
                }
                .into());
            }
        }
        let pair_key = cancel.pair.key();
        debug!(order_hash = ?cancel.order_hash, pair = %pair_key, "Cancel requested");
        publish_json(
            self.ctx.bus.as_ref(),
            &subjects::orders_in(&pair_key),
            &pair_key,
            &OrderMessage::Cancel(cancel),
        )
        .await?;
        Ok(())
    }

    /// One cancel request per open order of `owner`. Returns how many were sent.
    pub async fn cancel_all(&self, owner: Address) -> Result<usize, IntakeError> {
        let open: Vec<Order> = self
            .lifecycle
            .orders_by_owner(&owner)?
            .into_iter()
            .filter(|o| o.status.is_open())
            .collect();
        for order in &open {
            self.cancel_order(OrderCancel {
                order_hash: order.hash,
                pair: order.pair,
                owner,
            })
            .await?;
        }
        info!(owner = ?owner, count = open.len(), "Cancel-all requested");
        Ok(open.len())
    }

    pub fn next_nonce(&self, owner: &Address) -> u64 {
        self.nonces.next_nonce(owner)
    }

    pub async fn locked_balance(&self, owner: Address, token: Address) -> Result<Decimal, IntakeError> {
        Ok(self.validator.locked_balance(owner, token).await?)
    }
}

/// Waits for the next delivery unless shutdown is signalled first.
async fn next_delivery(sub: &mut Subscription, shutdown: &mut watch::Receiver<bool>) -> Option<Delivery> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::select! {
        delivery = sub.next() => delivery,
        _ = shutdown.changed() => None,
    }
}

async fn settle(delivery: Delivery, ok: bool) {
    let result = if ok { delivery.ack().await } else { delivery.nack().await };
    if let Err(e) = result {
        warn!(error = %e, "Delivery settle failed");
    }
}

pub async fn run_engine_consumer(
    mut sub: Subscription,
    mut dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("🚀 Engine consumer listening on '{}'", ORDERS_IN_WILDCARD);
    while let Some(delivery) = next_delivery(&mut sub, &mut shutdown).await {
        let message = match delivery.decode::<OrderMessage>() {
            Ok(m) => m,
            Err(e) => {
                error!(subject = %delivery.subject, error = %e, "Undecodable order message dropped");
                metrics::inc_orders_rejected("decode");
                settle(delivery, true).await;
                continue;
            }
        };
        if let Err(e) = dispatcher.dispatch(message, Some(delivery)).await {
            error!(error = %e, "Dispatch failed");
        }
    }
    dispatcher.shutdown().await;
}

/// Applies engine output to the records and releases the locks of orders
/// that closed without trading their remainder.
pub async fn handle_engine_message(
    lifecycle: &LifecycleManager,
    validator: &BalanceValidator,
    message: &EngineMessage,
) -> Result<(), LifecycleError> {
    let response = match message {
        EngineMessage::Response(r) => r,
        EngineMessage::CancelReport(report) => {
            info!(order_hash = ?report.order_hash, outcome = ?report.outcome, "Cancel had no effect");
            return Ok(());
        }
    };
    let report = lifecycle.apply_engine_response(response)?;
    if report.skipped_orders > 0 {
        metrics::inc_duplicates_skipped(report.skipped_orders as u64);
    }
    for order in &report.applied_orders {
        let releases = match order.status {
            OrderStatus::Cancelled => true,
            // Intake rejections never locked anything
            OrderStatus::Rejected => response.origin == ResponseOrigin::Engine,
            _ => false,
        };
        if releases {
            if let Err(e) = validator.release(order, order.remaining).await {
                error!(order_hash = ?order.hash, error = %e, "Lock release for closed order failed");
            }
        }
    }
    Ok(())
}

pub async fn run_lifecycle_consumer(
    mut sub: Subscription,
    lifecycle: Arc<LifecycleManager>,
    validator: BalanceValidator,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("🚀 Lifecycle consumer listening on '{}'", ORDERS_MATCHED_WILDCARD);
    while let Some(delivery) = next_delivery(&mut sub, &mut shutdown).await {
        let message = match delivery.decode::<EngineMessage>() {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "Undecodable engine message dropped");
                settle(delivery, true).await;
                continue;
            }
        };
        match handle_engine_message(&lifecycle, &validator, &message).await {
            Ok(()) => settle(delivery, true).await,
            Err(LifecycleError::Store(e)) => {
                warn!(error = %e, "Record store unavailable, message handed back");
                settle(delivery, false).await;
            }
            Err(e) => {
                // Redelivery cannot fix an illegal transition
                error!(error = %e, "Engine response refused by lifecycle");
                settle(delivery, true).await;
            }
        }
    }
}

/// Hands matched trades to the operator. A delivery is acked only once the
/// operator has persisted its trades in the settlement queue.
pub async fn run_settlement_feed(
    mut sub: Subscription,
    operator: mpsc::Sender<TradeHandoff>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("🚀 Settlement feed listening on '{}'", ORDERS_MATCHED_WILDCARD);
    while let Some(delivery) = next_delivery(&mut sub, &mut shutdown).await {
        let trades = match delivery.decode::<EngineMessage>() {
            Ok(EngineMessage::Response(r)) => r.trades,
            Ok(EngineMessage::CancelReport(_)) => Vec::new(),
            Err(e) => {
                error!(error = %e, "Undecodable engine message dropped");
                Vec::new()
            }
        };
        if trades.is_empty() {
            settle(delivery, true).await;
            continue;
        }
        let (queued, accepted) = oneshot::channel();
        if operator.send(TradeHandoff { trades, queued }).await.is_err() {
            warn!("Settlement operator stopped, message handed back");
            settle(delivery, false).await;
            break;
        }
        match accepted.await {
            Ok(added) => {
                debug!(added, "Matched trades queued for settlement");
                settle(delivery, true).await;
            }
            Err(_) => {
                warn!("Trades not queued, message handed back");
                settle(delivery, false).await;
            }
        }
    }
}

/// Records a settlement outcome and, for trades it finalizes, releases the
/// lock of both orders for the traded amount. Returns false without applying
/// anything while an order of the batch is not yet recorded.
pub async fn handle_settlement_message(
    lifecycle: &LifecycleManager,
    validator: &BalanceValidator,
    message: &SettlementMessage,
) -> Result<bool, LifecycleError> {
    let mut orders = HashMap::new();
    for trade in &message.trades {
        for hash in [trade.maker_order_hash, trade.taker_order_hash] {
            if orders.contains_key(&hash) {
                continue;
            }
            match lifecycle.order(&hash)? {
                Some(order) => {
                    orders.insert(hash, order);
                }
                None => {
                    debug!(batch_id = %message.batch_id, order_hash = ?hash, "Settlement overtook its engine response");
                    return Ok(false);
                }
            }
        }
    }

    let report = lifecycle.apply_settlement(message)?;
    if report.skipped > 0 {
        metrics::inc_duplicates_skipped(report.skipped as u64);
    }
    for trade in report.finalized() {
        for hash in [trade.maker_order_hash, trade.taker_order_hash] {
            let Some(order) = orders.get(&hash) else {
                continue;
            };
            if let Err(e) = validator.release(order, trade.amount).await {
                error!(trade_hash = ?trade.hash, order_hash = ?hash, error = %e, "Lock release for settled trade failed");
            }
        }
    }
    Ok(true)
}

pub async fn run_settled_consumer(
    mut sub: Subscription,
    lifecycle: Arc<LifecycleManager>,
    validator: BalanceValidator,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("🚀 Settlement outcome consumer listening on '{}'", TRADES_SETTLED);
    while let Some(delivery) = next_delivery(&mut sub, &mut shutdown).await {
        let message = match delivery.decode::<SettlementMessage>() {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "Undecodable settlement message dropped");
                settle(delivery, true).await;
                continue;
            }
        };
        match handle_settlement_message(&lifecycle, &validator, &message).await {
            Ok(true) => settle(delivery, true).await,
            Ok(false) => {
                tokio::time::sleep(NOT_READY_BACKOFF).await;
                settle(delivery, false).await;
            }
            Err(LifecycleError::Store(e)) => {
                warn!(error = %e, "Record store unavailable, message handed back");
                settle(delivery, false).await;
            }
            Err(e) => {
                error!(batch_id = %message.batch_id, error = %e, "Settlement message refused by lifecycle");
                settle(delivery, true).await;
            }
        }
    }
}

pub fn handle_control_message(halts: &HaltRegistry, message: &ControlMessage) {
    match message {
        ControlMessage::HaltPair { pair_key, reason } => halts.halt_pair(pair_key, reason),
        ControlMessage::ResumePair { pair_key } => {
            if !halts.resume_pair(pair_key) {
                info!(pair = %pair_key, "Resume for a pair that was not halted");
            }
        }
        ControlMessage::ResumeSettlement => {}
        ControlMessage::Alert(alert) => warn!(
            kind = ?alert.kind,
            pair = ?alert.pair_key,
            nonce = ?alert.nonce,
            "🚨 ALERT: {}",
            alert.message
        ),
    }
    metrics::set_halted_pairs(halts.halted_pairs().len() as i64);
}

pub async fn run_control_consumer(
    mut sub: Subscription,
    halts: Arc<HaltRegistry>,
    operator: mpsc::Sender<ControlMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("🚀 Control consumer listening on '{}'", OPERATOR_CONTROL);
    while let Some(delivery) = next_delivery(&mut sub, &mut shutdown).await {
        match delivery.decode::<ControlMessage>() {
            Ok(message) => {
                handle_control_message(&halts, &message);
                if matches!(message, ControlMessage::ResumeSettlement)
                    && operator.send(message).await.is_err()
                {
                    warn!("Settlement operator stopped, resume ignored");
                }
            }
            Err(e) => error!(error = %e, "Undecodable control message dropped"),
        }
        settle(delivery, true).await;
    }
}

/// Every consumer and the settlement operator, running on the router.
pub struct Pipeline {
    intake: Arc<OrderIntake>,
    lifecycle: Arc<LifecycleManager>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub async fn start(ctx: CoreContext, settings: &Settings) -> Result<Self, PipelineError> {
        let exchange = settings
            .engine
            .exchange_address
            .parse::<Address>()
            .map_err(|e| PipelineError::Configuration(format!("invalid exchange address: {}", e)))?;
        let lifecycle = Arc::new(LifecycleManager::new(ctx.store.clone()));
        let validator = BalanceValidator::new(ctx.balances.clone());
        let operator = SettlementOperator::new(ctx.clone(), settings.settlement.clone(), &settings.chain)?;
        let dispatcher = Dispatcher::new(
            ctx.clone(),
            settings.engine.pair_queue_capacity,
            settings.bus.publish_attempts,
        )
        .with_change_feed(lifecycle.change_sender());

        let bus: &dyn MessageBus = ctx.bus.as_ref();
        let engine_sub = bus.subscribe(ORDERS_IN_WILDCARD, "engine").await?;
        let lifecycle_sub = bus.subscribe(ORDERS_MATCHED_WILDCARD, "lifecycle").await?;
        let feed_sub = bus.subscribe(ORDERS_MATCHED_WILDCARD, "settlement").await?;
        let settled_sub = bus.subscribe(TRADES_SETTLED, "settled").await?;
        let control_sub = bus.subscribe(OPERATOR_CONTROL, "control").await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (trades_tx, trades_rx) = mpsc::channel(OPERATOR_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(OPERATOR_CHANNEL_CAPACITY);

        let tasks = vec![
            tokio::spawn(run_engine_consumer(engine_sub, dispatcher, shutdown_rx.clone())),
            tokio::spawn(run_lifecycle_consumer(
                lifecycle_sub,
                lifecycle.clone(),
                validator.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_settlement_feed(feed_sub, trades_tx, shutdown_rx.clone())),
            tokio::spawn(run_settled_consumer(
                settled_sub,
                lifecycle.clone(),
                validator,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_control_consumer(
                control_sub,
                ctx.halts.clone(),
                control_tx,
                shutdown_rx,
            )),
            tokio::spawn(operator.run(trades_rx, control_rx)),
        ];

        let intake = Arc::new(OrderIntake::new(
            ctx,
            lifecycle.clone(),
            exchange,
            settings.engine.skip_signature_check,
        ));
        info!("✅ Pipeline started");
        Ok(Self {
            intake,
            lifecycle,
            shutdown,
            tasks,
        })
    }

    pub fn intake(&self) -> Arc<OrderIntake> {
        self.intake.clone()
    }

    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        self.lifecycle.clone()
    }

    /// Stops the consumers, drains the pair actors and lets the operator exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Pipeline task panicked");
            }
        }
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::InMemoryBalanceStore;
    use crate::bus::MemoryBus;
    use crate::chain::SimulatedChain;
    use crate::engine::MatchingEngine;
    use crate::messages::SettlementStatus;
    use crate::model::{OrderType, Pair, Side, Trade, TradeStatus};
    use crate::persistence::InMemoryStore;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::H256;
    use rust_decimal_macros::dec;

    struct Fixture {
        ctx: CoreContext,
        bus: MemoryBus,
        balances: Arc<InMemoryBalanceStore>,
        lifecycle: Arc<LifecycleManager>,
    }

    fn fixture() -> Fixture {
        let bus = MemoryBus::new();
        let balances = Arc::new(InMemoryBalanceStore::new());
        let store = Arc::new(InMemoryStore::new());
        let ctx = CoreContext::new_simulated(
            1_000,
            Arc::new(bus.clone()),
            balances.clone(),
            Arc::new(SimulatedChain::new()),
            store.clone(),
        );
        Fixture {
            ctx,
            bus,
            balances,
            lifecycle: Arc::new(LifecycleManager::new(store)),
        }
    }

    fn pair() -> Pair {
        Pair::new(Address::repeat_byte(0xaa), Address::repeat_byte(0xbb))
    }

    fn limit(owner: Address, nonce: u64, side: Side, price: Decimal, qty: Decimal) -> Order {
        Order {
            hash: H256::from_low_u64_be(nonce * 1000 + owner.to_low_u64_be() % 1000),
            pair: pair(),
            side,
            order_type: OrderType::Limit,
            price,
            stop_price: None,
            amount: qty,
            remaining: qty,
            status: OrderStatus::Open,
            role: None,
            owner,
            nonce,
            signature: None,
            fill_sequence: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_intake_locks_and_publishes() {
        let f = fixture();
        let owner = Address::repeat_byte(1);
        f.balances.deposit(owner, pair().quote_token, dec!(1000));
        let intake = OrderIntake::new(f.ctx.clone(), f.lifecycle.clone(), Address::zero(), true);

        intake
            .submit_order(limit(owner, 1, Side::Buy, dec!(100), dec!(3)))
            .await
            .unwrap();
        assert_eq!(intake.locked_balance(owner, pair().quote_token).await.unwrap(), dec!(300));
        assert_eq!(intake.next_nonce(&owner), 2);
        let sent = f.bus.published_json::<OrderMessage>(ORDERS_IN_WILDCARD);
        assert!(matches!(sent.as_slice(), [OrderMessage::New(_)]));
    }

    #[tokio::test]
    async fn test_stale_nonce_is_rejected_with_notice() {
        let f = fixture();
        let owner = Address::repeat_byte(1);
        f.balances.deposit(owner, pair().base_token, dec!(100));
        let intake = OrderIntake::new(f.ctx.clone(), f.lifecycle.clone(), Address::zero(), true);

        intake
            .submit_order(limit(owner, 5, Side::Sell, dec!(1), dec!(1)))
            .await
            .unwrap();
        let err = intake
            .submit_order(limit(owner, 4, Side::Sell, dec!(1), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Rejected(ValidationError::StaleNonce { .. })));
        assert_eq!(intake.locked_balance(owner, pair().base_token).await.unwrap(), dec!(1));

        let notices = f.bus.published_json::<EngineMessage>(ORDERS_MATCHED_WILDCARD);
        match notices.as_slice() {
            [EngineMessage::Response(r)] => {
                assert_eq!(r.origin, ResponseOrigin::Intake);
                assert_eq!(r.order.status, OrderStatus::Rejected);
                assert_eq!(r.order.fill_sequence, 0);
            }
            other => panic!("unexpected notices: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signed_order_is_verified() {
        let f = fixture();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let exchange = Address::repeat_byte(0xee);
        f.balances.deposit(wallet.address(), pair().base_token, dec!(10));
        let intake = OrderIntake::new(f.ctx.clone(), f.lifecycle.clone(), exchange, false);

        let mut order = limit(wallet.address(), 1, Side::Sell, dec!(2), dec!(1));
        order.hash = order.compute_hash(exchange).unwrap();
        order.signature = Some(wallet.sign_message(order.hash.as_bytes()).await.unwrap());
        intake.submit_order(order.clone()).await.unwrap();

        let mut forged = limit(wallet.address(), 2, Side::Sell, dec!(2), dec!(1));
        forged.hash = forged.compute_hash(exchange).unwrap();
        let other = LocalWallet::new(&mut rand::thread_rng());
        forged.signature = Some(other.sign_message(forged.hash.as_bytes()).await.unwrap());
        let err = intake.submit_order(forged).await.unwrap_err();
        assert!(matches!(err, IntakeError::Rejected(ValidationError::InvalidSignature(_))));

        let mut tampered = order;
        tampered.nonce = 3;
        let err = intake.submit_order(tampered).await.unwrap_err();
        assert!(matches!(err, IntakeError::Rejected(ValidationError::HashMismatch { .. })));
    }

    #[tokio::test]
    async fn test_cancel_by_other_owner_is_refused() {
        let f = fixture();
        let owner = Address::repeat_byte(1);
        let order = limit(owner, 1, Side::Buy, dec!(1), dec!(1));
        let mut engine = MatchingEngine::new(pair(), f.ctx.time.clone());
        f.lifecycle
            .apply_engine_response(&engine.process(order.clone()).unwrap())
            .unwrap();
        let intake = OrderIntake::new(f.ctx.clone(), f.lifecycle.clone(), Address::zero(), true);

        let err = intake
            .cancel_order(OrderCancel {
                order_hash: order.hash,
                pair: pair(),
                owner: Address::repeat_byte(2),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Rejected(ValidationError::NotOwner { .. })));
        assert_eq!(intake.cancel_all(owner).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_order_releases_remaining_once() {
        let f = fixture();
        let owner = Address::repeat_byte(1);
        f.balances.deposit(owner, pair().quote_token, dec!(100));
        let validator = BalanceValidator::new(f.balances.clone());
        let order = limit(owner, 1, Side::Buy, dec!(10), dec!(5));
        validator.validate_and_lock(&order).await.unwrap();

        let mut engine = MatchingEngine::new(pair(), f.ctx.time.clone());
        let rested = EngineMessage::Response(engine.process(order.clone()).unwrap());
        handle_engine_message(&f.lifecycle, &validator, &rested).await.unwrap();
        let cancelled = engine.cancel(&order.hash).unwrap().response.unwrap();
        let cancelled = EngineMessage::Response(cancelled);
        handle_engine_message(&f.lifecycle, &validator, &cancelled).await.unwrap();
        // Redelivery must not release again
        handle_engine_message(&f.lifecycle, &validator, &cancelled).await.unwrap();

        let balance = f.balances.balance(owner, pair().quote_token);
        assert_eq!(balance.locked, dec!(0));
        assert_eq!(balance.available, dec!(100));
    }

    #[tokio::test]
    async fn test_failed_settlement_releases_both_orders() {
        let f = fixture();
        let (buyer, seller) = (Address::repeat_byte(1), Address::repeat_byte(2));
        f.balances.deposit(buyer, pair().quote_token, dec!(1000));
        f.balances.deposit(seller, pair().base_token, dec!(10));
        let validator = BalanceValidator::new(f.balances.clone());
        let buy = limit(buyer, 1, Side::Buy, dec!(100), dec!(10));
        let sell = limit(seller, 1, Side::Sell, dec!(100), dec!(4));
        validator.validate_and_lock(&buy).await.unwrap();
        validator.validate_and_lock(&sell).await.unwrap();

        let mut engine = MatchingEngine::new(pair(), f.ctx.time.clone());
        for order in [buy, sell] {
            let message = EngineMessage::Response(engine.process(order).unwrap());
            handle_engine_message(&f.lifecycle, &validator, &message).await.unwrap();
        }
        let trades = f.lifecycle.trades().unwrap();
        assert_eq!(trades.len(), 1);

        let failed = SettlementMessage {
            batch_id: "b-1".to_string(),
            status: SettlementStatus::Failed,
            trades: trades.clone(),
            tx_hash: None,
            nonce: None,
            reason: Some("execution reverted".to_string()),
            timestamp: 2_000,
        };
        assert!(handle_settlement_message(&f.lifecycle, &validator, &failed).await.unwrap());
        assert!(handle_settlement_message(&f.lifecycle, &validator, &failed).await.unwrap());

        let trade = f.lifecycle.trade(&trades[0].hash).unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Failed);
        // Buyer keeps the lock for the 6 still resting, seller is fully released
        assert_eq!(f.balances.balance(buyer, pair().quote_token).locked, dec!(600));
        assert_eq!(f.balances.balance(seller, pair().base_token).locked, dec!(0));
    }

    #[tokio::test]
    async fn test_settlement_waits_for_order_records() {
        let f = fixture();
        let validator = BalanceValidator::new(f.balances.clone());
        let buy = limit(Address::repeat_byte(1), 1, Side::Buy, dec!(1), dec!(1));
        let sell = limit(Address::repeat_byte(2), 1, Side::Sell, dec!(1), dec!(1));
        let trade = Trade::new(&buy, &sell, dec!(1), 1, 0);
        let message = SettlementMessage {
            batch_id: "b-1".to_string(),
            status: SettlementStatus::Success,
            trades: vec![trade.clone()],
            tx_hash: Some(H256::repeat_byte(7)),
            nonce: Some(0),
            reason: None,
            timestamp: 2_000,
        };
        assert!(!handle_settlement_message(&f.lifecycle, &validator, &message).await.unwrap());
        assert!(f.lifecycle.trade(&trade.hash).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feed_acks_only_after_trades_are_queued() {
        let f = fixture();
        let sub = f.bus.subscribe(ORDERS_MATCHED_WILDCARD, "settlement").await.unwrap();
        let (operator, mut handoffs) = mpsc::channel(4);
        let (stop, stop_rx) = watch::channel(false);
        let feed = tokio::spawn(run_settlement_feed(sub, operator, stop_rx));

        let mut engine = MatchingEngine::new(pair(), f.ctx.time.clone());
        engine.process(limit(Address::repeat_byte(1), 1, Side::Buy, dec!(1), dec!(2))).unwrap();
        let hit = engine.process(limit(Address::repeat_byte(2), 1, Side::Sell, dec!(1), dec!(2))).unwrap();
        let key = pair().key();
        publish_json(&f.bus, &subjects::orders_matched(&key), &key, &EngineMessage::Response(hit))
            .await
            .unwrap();

        // Operator could not persist the queue: the sender is dropped unanswered
        let first = handoffs.recv().await.unwrap();
        assert_eq!(first.trades.len(), 1);
        drop(first);
        let second = handoffs.recv().await.unwrap();
        assert_eq!(f.bus.ack_count(), 0);
        assert_eq!(f.bus.nack_count(), 1);

        second.queued.send(1).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while f.bus.ack_count() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "delivery never acked");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.send(true).unwrap();
        feed.await.unwrap();
    }

    #[test]
    fn test_control_messages_toggle_halts() {
        let halts = HaltRegistry::new();
        handle_control_message(
            &halts,
            &ControlMessage::HaltPair {
                pair_key: "p".to_string(),
                reason: "maintenance".to_string(),
            },
        );
        assert!(halts.is_halted("p"));
        handle_control_message(&halts, &ControlMessage::ResumePair { pair_key: "p".to_string() });
        assert!(!halts.is_halted("p"));
    }
}
