//! Order/trade lifecycle manager.
//!
//! Applies engine responses and settlement outcomes to the persisted records.
//! Every application is idempotent: order updates are keyed by
//! (order hash, fill sequence) and trades by trade hash, so redelivered
//! messages leave the records untouched.

use ethers::types::Address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine::{EngineResponse, ResponseOrigin};
use crate::messages::{SettlementMessage, SettlementStatus};
use crate::model::{Order, OrderHash, Trade, TradeHash, TradeStatus};
use crate::order_fsm::{self, TransitionError};
use crate::orderbook::BookSnapshot;
use crate::persistence::{RecordStore, StoreError};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),
}

/// Change feed for read models (HTTP/WebSocket layers outside the core).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeNotification {
    OrderUpdated(Order),
    TradeCreated(Trade),
    TradeStatusChanged(Trade),
    BookSnapshot(BookSnapshot),
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    /// New state of every order whose update was applied.
    pub applied_orders: Vec<Order>,
    /// Updates discarded as already applied.
    pub skipped_orders: usize,
    pub new_trades: Vec<Trade>,
}

#[derive(Debug, Default)]
pub struct SettlementReport {
    /// Trades whose status changed in this application.
    pub updated: Vec<Trade>,
    pub skipped: usize,
}

impl SettlementReport {
    /// Trades that reached SUCCESS or FAILED in this application.
    pub fn finalized(&self) -> impl Iterator<Item = &Trade> {
        self.updated.iter().filter(|t| t.status.is_terminal())
    }
}

pub struct LifecycleManager {
    store: Arc<dyn RecordStore>,
    changes: broadcast::Sender<ChangeNotification>,
    /// Serializes read-compare-write cycles across consumers.
    write_lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            changes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    /// Sender half, for components that publish book snapshots.
    pub fn change_sender(&self) -> broadcast::Sender<ChangeNotification> {
        self.changes.clone()
    }

    pub fn apply_engine_response(
        &self,
        response: &EngineResponse,
    ) -> Result<ApplyReport, LifecycleError> {
        let _guard = self.write_lock.lock();
        let mut report = ApplyReport::default();

        // Validate everything before writing anything
        let mut writes = Vec::new();
        for next in response.touched_orders() {
            match self.store.get_order(&next.hash)? {
                // Intake notices only describe orders the engine never saw
                Some(current) if response.origin == ResponseOrigin::Intake => {
                    debug!(
                        order_hash = ?next.hash,
                        stored = ?current.status,
                        "Intake rejection for a recorded order skipped"
                    );
                    report.skipped_orders += 1;
                }
                // Sequence 0 is an intake placeholder, the engine's state supersedes it
                Some(current) if current.fill_sequence == 0 => writes.push(next),
                Some(current) if next.fill_sequence <= current.fill_sequence => {
                    debug!(
                        order_hash = ?next.hash,
                        stored = current.fill_sequence,
                        incoming = next.fill_sequence,
                        "Stale order update skipped"
                    );
                    report.skipped_orders += 1;
                }
                Some(current) => {
                    order_fsm::check_order_update(&current, next)?;
                    writes.push(next);
                }
                None => writes.push(next),
            }
        }

        for order in writes {
            self.store.put_order(order)?;
            report.applied_orders.push(order.clone());
        }

        for trade in &response.trades {
            if self.store.get_trade(&trade.hash)?.is_some() {
                continue;
            }
            self.store.put_trade(trade)?;
            report.new_trades.push(trade.clone());
        }

        if !report.applied_orders.is_empty() || !report.new_trades.is_empty() {
            info!(
                pair = %response.pair,
                sequence = response.sequence,
                orders = report.applied_orders.len(),
                trades = report.new_trades.len(),
                "Engine response applied"
            );
        }
        for order in &report.applied_orders {
            self.notify(ChangeNotification::OrderUpdated(order.clone()));
        }
        for trade in &report.new_trades {
            self.notify(ChangeNotification::TradeCreated(trade.clone()));
        }
        Ok(report)
    }

    pub fn apply_settlement(
        &self,
        message: &SettlementMessage,
    ) -> Result<SettlementReport, LifecycleError> {
        let _guard = self.write_lock.lock();
        let mut report = SettlementReport::default();
        let target = match message.status {
            SettlementStatus::Pending => TradeStatus::Pending,
            SettlementStatus::Success => TradeStatus::Success,
            SettlementStatus::Failed => TradeStatus::Failed,
        };

        for incoming in &message.trades {
            // The settlement outcome can overtake the engine response
            let current = match self.store.get_trade(&incoming.hash)? {
                Some(t) => t,
                None => incoming.clone(),
            };

            if current.status.is_terminal() {
                if current.status != target {
                    warn!(
                        trade_hash = ?current.hash,
                        stored = %current.status,
                        incoming = %target,
                        "Settlement update after final status ignored"
                    );
                }
                report.skipped += 1;
                continue;
            }
            if current.status == target && current.tx_hash == message.tx_hash.or(current.tx_hash) {
                report.skipped += 1;
                continue;
            }
            order_fsm::check_trade_update(&current, target)?;

            let mut updated = current;
            updated.status = target;
            if message.tx_hash.is_some() {
                updated.tx_hash = message.tx_hash;
            }
            updated.updated_at = message.timestamp;
            self.store.put_trade(&updated)?;
            report.updated.push(updated);
        }

        if !report.updated.is_empty() {
            info!(
                batch_id = %message.batch_id,
                status = ?message.status,
                trades = report.updated.len(),
                tx_hash = ?message.tx_hash,
                "Settlement applied"
            );
        }
        for trade in &report.updated {
            self.notify(ChangeNotification::TradeStatusChanged(trade.clone()));
        }
        Ok(report)
    }

    pub fn publish_snapshot(&self, snapshot: BookSnapshot) {
        self.notify(ChangeNotification::BookSnapshot(snapshot));
    }

    fn notify(&self, change: ChangeNotification) {
        // No subscribers is not an error
        let _ = self.changes.send(change);
    }

    pub fn order(&self, hash: &OrderHash) -> Result<Option<Order>, LifecycleError> {
        Ok(self.store.get_order(hash)?)
    }

    pub fn trade(&self, hash: &TradeHash) -> Result<Option<Trade>, LifecycleError> {
        Ok(self.store.get_trade(hash)?)
    }

    pub fn orders_by_owner(&self, owner: &Address) -> Result<Vec<Order>, LifecycleError> {
        Ok(self.store.orders_by_owner(owner)?)
    }

    pub fn trades(&self) -> Result<Vec<Trade>, LifecycleError> {
        Ok(self.store.trades()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimulatedTimeProvider;
    use crate::engine::MatchingEngine;
    use crate::model::{OrderStatus, OrderType, Pair, Side};
    use crate::persistence::InMemoryStore;
    use ethers::types::H256;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn pair() -> Pair {
        Pair::new(Address::repeat_byte(1), Address::repeat_byte(2))
    }

    fn limit(id: u64, side: Side, price: Decimal, qty: Decimal) -> Order {
        Order {
            hash: H256::from_low_u64_be(id),
            pair: pair(),
            side,
            order_type: OrderType::Limit,
            price,
            stop_price: None,
            amount: qty,
            remaining: qty,
            status: OrderStatus::Open,
            role: None,
            owner: Address::from_low_u64_be(id),
            nonce: 1,
            signature: None,
            fill_sequence: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn setup() -> (LifecycleManager, MatchingEngine) {
        let store = Arc::new(InMemoryStore::new());
        let engine = MatchingEngine::new(pair(), Arc::new(SimulatedTimeProvider::new(0)));
        (LifecycleManager::new(store), engine)
    }

    #[test]
    fn test_replaying_response_is_idempotent() {
        let (lifecycle, mut engine) = setup();
        let rest = engine.process(limit(1, Side::Buy, dec!(100), dec!(10))).unwrap();
        let hit = engine.process(limit(2, Side::Sell, dec!(100), dec!(4))).unwrap();

        lifecycle.apply_engine_response(&rest).unwrap();
        let first = lifecycle.apply_engine_response(&hit).unwrap();
        assert_eq!(first.applied_orders.len(), 2);
        assert_eq!(first.new_trades.len(), 1);

        let replay = lifecycle.apply_engine_response(&hit).unwrap();
        assert!(replay.applied_orders.is_empty());
        assert_eq!(replay.skipped_orders, 2);
        assert!(replay.new_trades.is_empty());

        let buy = lifecycle.order(&H256::from_low_u64_be(1)).unwrap().unwrap();
        assert_eq!(buy.remaining, dec!(6));
        assert_eq!(buy.status, OrderStatus::PartialFilled);
        assert_eq!(lifecycle.trades().unwrap().len(), 1);
    }

    #[test]
    fn test_out_of_order_older_update_is_discarded() {
        let (lifecycle, mut engine) = setup();
        let rest = engine.process(limit(1, Side::Buy, dec!(100), dec!(10))).unwrap();
        let hit = engine.process(limit(2, Side::Sell, dec!(100), dec!(4))).unwrap();

        // Newer state first, then the redelivered older one
        lifecycle.apply_engine_response(&hit).unwrap();
        let report = lifecycle.apply_engine_response(&rest).unwrap();
        assert_eq!(report.skipped_orders, 1);
        let buy = lifecycle.order(&H256::from_low_u64_be(1)).unwrap().unwrap();
        assert_eq!(buy.remaining, dec!(6));
    }

    #[test]
    fn test_illegal_transition_writes_nothing() {
        let (lifecycle, _) = setup();
        let mut filled = limit(1, Side::Buy, dec!(1), dec!(1));
        filled.status = OrderStatus::Filled;
        filled.remaining = dec!(0);
        filled.fill_sequence = 3;
        lifecycle.store.put_order(&filled).unwrap();

        let mut bogus = filled.clone();
        bogus.status = OrderStatus::Open;
        bogus.fill_sequence = 4;
        let mut response = EngineResponse::intake_rejection(bogus, "x".into(), 0);
        response.origin = ResponseOrigin::Engine;
        assert!(matches!(
            lifecycle.apply_engine_response(&response),
            Err(LifecycleError::Transition(_))
        ));
        let stored = lifecycle.order(&H256::from_low_u64_be(1)).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
    }

    fn intake_notice(order: &Order) -> EngineResponse {
        let mut rejected = order.clone();
        rejected.status = OrderStatus::Rejected;
        rejected.fill_sequence = 0;
        EngineResponse::intake_rejection(rejected, "nonce already used".into(), 0)
    }

    #[test]
    fn test_intake_notice_never_overrides_engine_state() {
        let (lifecycle, mut engine) = setup();
        let order = limit(1, Side::Buy, dec!(100), dec!(10));
        let rest = engine.process(order.clone()).unwrap();
        lifecycle.apply_engine_response(&rest).unwrap();

        let report = lifecycle.apply_engine_response(&intake_notice(&order)).unwrap();
        assert!(report.applied_orders.is_empty());
        assert_eq!(report.skipped_orders, 1);
        let stored = lifecycle.order(&order.hash).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Open);
    }

    #[test]
    fn test_engine_state_replaces_earlier_intake_notice() {
        let (lifecycle, mut engine) = setup();
        let order = limit(1, Side::Buy, dec!(100), dec!(10));
        let rest = engine.process(order.clone()).unwrap();

        // A replayed submission's notice lands before the original's engine response
        lifecycle.apply_engine_response(&intake_notice(&order)).unwrap();
        assert_eq!(
            lifecycle.order(&order.hash).unwrap().map(|o| o.status),
            Some(OrderStatus::Rejected)
        );
        let report = lifecycle.apply_engine_response(&rest).unwrap();
        assert_eq!(report.applied_orders.len(), 1);

        // Later fills still pass the transition checks
        let hit = engine.process(limit(2, Side::Sell, dec!(100), dec!(4))).unwrap();
        lifecycle.apply_engine_response(&hit).unwrap();
        let stored = lifecycle.order(&order.hash).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::PartialFilled);
        assert_eq!(stored.remaining, dec!(6));
    }

    #[test]
    fn test_settlement_transitions_and_redelivery() {
        let (lifecycle, mut engine) = setup();
        engine.process(limit(1, Side::Buy, dec!(100), dec!(10))).unwrap();
        let hit = engine.process(limit(2, Side::Sell, dec!(100), dec!(4))).unwrap();
        lifecycle.apply_engine_response(&hit).unwrap();
        let trade = hit.trades[0].clone();

        let msg = |status, tx: Option<H256>| SettlementMessage {
            batch_id: "b1".into(),
            status,
            trades: vec![trade.clone()],
            tx_hash: tx,
            nonce: Some(0),
            reason: None,
            timestamp: 10,
        };

        let pending = lifecycle
            .apply_settlement(&msg(SettlementStatus::Pending, Some(H256::repeat_byte(0xee))))
            .unwrap();
        assert_eq!(pending.updated.len(), 1);
        assert_eq!(pending.finalized().count(), 0);
        let stored = lifecycle.trade(&trade.hash).unwrap().unwrap();
        assert_eq!(stored.tx_hash, Some(H256::repeat_byte(0xee)));

        let success = lifecycle
            .apply_settlement(&msg(SettlementStatus::Success, None))
            .unwrap();
        assert_eq!(success.finalized().count(), 1);

        // Redelivered pending and a conflicting failure are both ignored
        let again = lifecycle
            .apply_settlement(&msg(SettlementStatus::Pending, Some(H256::repeat_byte(0xee))))
            .unwrap();
        assert_eq!(again.skipped, 1);
        let late_fail = lifecycle
            .apply_settlement(&msg(SettlementStatus::Failed, None))
            .unwrap();
        assert!(late_fail.updated.is_empty());
        let stored = lifecycle.trade(&trade.hash).unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Success);
        assert_eq!(stored.tx_hash, Some(H256::repeat_byte(0xee)));
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let (lifecycle, mut engine) = setup();
        let mut changes = lifecycle.subscribe_changes();
        let rest = engine.process(limit(1, Side::Buy, dec!(100), dec!(10))).unwrap();
        lifecycle.apply_engine_response(&rest).unwrap();

        match changes.recv().await.unwrap() {
            ChangeNotification::OrderUpdated(order) => {
                assert_eq!(order.hash, H256::from_low_u64_be(1))
            }
            other => panic!("unexpected change {:?}", other),
        }

        lifecycle.publish_snapshot(engine.book().snapshot());
        assert!(matches!(
            changes.recv().await.unwrap(),
            ChangeNotification::BookSnapshot(_)
        ));
    }

    #[test]
    fn test_owner_query() {
        let (lifecycle, mut engine) = setup();
        let rest = engine.process(limit(1, Side::Buy, dec!(100), dec!(10))).unwrap();
        lifecycle.apply_engine_response(&rest).unwrap();
        let mine = lifecycle.orders_by_owner(&Address::from_low_u64_be(1)).unwrap();
        assert_eq!(mine.len(), 1);
        assert!(lifecycle.orders_by_owner(&Address::from_low_u64_be(2)).unwrap().is_empty());
    }
}
