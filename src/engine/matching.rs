//! Price-time priority matching for a single pair.
//!
//! A `MatchingEngine` is owned by exactly one pair actor; nothing else mutates
//! its book. Every call returns the complete outcome so consumers never query
//! the book to learn what happened.

use ethers::types::Address;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::TimeProvider;
use crate::engine::{
    CancelOutcome, CancelResponse, EngineError, EngineEvent, EngineResponse, ResponseOrigin,
    StopBook,
};
use crate::model::{Order, OrderHash, OrderStatus, Pair, Role, Side, Trade};
use crate::orderbook::OrderBook;

pub struct MatchingEngine {
    pair: Pair,
    book: OrderBook,
    stops: StopBook,
    /// Orders that left the engine, by final status. Drives duplicate
    /// detection and the no-op cancel outcomes.
    closed: HashMap<OrderHash, OrderStatus>,
    last_price: Option<Decimal>,
    sequence: u64,
    time: Arc<dyn TimeProvider>,
}

impl MatchingEngine {
    pub fn new(pair: Pair, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            pair,
            book: OrderBook::new(pair),
            stops: StopBook::new(),
            closed: HashMap::new(),
            last_price: None,
            sequence: 0,
            time,
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    #[cfg(test)]
    pub(crate) fn book_mut(&mut self) -> &mut OrderBook {
        &mut self.book
    }

    pub fn stops(&self) -> &StopBook {
        &self.stops
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn is_known(&self, hash: &OrderHash) -> bool {
        self.book.contains(hash) || self.stops.contains(hash) || self.closed.contains_key(hash)
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn invariant(&self, detail: String) -> EngineError {
        EngineError::InvariantViolation {
            pair: self.pair.key(),
            detail,
        }
    }

    /// Matches one admitted order. Balance must already be locked.
    pub fn process(&mut self, mut order: Order) -> Result<EngineResponse, EngineError> {
        if self.is_known(&order.hash) {
            return Err(EngineError::DuplicateOrder(order.hash));
        }
        let now = self.time.now_millis();

        if let Some(reason) = self.admission_failure(&order) {
            return self.reject(order, reason);
        }

        order.fill_sequence += 1;
        order.updated_at = now;

        if order.order_type.is_stop() {
            debug!(order_hash = ?order.hash, stop = ?order.stop_price, "Stop order parked");
            self.stops.insert(order.clone());
            return Ok(self.response(order, Vec::new(), Vec::new(), EngineEvent::Processed, None));
        }

        let sequence = self.next_sequence();
        let mut trades = Vec::new();
        let mut matched = Vec::new();
        let book_side = order.side.opposite();

        while order.remaining > Decimal::ZERO {
            let Some(best) = self.book.best_price(book_side) else {
                break;
            };
            if !crosses(&order, best) {
                break;
            }
            let Some(maker_remaining) = self.book.front(book_side).map(|m| m.remaining) else {
                return Err(self.invariant(format!("level {} has no front order", best)));
            };
            let fill = order.remaining.min(maker_remaining);

            let maker = self
                .book
                .fill_front(book_side, fill, now)
                .map_err(|e| self.invariant(e.to_string()))?;
            if maker.price != best {
                return Err(self.invariant(format!(
                    "maker {:?} priced {} at level {}",
                    maker.hash, maker.price, best
                )));
            }

            order.remaining -= fill;
            if order.remaining < Decimal::ZERO {
                return Err(self.invariant(format!(
                    "negative remaining {} on {:?}",
                    order.remaining, order.hash
                )));
            }
            order.role = Some(Role::Taker);
            order.fill_sequence += 1;

            let trade = Trade::new(&maker, &order, fill, sequence, now);
            debug!(
                trade_hash = ?trade.hash,
                price = %trade.price,
                amount = %trade.amount,
                "Match"
            );
            self.last_price = Some(trade.price);
            if maker.status == OrderStatus::Filled {
                self.closed.insert(maker.hash, OrderStatus::Filled);
            }
            trades.push(trade);
            matched.push(maker);
        }

        if order.remaining.is_zero() {
            order.status = OrderStatus::Filled;
            self.closed.insert(order.hash, OrderStatus::Filled);
        } else if order.order_type.is_market() {
            // No liquidity left within the bound; the remainder never rests
            order.status = OrderStatus::Cancelled;
            self.closed.insert(order.hash, OrderStatus::Cancelled);
        } else {
            order.status = if trades.is_empty() {
                OrderStatus::Open
            } else {
                OrderStatus::PartialFilled
            };
            if let Err(e) = self.book.insert(order.clone()) {
                return Err(self.invariant(format!("resting insert failed: {}", e)));
            }
        }

        if !trades.is_empty() {
            info!(
                order_hash = ?order.hash,
                pair = %self.pair,
                trades = trades.len(),
                status = %order.status,
                remaining = %order.remaining,
                "Order matched"
            );
        }

        Ok(EngineResponse {
            pair: self.pair,
            sequence,
            event: EngineEvent::Processed,
            origin: ResponseOrigin::Engine,
            order,
            trades,
            matched_orders: matched,
            reason: None,
            timestamp: now,
        })
    }

    /// Closes `order` as REJECTED without touching the book.
    pub fn reject(&mut self, mut order: Order, reason: String) -> Result<EngineResponse, EngineError> {
        if self.is_known(&order.hash) {
            return Err(EngineError::DuplicateOrder(order.hash));
        }
        warn!(order_hash = ?order.hash, pair = %self.pair, reason = %reason, "Order rejected by engine");
        order.status = OrderStatus::Rejected;
        order.fill_sequence += 1;
        order.updated_at = self.time.now_millis();
        self.closed.insert(order.hash, OrderStatus::Rejected);
        Ok(self.response(order, Vec::new(), Vec::new(), EngineEvent::Rejected, Some(reason)))
    }

    /// Processes `order`, then resubmits every stop the resulting trades triggered,
    /// including stops triggered by those resubmissions.
    pub fn submit(&mut self, order: Order) -> Result<Vec<EngineResponse>, EngineError> {
        let mut responses = vec![self.process(order)?];
        loop {
            let triggered = self.take_triggered();
            if triggered.is_empty() {
                break;
            }
            for stop in triggered {
                // Triggered stops left the watch set, so they are not duplicates
                responses.push(self.process(stop)?);
            }
        }
        Ok(responses)
    }

    /// Pulls every stop crossed by the last trade price out of the watch set,
    /// converted into its live order type.
    pub fn take_triggered(&mut self) -> Vec<Order> {
        let Some(last) = self.last_price else {
            return Vec::new();
        };
        let now = self.time.now_millis();
        self.stops
            .take_triggered(last)
            .into_iter()
            .map(|(_, mut order)| {
                info!(order_hash = ?order.hash, stop = ?order.stop_price, last = %last, "Stop triggered");
                order.order_type = order.order_type.triggered();
                order.fill_sequence += 1;
                order.updated_at = now;
                order
            })
            .collect()
    }

    /// Removes a resting or parked order. No-op outcomes are reported, never raised.
    pub fn cancel(&mut self, hash: &OrderHash) -> Result<CancelResponse, EngineError> {
        let removed = match self.book.remove(hash) {
            Some(order) => Some(order),
            None => self.stops.remove(hash),
        };

        let Some(mut order) = removed else {
            let outcome = match self.closed.get(hash) {
                Some(OrderStatus::Filled) => CancelOutcome::AlreadyFilled,
                Some(OrderStatus::Cancelled) => CancelOutcome::AlreadyCancelled,
                _ => CancelOutcome::NotFound,
            };
            debug!(order_hash = ?hash, outcome = ?outcome, "Cancel was a no-op");
            return Ok(CancelResponse {
                order_hash: *hash,
                pair: self.pair,
                outcome,
                response: None,
            });
        };

        if order.remaining <= Decimal::ZERO || !order.status.is_open() {
            return Err(self.invariant(format!(
                "resting order {:?} had remaining {} status {}",
                order.hash, order.remaining, order.status
            )));
        }

        order.status = OrderStatus::Cancelled;
        order.fill_sequence += 1;
        order.updated_at = self.time.now_millis();
        self.closed.insert(order.hash, OrderStatus::Cancelled);
        info!(order_hash = ?order.hash, pair = %self.pair, remaining = %order.remaining, "Order cancelled");

        let response = self.response(order, Vec::new(), Vec::new(), EngineEvent::Cancelled, None);
        Ok(CancelResponse {
            order_hash: *hash,
            pair: self.pair,
            outcome: CancelOutcome::Cancelled,
            response: Some(response),
        })
    }

    /// Open orders of `owner`, resting or parked.
    pub fn open_orders_of(&self, owner: &Address) -> Vec<OrderHash> {
        let mut hashes: Vec<OrderHash> = [Side::Buy, Side::Sell]
            .iter()
            .flat_map(|side| self.book.raw_orders(*side))
            .filter(|o| &o.owner == owner)
            .map(|o| o.hash)
            .collect();
        hashes.extend(self.stops.orders().filter(|o| &o.owner == owner).map(|o| o.hash));
        hashes
    }

    fn admission_failure(&self, order: &Order) -> Option<String> {
        if order.pair != self.pair {
            return Some(format!("order pair {} routed to {}", order.pair, self.pair));
        }
        if order.remaining <= Decimal::ZERO || order.remaining > order.amount {
            return Some(format!(
                "remaining {} outside (0, {}]",
                order.remaining, order.amount
            ));
        }
        if order.status != OrderStatus::Open {
            return Some(format!("incoming order has status {}", order.status));
        }
        if order.price < Decimal::ZERO {
            return Some("negative price".to_string());
        }
        if !order.order_type.is_market() && order.price.is_zero() {
            return Some("limit order without price".to_string());
        }
        if order.order_type.is_stop() && !order.stop_price.is_some_and(|p| p > Decimal::ZERO) {
            return Some("stop order without stop price".to_string());
        }
        None
    }

    fn response(
        &mut self,
        order: Order,
        trades: Vec<Trade>,
        matched_orders: Vec<Order>,
        event: EngineEvent,
        reason: Option<String>,
    ) -> EngineResponse {
        EngineResponse {
            pair: self.pair,
            sequence: self.next_sequence(),
            event,
            origin: ResponseOrigin::Engine,
            timestamp: order.updated_at,
            order,
            trades,
            matched_orders,
            reason,
        }
    }
}

/// Whether an incoming order accepts the best opposing price.
/// Market orders priced at zero carry no bound.
fn crosses(order: &Order, best: Decimal) -> bool {
    if order.order_type.is_market() && order.price.is_zero() {
        return true;
    }
    match order.side {
        Side::Buy => order.price >= best,
        Side::Sell => order.price <= best,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimulatedTimeProvider;
    use crate::model::OrderType;
    use ethers::types::{Address, H256};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;

    fn pair() -> Pair {
        Pair::new(Address::repeat_byte(0xaa), Address::repeat_byte(0xbb))
    }

    fn engine() -> MatchingEngine {
        MatchingEngine::new(pair(), Arc::new(SimulatedTimeProvider::new(1_000)))
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
            nonce: id,
            signature: None,
            fill_sequence: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn market(id: u64, side: Side, qty: Decimal) -> Order {
        let mut order = limit(id, side, Decimal::ZERO, qty);
        order.order_type = OrderType::Market;
        order
    }

    #[test]
    fn test_rest_then_partial_fill() {
        let mut engine = engine();

        let resp = engine.process(limit(1, Side::Buy, dec!(100), dec!(10))).unwrap();
        assert_eq!(resp.order.status, OrderStatus::Open);
        assert!(resp.trades.is_empty());
        assert_eq!(engine.book().best_bid(), Some(dec!(100)));

        let resp = engine.process(limit(2, Side::Sell, dec!(100), dec!(4))).unwrap();
        assert_eq!(resp.trades.len(), 1);
        assert_eq!(resp.trades[0].price, dec!(100));
        assert_eq!(resp.trades[0].amount, dec!(4));
        assert_eq!(resp.order.status, OrderStatus::Filled);
        assert_eq!(resp.matched_orders[0].status, OrderStatus::PartialFilled);
        assert_eq!(resp.matched_orders[0].remaining, dec!(6));
        assert_eq!(resp.matched_orders[0].role, Some(Role::Maker));
        assert_eq!(resp.order.role, Some(Role::Taker));
    }

    #[test]
    fn test_market_sell_exhausts_liquidity_and_cancels_remainder() {
        let mut engine = engine();
        engine.process(limit(1, Side::Buy, dec!(100), dec!(10))).unwrap();
        engine.process(limit(2, Side::Sell, dec!(100), dec!(4))).unwrap();

        let resp = engine.process(market(3, Side::Sell, dec!(20))).unwrap();
        assert_eq!(resp.trades.len(), 1);
        assert_eq!(resp.trades[0].amount, dec!(6));
        assert_eq!(resp.trades[0].price, dec!(100));
        assert_eq!(resp.order.status, OrderStatus::Cancelled);
        assert_eq!(resp.order.remaining, dec!(14));
        assert_eq!(resp.matched_orders[0].status, OrderStatus::Filled);
        assert!(engine.book().is_empty());
    }

    #[test]
    fn test_trade_uses_maker_price_across_levels() {
        let mut engine = engine();
        engine.process(limit(1, Side::Sell, dec!(101), dec!(1))).unwrap();
        engine.process(limit(2, Side::Sell, dec!(102), dec!(1))).unwrap();

        let resp = engine.process(limit(3, Side::Buy, dec!(110), dec!(3))).unwrap();
        let prices: Vec<_> = resp.trades.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![dec!(101), dec!(102)]);
        assert_eq!(resp.order.status, OrderStatus::PartialFilled);
        assert_eq!(engine.book().best_bid(), Some(dec!(110)));
    }

    #[test]
    fn test_time_priority_within_level() {
        let mut engine = engine();
        engine.process(limit(1, Side::Buy, dec!(50), dec!(1))).unwrap();
        engine.process(limit(2, Side::Buy, dec!(50), dec!(1))).unwrap();

        let resp = engine.process(limit(3, Side::Sell, dec!(50), dec!(1))).unwrap();
        assert_eq!(resp.trades[0].maker_order_hash, H256::from_low_u64_be(1));
    }

    #[test]
    fn test_non_crossing_orders_rest() {
        let mut engine = engine();
        engine.process(limit(1, Side::Buy, dec!(99), dec!(1))).unwrap();
        let resp = engine.process(limit(2, Side::Sell, dec!(100), dec!(1))).unwrap();
        assert!(resp.trades.is_empty());
        assert_eq!(engine.book().best_bid(), Some(dec!(99)));
        assert_eq!(engine.book().best_ask(), Some(dec!(100)));
    }

    #[test]
    fn test_duplicate_order_is_refused() {
        let mut engine = engine();
        engine.process(limit(1, Side::Buy, dec!(1), dec!(1))).unwrap();
        assert_eq!(
            engine.process(limit(1, Side::Buy, dec!(1), dec!(1))),
            Err(EngineError::DuplicateOrder(H256::from_low_u64_be(1)))
        );
    }

    #[test]
    fn test_engine_rejects_malformed_order() {
        let mut engine = engine();
        let mut bad = limit(1, Side::Buy, dec!(1), dec!(1));
        bad.remaining = dec!(2);
        let resp = engine.process(bad).unwrap();
        assert_eq!(resp.event, EngineEvent::Rejected);
        assert_eq!(resp.order.status, OrderStatus::Rejected);
        assert!(engine.book().is_empty());
    }

    #[test]
    fn test_cancel_outcomes() {
        let mut engine = engine();
        engine.process(limit(1, Side::Buy, dec!(100), dec!(5))).unwrap();
        engine.process(limit(2, Side::Buy, dec!(100), dec!(5))).unwrap();
        engine.process(limit(3, Side::Sell, dec!(100), dec!(5))).unwrap();

        let filled = engine.cancel(&H256::from_low_u64_be(1)).unwrap();
        assert_eq!(filled.outcome, CancelOutcome::AlreadyFilled);
        assert!(filled.response.is_none());

        let cancelled = engine.cancel(&H256::from_low_u64_be(2)).unwrap();
        assert_eq!(cancelled.outcome, CancelOutcome::Cancelled);
        let resp = cancelled.response.unwrap();
        assert_eq!(resp.order.status, OrderStatus::Cancelled);
        assert_eq!(resp.event, EngineEvent::Cancelled);
        assert!(engine.book().is_empty());

        let again = engine.cancel(&H256::from_low_u64_be(2)).unwrap();
        assert_eq!(again.outcome, CancelOutcome::AlreadyCancelled);
        let unknown = engine.cancel(&H256::from_low_u64_be(99)).unwrap();
        assert_eq!(unknown.outcome, CancelOutcome::NotFound);
    }

    #[test]
    fn test_stop_order_triggers_after_trade() {
        let mut engine = engine();
        // Liquidity above the trigger
        engine.process(limit(1, Side::Sell, dec!(105), dec!(2))).unwrap();

        let mut stop = limit(2, Side::Buy, dec!(106), dec!(1));
        stop.order_type = OrderType::StopLimit;
        stop.stop_price = Some(dec!(100));
        let parked = engine.submit(stop).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(engine.stops().len(), 1);
        assert!(engine.book().best_bid().is_none());

        // A trade at 100 crosses the buy stop
        engine.process(limit(3, Side::Buy, dec!(100), dec!(1))).unwrap();
        let responses = engine.submit(limit(4, Side::Sell, dec!(100), dec!(1))).unwrap();
        assert_eq!(responses.len(), 2);
        let triggered = &responses[1];
        assert_eq!(triggered.order.hash, H256::from_low_u64_be(2));
        assert_eq!(triggered.order.order_type, OrderType::Limit);
        assert_eq!(triggered.trades[0].price, dec!(105));
        assert_eq!(triggered.order.status, OrderStatus::Filled);
        assert!(engine.stops().is_empty());
    }

    #[test]
    fn test_cancel_parked_stop() {
        let mut engine = engine();
        let mut stop = limit(1, Side::Sell, dec!(90), dec!(1));
        stop.order_type = OrderType::StopMarket;
        stop.stop_price = Some(dec!(95));
        engine.submit(stop).unwrap();

        let resp = engine.cancel(&H256::from_low_u64_be(1)).unwrap();
        assert_eq!(resp.outcome, CancelOutcome::Cancelled);
        assert!(engine.stops().is_empty());
    }

    #[test]
    fn test_randomized_flow_keeps_book_and_trades_consistent() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut engine = engine();
        let mut remaining: HashMap<OrderHash, Decimal> = HashMap::new();
        let mut prices: HashMap<OrderHash, Decimal> = HashMap::new();

        for id in 1..=400u64 {
            let side = if rng.gen_range(0..2) == 0 { Side::Buy } else { Side::Sell };
            let price = Decimal::from(rng.gen_range(95..=105u32));
            let qty = Decimal::from(rng.gen_range(1..=10u32));
            let order = limit(id, side, price, qty);
            prices.insert(order.hash, price);

            let resp = engine.process(order).unwrap();
            for trade in &resp.trades {
                // Trade price is always the resting order's quote
                assert_eq!(Some(&trade.price), prices.get(&trade.maker_order_hash));
            }
            for touched in resp.touched_orders() {
                assert!(touched.remaining >= Decimal::ZERO);
                assert!(touched.remaining <= touched.amount);
                if let Some(prev) = remaining.insert(touched.hash, touched.remaining) {
                    assert!(touched.remaining <= prev, "remaining must never grow");
                }
            }
            if let (Some(bid), Some(ask)) = (engine.book().best_bid(), engine.book().best_ask()) {
                assert!(bid < ask, "book must never stay crossed");
            }
        }
    }
}
