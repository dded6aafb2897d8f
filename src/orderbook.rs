//! Per-pair resting order book.
//!
//! Bids and asks are price-indexed `BTreeMap`s; each level keeps its orders
//! keyed by an insertion counter so iteration is strict time priority.
//! An index from order hash to (side, price, priority) makes removal a pair
//! of map lookups instead of a level scan.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::model::{Order, OrderHash, OrderStatus, Pair, Role, Side};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookError {
    #[error("Order {0:?} is already resting")]
    Duplicate(OrderHash),
    #[error("Order {hash:?} cannot rest (remaining {remaining}, status {status})")]
    NotRestable {
        hash: OrderHash,
        remaining: Decimal,
        status: OrderStatus,
    },
    #[error("Order for pair {order_pair} submitted to book {book_pair}")]
    WrongPair {
        order_pair: String,
        book_pair: String,
    },
    #[error("No resting order on the {0} side")]
    Empty(Side),
    #[error("Overfill of {hash:?}: match {amount} exceeds remaining {remaining}")]
    Overfill {
        hash: OrderHash,
        amount: Decimal,
        remaining: Decimal,
    },
}

#[derive(Debug, Default)]
struct PriceLevel {
    orders: BTreeMap<u64, Order>,
    total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSummary {
    pub price: Decimal,
    pub amount: Decimal,
    pub orders: usize,
}

/// Aggregated read model of one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: Pair,
    /// Best (highest) bid first.
    pub bids: Vec<LevelSummary>,
    /// Best (lowest) ask first.
    pub asks: Vec<LevelSummary>,
}

#[derive(Debug)]
pub struct OrderBook {
    pair: Pair,
    bids: BTreeMap<Decimal, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    index: HashMap<OrderHash, (Side, Decimal, u64)>,
    next_priority: u64,
}

impl OrderBook {
    pub fn new(pair: Pair) -> Self {
        Self {
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            next_priority: 0,
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, hash: &OrderHash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn insert(&mut self, order: Order) -> Result<(), BookError> {
        if order.pair != self.pair {
            return Err(BookError::WrongPair {
                order_pair: order.pair.key(),
                book_pair: self.pair.key(),
            });
        }
        if !order.is_resting_candidate() {
            return Err(BookError::NotRestable {
                hash: order.hash,
                remaining: order.remaining,
                status: order.status,
            });
        }
        if self.index.contains_key(&order.hash) {
            return Err(BookError::Duplicate(order.hash));
        }

        self.next_priority += 1;
        let priority = self.next_priority;
        let (hash, side, price) = (order.hash, order.side, order.price);

        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let level = levels.entry(price).or_default();
        level.total += order.remaining;
        level.orders.insert(priority, order);
        self.index.insert(hash, (side, price, priority));
        Ok(())
    }

    pub fn remove(&mut self, hash: &OrderHash) -> Option<Order> {
        let (side, price, priority) = self.index.remove(hash)?;
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let level = levels.get_mut(&price)?;
        let order = level.orders.remove(&priority)?;
        level.total -= order.remaining;
        if level.orders.is_empty() {
            levels.remove(&price);
        }
        Some(order)
    }

    pub fn get(&self, hash: &OrderHash) -> Option<&Order> {
        let (side, price, priority) = self.index.get(hash)?;
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.get(price)?.orders.get(priority)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Best price on `side`: highest bid or lowest ask.
    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    pub fn depth_at_price(&self, side: Side, price: Decimal) -> Decimal {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.get(&price).map(|l| l.total).unwrap_or(Decimal::ZERO)
    }

    /// Earliest order at the best price of `side`.
    pub fn front(&self, side: Side) -> Option<&Order> {
        let level = match side {
            Side::Buy => self.bids.values().next_back(),
            Side::Sell => self.asks.values().next(),
        }?;
        level.orders.values().next()
    }

    /// Consumes `amount` from the front order of `side` and returns its new state.
    /// The order leaves the book once nothing remains; empty levels are pruned.
    pub(crate) fn fill_front(
        &mut self,
        side: Side,
        amount: Decimal,
        now_ms: i64,
    ) -> Result<Order, BookError> {
        let best = self.best_price(side).ok_or(BookError::Empty(side))?;
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let level = levels.get_mut(&best).ok_or(BookError::Empty(side))?;

        let (priority, updated) = {
            let (priority, order) = level
                .orders
                .iter_mut()
                .next()
                .ok_or(BookError::Empty(side))?;
            if amount <= Decimal::ZERO || amount > order.remaining {
                return Err(BookError::Overfill {
                    hash: order.hash,
                    amount,
                    remaining: order.remaining,
                });
            }
            order.remaining -= amount;
            order.status = if order.remaining.is_zero() {
                OrderStatus::Filled
            } else {
                OrderStatus::PartialFilled
            };
            order.role = Some(Role::Maker);
            order.fill_sequence += 1;
            order.updated_at = now_ms;
            (*priority, order.clone())
        };
        level.total -= amount;

        if updated.remaining.is_zero() {
            level.orders.remove(&priority);
            self.index.remove(&updated.hash);
        }
        if level.orders.is_empty() {
            levels.remove(&best);
        }
        Ok(updated)
    }

    pub fn snapshot(&self) -> BookSnapshot {
        let summarize = |(price, level): (&Decimal, &PriceLevel)| LevelSummary {
            price: *price,
            amount: level.total,
            orders: level.orders.len(),
        };
        BookSnapshot {
            pair: self.pair,
            bids: self.bids.iter().rev().map(summarize).collect(),
            asks: self.asks.iter().map(summarize).collect(),
        }
    }

    /// Resting orders of one side in matching priority.
    pub fn raw_orders(&self, side: Side) -> Vec<Order> {
        match side {
            Side::Buy => self
                .bids
                .values()
                .rev()
                .flat_map(|l| l.orders.values().cloned())
                .collect(),
            Side::Sell => self
                .asks
                .values()
                .flat_map(|l| l.orders.values().cloned())
                .collect(),
        }
    }

    /// Overwrites a resting order's remaining behind the level totals.
    #[cfg(test)]
    pub(crate) fn corrupt_remaining(&mut self, hash: &OrderHash, remaining: Decimal) {
        let Some(&(side, price, priority)) = self.index.get(hash) else {
            return;
        };
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        if let Some(order) = levels.get_mut(&price).and_then(|l| l.orders.get_mut(&priority)) {
            order.remaining = remaining;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderType;
    use ethers::types::{Address, H256};
    use rust_decimal_macros::dec;

    fn pair() -> Pair {
        Pair::new(Address::repeat_byte(1), Address::repeat_byte(2))
    }

    fn order(id: u8, side: Side, price: Decimal, qty: Decimal) -> Order {
        Order {
            hash: H256::repeat_byte(id),
            pair: pair(),
            side,
            order_type: OrderType::Limit,
            price,
            stop_price: None,
            amount: qty,
            remaining: qty,
            status: OrderStatus::Open,
            role: None,
            owner: Address::repeat_byte(id),
            nonce: id as u64,
            signature: None,
            fill_sequence: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_best_prices_and_depth() {
        let mut book = OrderBook::new(pair());
        book.insert(order(1, Side::Buy, dec!(99), dec!(1))).unwrap();
        book.insert(order(2, Side::Buy, dec!(100), dec!(2))).unwrap();
        book.insert(order(3, Side::Buy, dec!(100), dec!(3))).unwrap();
        book.insert(order(4, Side::Sell, dec!(102), dec!(5))).unwrap();
        book.insert(order(5, Side::Sell, dec!(101), dec!(1))).unwrap();

        assert_eq!(book.best_bid(), Some(dec!(100)));
        assert_eq!(book.best_ask(), Some(dec!(101)));
        assert_eq!(book.depth_at_price(Side::Buy, dec!(100)), dec!(5));
        assert_eq!(book.depth_at_price(Side::Sell, dec!(100)), dec!(0));
        assert_eq!(book.len(), 5);
    }

    #[test]
    fn test_front_respects_time_priority() {
        let mut book = OrderBook::new(pair());
        book.insert(order(7, Side::Sell, dec!(10), dec!(1))).unwrap();
        book.insert(order(3, Side::Sell, dec!(10), dec!(1))).unwrap();
        assert_eq!(book.front(Side::Sell).map(|o| o.hash), Some(H256::repeat_byte(7)));
    }

    #[test]
    fn test_remove_prunes_empty_level() {
        let mut book = OrderBook::new(pair());
        book.insert(order(1, Side::Sell, dec!(10), dec!(2))).unwrap();
        book.insert(order(2, Side::Sell, dec!(11), dec!(2))).unwrap();

        let removed = book.remove(&H256::repeat_byte(1)).unwrap();
        assert_eq!(removed.remaining, dec!(2));
        assert_eq!(book.best_ask(), Some(dec!(11)));
        assert!(book.snapshot().asks.iter().all(|l| l.price != dec!(10)));
        assert!(book.remove(&H256::repeat_byte(1)).is_none());
    }

    #[test]
    fn test_fill_front_partial_then_full() {
        let mut book = OrderBook::new(pair());
        book.insert(order(1, Side::Buy, dec!(100), dec!(10))).unwrap();

        let partial = book.fill_front(Side::Buy, dec!(4), 5).unwrap();
        assert_eq!(partial.remaining, dec!(6));
        assert_eq!(partial.status, OrderStatus::PartialFilled);
        assert_eq!(partial.fill_sequence, 2);
        assert_eq!(book.depth_at_price(Side::Buy, dec!(100)), dec!(6));

        let full = book.fill_front(Side::Buy, dec!(6), 6).unwrap();
        assert_eq!(full.status, OrderStatus::Filled);
        assert!(book.is_empty());
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn test_overfill_is_refused() {
        let mut book = OrderBook::new(pair());
        book.insert(order(1, Side::Buy, dec!(100), dec!(1))).unwrap();
        let err = book.fill_front(Side::Buy, dec!(2), 0).unwrap_err();
        assert!(matches!(err, BookError::Overfill { .. }));
        // Book untouched
        assert_eq!(book.depth_at_price(Side::Buy, dec!(100)), dec!(1));
    }

    #[test]
    fn test_insert_rejects_duplicates_and_closed_orders() {
        let mut book = OrderBook::new(pair());
        book.insert(order(1, Side::Buy, dec!(1), dec!(1))).unwrap();
        assert_eq!(
            book.insert(order(1, Side::Buy, dec!(1), dec!(1))),
            Err(BookError::Duplicate(H256::repeat_byte(1)))
        );

        let mut filled = order(2, Side::Buy, dec!(1), dec!(1));
        filled.remaining = dec!(0);
        filled.status = OrderStatus::Filled;
        assert!(matches!(
            book.insert(filled),
            Err(BookError::NotRestable { .. })
        ));
    }

    #[test]
    fn test_snapshot_and_raw_orders_ordering() {
        let mut book = OrderBook::new(pair());
        book.insert(order(1, Side::Buy, dec!(98), dec!(1))).unwrap();
        book.insert(order(2, Side::Buy, dec!(99), dec!(2))).unwrap();
        book.insert(order(3, Side::Buy, dec!(99), dec!(3))).unwrap();

        let snap = book.snapshot();
        assert_eq!(
            snap.bids,
            vec![
                LevelSummary { price: dec!(99), amount: dec!(5), orders: 2 },
                LevelSummary { price: dec!(98), amount: dec!(1), orders: 1 },
            ]
        );

        let raw: Vec<_> = book.raw_orders(Side::Buy).iter().map(|o| o.hash).collect();
        assert_eq!(
            raw,
            vec![H256::repeat_byte(2), H256::repeat_byte(3), H256::repeat_byte(1)]
        );
    }
}
