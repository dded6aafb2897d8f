use std::collections::{HashSet, VecDeque};

use crate::model::{Trade, TradeHash};

/// Groups trades into batches bounded by count and by the age of the
/// oldest queued trade.
#[derive(Debug)]
pub struct Batcher {
    max_size: usize,
    max_wait_ms: i64,
    queue: VecDeque<(i64, Trade)>,
    queued: HashSet<TradeHash>,
}

impl Batcher {
    pub fn new(max_size: usize, max_wait_ms: u64) -> Self {
        Self {
            max_size: max_size.max(1),
            max_wait_ms: max_wait_ms as i64,
            queue: VecDeque::new(),
            queued: HashSet::new(),
        }
    }

    /// Returns false if the trade is already queued.
    pub fn push(&mut self, trade: Trade, now_ms: i64) -> bool {
        if !self.queued.insert(trade.hash) {
            return false;
        }
        self.queue.push_back((now_ms, trade));
        true
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// When the oldest queued trade forces a flush.
    pub fn deadline(&self) -> Option<i64> {
        self.queue.front().map(|(at, _)| at + self.max_wait_ms)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.queue.len() >= self.max_size || self.deadline().is_some_and(|d| now_ms >= d)
    }

    /// Queued trades, oldest first.
    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.queue.iter().map(|(_, t)| t)
    }

    /// Next batch, if the size or age bound has been reached.
    pub fn take_due(&mut self, now_ms: i64) -> Option<Vec<Trade>> {
        if !self.is_due(now_ms) {
            return None;
        }
        self.take_next()
    }

    /// Next batch regardless of the bounds, for draining on shutdown.
    pub fn take_next(&mut self) -> Option<Vec<Trade>> {
        if self.queue.is_empty() {
            return None;
        }
        let n = self.queue.len().min(self.max_size);
        let batch: Vec<Trade> = self.queue.drain(..n).map(|(_, t)| t).collect();
        for trade in &batch {
            self.queued.remove(&trade.hash);
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Order, OrderStatus, OrderType, Pair, Side};
    use ethers::types::{Address, H256};
    use rust_decimal_macros::dec;

    fn trade(id: u8) -> Trade {
        let order = |b: u8, side| Order {
            hash: H256::repeat_byte(b),
            pair: Pair::new(Address::repeat_byte(1), Address::repeat_byte(2)),
            side,
            order_type: OrderType::Limit,
            price: dec!(1),
            stop_price: None,
            amount: dec!(1),
            remaining: dec!(1),
            status: OrderStatus::Open,
            role: None,
            owner: Address::repeat_byte(b),
            nonce: 1,
            signature: None,
            fill_sequence: 1,
            created_at: 0,
            updated_at: 0,
        };
        Trade::new(&order(id, Side::Buy), &order(id + 100, Side::Sell), dec!(1), id as u64, 0)
    }

    #[test]
    fn test_size_bound_flushes_in_arrival_order() {
        let mut b = Batcher::new(2, 1_000);
        b.push(trade(1), 0);
        assert!(b.take_due(0).is_none());
        b.push(trade(2), 1);
        b.push(trade(3), 2);

        let batch = b.take_due(2).unwrap();
        assert_eq!(batch.iter().map(|t| t.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_age_bound_flushes_partial_batch() {
        let mut b = Batcher::new(10, 500);
        b.push(trade(1), 100);
        assert_eq!(b.deadline(), Some(600));
        assert!(b.take_due(599).is_none());
        assert_eq!(b.take_due(600).unwrap().len(), 1);
        assert!(b.is_empty());
        assert_eq!(b.deadline(), None);
    }

    #[test]
    fn test_take_next_ignores_bounds() {
        let mut b = Batcher::new(2, 60_000);
        for id in 1..=3 {
            b.push(trade(id), 0);
        }
        b.take_due(0).unwrap();
        assert!(b.take_due(1).is_none());
        let rest = b.take_next().unwrap();
        assert_eq!(rest[0].sequence, 3);
        assert!(b.take_next().is_none());
    }

    #[test]
    fn test_duplicate_trade_is_queued_once() {
        let mut b = Batcher::new(10, 0);
        assert!(b.push(trade(1), 0));
        assert!(!b.push(trade(1), 0));
        assert_eq!(b.take_due(0).unwrap().len(), 1);
        // Once handed out it may be queued again
        assert!(b.push(trade(1), 1));
    }
}
