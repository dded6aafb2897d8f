use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

use crate::model::{Order, OrderHash, Side};

/// Watch set of untriggered stop orders, keyed by trigger price.
///
/// Buy stops fire once the last trade price rises to their stop price,
/// sell stops once it falls to it. Stops never enter the live book.
#[derive(Debug, Default)]
pub struct StopBook {
    buy_stops: BTreeMap<(Decimal, u64), Order>,
    sell_stops: BTreeMap<(Decimal, u64), Order>,
    index: HashMap<OrderHash, (Side, Decimal, u64)>,
    next_seq: u64,
}

impl StopBook {
    pub fn new() -> Self {
        Self::default()
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

    /// Returns false for orders without a stop price or already watched.
    pub fn insert(&mut self, order: Order) -> bool {
        let Some(stop) = order.stop_price else {
            return false;
        };
        if self.index.contains_key(&order.hash) {
            return false;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.index.insert(order.hash, (order.side, stop, seq));
        match order.side {
            Side::Buy => self.buy_stops.insert((stop, seq), order),
            Side::Sell => self.sell_stops.insert((stop, seq), order),
        };
        true
    }

    pub fn remove(&mut self, hash: &OrderHash) -> Option<Order> {
        let (side, stop, seq) = self.index.remove(hash)?;
        match side {
            Side::Buy => self.buy_stops.remove(&(stop, seq)),
            Side::Sell => self.sell_stops.remove(&(stop, seq)),
        }
    }

    pub fn get(&self, hash: &OrderHash) -> Option<&Order> {
        let (side, stop, seq) = self.index.get(hash)?;
        match side {
            Side::Buy => self.buy_stops.get(&(*stop, *seq)),
            Side::Sell => self.sell_stops.get(&(*stop, *seq)),
        }
    }

    /// Removes and returns every stop whose trigger is crossed by `last_price`,
    /// in arrival order.
    pub fn take_triggered(&mut self, last_price: Decimal) -> Vec<(u64, Order)> {
        // Buy stops with stop <= last stay in the lower half
        let untriggered = self.buy_stops.split_off(&(last_price, u64::MAX));
        let fired_buys = std::mem::replace(&mut self.buy_stops, untriggered);
        // Sell stops with stop >= last are the upper half
        let fired_sells = self.sell_stops.split_off(&(last_price, 0));

        let mut fired: Vec<(u64, Order)> = fired_buys
            .into_iter()
            .chain(fired_sells)
            .map(|((_, seq), order)| (seq, order))
            .collect();
        fired.sort_by_key(|(seq, _)| *seq);
        for (_, order) in &fired {
            self.index.remove(&order.hash);
        }
        fired
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.buy_stops.values().chain(self.sell_stops.values())
    }
}
