use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;

use crate::model::{Order, OrderHash, Trade, TradeHash};
use crate::persistence::{RecordStore, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    orders: DashMap<OrderHash, Order>,
    owners: DashMap<Address, BTreeSet<OrderHash>>,
    trades: DashMap<TradeHash, Trade>,
    metadata: DashMap<String, serde_json::Value>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryStore {
    fn put_order(&self, order: &Order) -> Result<(), StoreError> {
        self.owners.entry(order.owner).or_default().insert(order.hash);
        self.orders.insert(order.hash, order.clone());
        Ok(())
    }

    fn get_order(&self, hash: &OrderHash) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(hash).map(|o| o.clone()))
    }

    fn orders_by_owner(&self, owner: &Address) -> Result<Vec<Order>, StoreError> {
        let hashes: Vec<OrderHash> = self
            .owners
            .get(owner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Ok(hashes
            .iter()
            .filter_map(|h| self.orders.get(h).map(|o| o.clone()))
            .collect())
    }

    fn put_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades.insert(trade.hash, trade.clone());
        Ok(())
    }

    fn get_trade(&self, hash: &TradeHash) -> Result<Option<Trade>, StoreError> {
        Ok(self.trades.get(hash).map(|t| t.clone()))
    }

    fn trades(&self) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self.trades.iter().map(|t| t.value().clone()).collect();
        trades.sort_by_key(|t| (t.created_at, t.sequence));
        Ok(trades)
    }

    fn save_metadata(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.metadata.insert(key.to_string(), value);
        Ok(())
    }

    fn load_metadata(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.metadata.get(key).map(|v| v.clone()))
    }
}
