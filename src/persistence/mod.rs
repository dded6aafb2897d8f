pub mod memory;
pub mod redb_store;

use ethers::types::Address;

use crate::model::{Order, OrderHash, Trade, TradeHash};

pub use memory::InMemoryStore;
pub use redb_store::{RedbStore, StoreError};

/// Persisted order and trade records behind the lifecycle manager.
/// Writes are last-writer-wins; callers serialize read-modify-write cycles.
pub trait RecordStore: Send + Sync {
    fn put_order(&self, order: &Order) -> Result<(), StoreError>;
    fn get_order(&self, hash: &OrderHash) -> Result<Option<Order>, StoreError>;
    fn orders_by_owner(&self, owner: &Address) -> Result<Vec<Order>, StoreError>;

    fn put_trade(&self, trade: &Trade) -> Result<(), StoreError>;
    fn get_trade(&self, hash: &TradeHash) -> Result<Option<Trade>, StoreError>;
    fn trades(&self) -> Result<Vec<Trade>, StoreError>;

    fn save_metadata(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;
    fn load_metadata(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
}
