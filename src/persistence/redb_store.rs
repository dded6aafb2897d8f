use ethers::types::Address;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::model::{Order, OrderHash, Trade, TradeHash};
use crate::persistence::RecordStore;

// Tables
const ORDERS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("orders");
const TRADES_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("trades");
/// `<owner>:<order hash>` -> unit, scanned by owner prefix.
const OWNER_INDEX_TABLE: TableDefinition<&str, u8> = TableDefinition::new("owner_orders");
const METADATA_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("metadata");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redb error: {0}")]
    Redb(#[from] redb::Error),
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn hash_key(hash: &OrderHash) -> String {
    format!("{:?}", hash)
}

fn owner_prefix(owner: &Address) -> String {
    format!("{:?}:", owner)
}

/// Durable record store on a single redb file.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        // Read transactions fail on tables that were never created
        let txn = db.begin_write()?;
        {
            txn.open_table(ORDERS_TABLE)?;
            txn.open_table(TRADES_TABLE)?;
            txn.open_table(OWNER_INDEX_TABLE)?;
            txn.open_table(METADATA_TABLE)?;
        }
        txn.commit()?;
        info!("📦 Redb Database opened");
        Ok(Self { db: Arc::new(db) })
    }

    fn put_json(
        &self,
        table: TableDefinition<'static, &'static str, Vec<u8>>,
        key: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table)?;
            table.insert(key, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get_raw(
        &self,
        table: TableDefinition<'static, &'static str, Vec<u8>>,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table)?;
        let value = table.get(key)?.map(|v| v.value());
        Ok(value)
    }
}

impl RecordStore for RedbStore {
    fn put_order(&self, order: &Order) -> Result<(), StoreError> {
        let key = hash_key(&order.hash);
        let data = serde_json::to_vec(order)?;
        let index_key = format!("{}{}", owner_prefix(&order.owner), key);

        let txn = self.db.begin_write()?;
        {
            let mut orders = txn.open_table(ORDERS_TABLE)?;
            orders.insert(key.as_str(), data)?;
            let mut index = txn.open_table(OWNER_INDEX_TABLE)?;
            index.insert(index_key.as_str(), 0u8)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get_order(&self, hash: &OrderHash) -> Result<Option<Order>, StoreError> {
        self.get_raw(ORDERS_TABLE, &hash_key(hash))?
            .map(|v| serde_json::from_slice::<Order>(&v))
            .transpose()
            .map_err(StoreError::from)
    }

    fn orders_by_owner(&self, owner: &Address) -> Result<Vec<Order>, StoreError> {
        let prefix = owner_prefix(owner);
        let txn = self.db.begin_read()?;
        let index = txn.open_table(OWNER_INDEX_TABLE)?;
        let orders = txn.open_table(ORDERS_TABLE)?;

        let mut items = Vec::new();
        for res in index.range::<&str>(prefix.as_str()..)? {
            let (k, _) = res?;
            let composite = k.value();
            let Some(hash) = composite.strip_prefix(prefix.as_str()) else {
                break;
            };
            if let Some(v) = orders.get(hash)? {
                items.push(serde_json::from_slice::<Order>(&v.value())?);
            }
        }
        Ok(items)
    }

    fn put_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let data = serde_json::to_vec(trade)?;
        self.put_json(TRADES_TABLE, &hash_key(&trade.hash), data)
    }

    fn get_trade(&self, hash: &TradeHash) -> Result<Option<Trade>, StoreError> {
        self.get_raw(TRADES_TABLE, &hash_key(hash))?
            .map(|v| serde_json::from_slice::<Trade>(&v))
            .transpose()
            .map_err(StoreError::from)
    }

    fn trades(&self) -> Result<Vec<Trade>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TRADES_TABLE)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let item: Trade = serde_json::from_slice(&v.value())?;
            items.push(item);
        }
        items.sort_by_key(|t| (t.created_at, t.sequence));
        Ok(items)
    }

    fn save_metadata(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let data = serde_json::to_vec(&value)?;
        self.put_json(METADATA_TABLE, key, data)
    }

    fn load_metadata(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.get_raw(METADATA_TABLE, key)?
            .map(|v| serde_json::from_slice::<serde_json::Value>(&v))
            .transpose()
            .map_err(StoreError::from)
    }
}
