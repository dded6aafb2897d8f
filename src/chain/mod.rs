//! Chain client collaborator.
//!
//! Every call is a fallible remote call with no implicit retry; retry and
//! backoff belong to the settlement operator.

pub mod simulated;

use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::model::{to_base_units, Trade};

pub use simulated::SimulatedChain;

const LOG_CHANNEL_CAPACITY: usize = 256;

// Settlement entry point of the exchange contract
abigen!(
    ExchangeContract,
    r#"[
        {
          "inputs": [
            { "internalType": "bytes32[]", "name": "makerOrderHashes", "type": "bytes32[]" },
            { "internalType": "bytes32[]", "name": "takerOrderHashes", "type": "bytes32[]" },
            { "internalType": "uint256[]", "name": "amounts", "type": "uint256[]" },
            { "internalType": "uint256[]", "name": "prices", "type": "uint256[]" }
          ],
          "name": "executeBatchTrades",
          "outputs": [],
          "stateMutability": "nonpayable",
          "type": "function"
        }
    ]"#
);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Gas estimation failed: {0}")]
    GasEstimation(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Signing error: {0}")]
    Signing(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, ChainError>;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError>;
    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError>;
    async fn get_pending_nonce(&self, account: Address) -> Result<U256, ChainError>;
    async fn get_balance(&self, account: Address) -> Result<U256, ChainError>;
    /// Logs matching `filter`, delivered until the receiver is dropped.
    async fn subscribe_logs(&self, filter: Filter) -> Result<mpsc::Receiver<Log>, ChainError>;
    async fn gas_price(&self) -> Result<U256, ChainError>;
}

/// Calldata for `executeBatchTrades` over `trades`, in batch order.
pub fn encode_batch_call(trades: &[Trade], decimals: u32) -> Result<Bytes, ChainError> {
    let mut call = ExecuteBatchTradesCall {
        maker_order_hashes: Vec::with_capacity(trades.len()),
        taker_order_hashes: Vec::with_capacity(trades.len()),
        amounts: Vec::with_capacity(trades.len()),
        prices: Vec::with_capacity(trades.len()),
    };
    for trade in trades {
        let amount = to_base_units(trade.amount, decimals).ok_or_else(|| {
            ChainError::Encoding(format!("amount {} of {:?}", trade.amount, trade.hash))
        })?;
        let price = to_base_units(trade.price, decimals).ok_or_else(|| {
            ChainError::Encoding(format!("price {} of {:?}", trade.price, trade.hash))
        })?;
        call.maker_order_hashes.push(trade.maker_order_hash.0);
        call.taker_order_hashes.push(trade.taker_order_hash.0);
        call.amounts.push(amount);
        call.prices.push(price);
    }
    Ok(Bytes::from(call.encode()))
}

/// JSON-RPC client over a websocket provider.
pub struct EthersChainClient {
    provider: Arc<Provider<Ws>>,
}

impl EthersChainClient {
    pub async fn connect(url: &str) -> Result<Self, ChainError> {
        let provider = Provider::<Ws>::connect(url).await.map_err(|e| {
            error!("❌ Failed to connect to chain RPC at {}: {}", url, e);
            ChainError::Configuration(format!("Invalid RPC URL: {}", e))
        })?;
        info!("✅ Connected to chain RPC at {}", url);
        Ok(Self {
            provider: Arc::new(provider),
        })
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, ChainError> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| ChainError::GasEstimation(e.to_string()))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn get_pending_nonce(&self, account: Address) -> Result<U256, ChainError> {
        self.provider
            .get_transaction_count(account, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn get_balance(&self, account: Address) -> Result<U256, ChainError> {
        self.provider
            .get_balance(account, None)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn subscribe_logs(&self, filter: Filter) -> Result<mpsc::Receiver<Log>, ChainError> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let mut stream = match provider.subscribe_logs(&filter).await {
                Ok(s) => s,
                Err(e) => {
                    error!("❌ Log subscription failed: {}", e);
                    return;
                }
            };
            while let Some(log) = stream.next().await {
                if tx.send(log).await.is_err() {
                    break;
                }
            }
            warn!("Log subscription ended");
        });
        Ok(rx)
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Order, OrderStatus, OrderType, Pair, Side};
    use ethers::abi::AbiDecode;
    use rust_decimal_macros::dec;

    fn order(id: u8, side: Side) -> Order {
        Order {
            hash: H256::repeat_byte(id),
            pair: Pair::new(Address::repeat_byte(1), Address::repeat_byte(2)),
            side,
            order_type: OrderType::Limit,
            price: dec!(1.5),
            stop_price: None,
            amount: dec!(2),
            remaining: dec!(2),
            status: OrderStatus::Open,
            role: None,
            owner: Address::repeat_byte(id),
            nonce: 1,
            signature: None,
            fill_sequence: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_batch_calldata_preserves_trade_order() {
        let t1 = Trade::new(&order(1, Side::Buy), &order(2, Side::Sell), dec!(1), 1, 0);
        let t2 = Trade::new(&order(3, Side::Sell), &order(4, Side::Buy), dec!(0.5), 2, 0);

        let data = encode_batch_call(&[t1.clone(), t2.clone()], 18).unwrap();
        let decoded = ExecuteBatchTradesCall::decode(data.as_ref()).unwrap();
        assert_eq!(decoded.maker_order_hashes, vec![[1u8; 32], [3u8; 32]]);
        assert_eq!(decoded.taker_order_hashes, vec![[2u8; 32], [4u8; 32]]);
        assert_eq!(decoded.amounts[1], U256::exp10(17) * 5);
        assert_eq!(decoded.prices[0], U256::exp10(17) * 15);
    }
}
