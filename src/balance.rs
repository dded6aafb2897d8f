use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Order, OrderHash, OrderStatus, Side};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Malformed order: {0}")]
    Malformed(String),
    #[error("Order hash mismatch: computed {computed:?}, submitted {submitted:?}")]
    HashMismatch {
        computed: OrderHash,
        submitted: OrderHash,
    },
    #[error("Signature does not recover to owner for order {0:?}")]
    InvalidSignature(OrderHash),
    #[error("Stale nonce {nonce} for {owner:?} (last accepted {last})")]
    StaleNonce { owner: Address, nonce: u64, last: u64 },
    #[error("Insufficient balance of {token:?} for {owner:?}: required {required}, available {available}")]
    InsufficientBalance {
        owner: Address,
        token: Address,
        required: Decimal,
        available: Decimal,
    },
    #[error("Unlock of {amount} exceeds locked {locked} of {token:?} for {owner:?}")]
    UnlockExceedsLocked {
        owner: Address,
        token: Address,
        amount: Decimal,
        locked: Decimal,
    },
    #[error("Order {order:?} is not owned by {caller:?}")]
    NotOwner { order: OrderHash, caller: Address },
    #[error("Balance store error: {0}")]
    Store(String),
}

/// Account bookkeeping collaborator. Only the lock contract is used by the core.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn lock(&self, owner: Address, token: Address, amount: Decimal)
    -> Result<(), ValidationError>;
    async fn unlock(
        &self,
        owner: Address,
        token: Address,
        amount: Decimal,
    ) -> Result<(), ValidationError>;
    async fn locked_balance(&self, owner: Address, token: Address)
    -> Result<Decimal, ValidationError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccountBalance {
    pub available: Decimal,
    pub locked: Decimal,
}

/// Balance store held in process memory, used by tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryBalanceStore {
    accounts: DashMap<(Address, Address), AccountBalance>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&self, owner: Address, token: Address, amount: Decimal) {
        self.accounts.entry((owner, token)).or_default().available += amount;
    }

    pub fn balance(&self, owner: Address, token: Address) -> AccountBalance {
        self.accounts
            .get(&(owner, token))
            .map(|b| *b)
            .unwrap_or_default()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn lock(
        &self,
        owner: Address,
        token: Address,
        amount: Decimal,
    ) -> Result<(), ValidationError> {
        let mut entry = self.accounts.entry((owner, token)).or_default();
        if entry.available < amount {
            return Err(ValidationError::InsufficientBalance {
                owner,
                token,
                required: amount,
                available: entry.available,
            });
        }
        entry.available -= amount;
        entry.locked += amount;
        Ok(())
    }

    async fn unlock(
        &self,
        owner: Address,
        token: Address,
        amount: Decimal,
    ) -> Result<(), ValidationError> {
        let mut entry = self.accounts.entry((owner, token)).or_default();
        if entry.locked < amount {
            return Err(ValidationError::UnlockExceedsLocked {
                owner,
                token,
                amount,
                locked: entry.locked,
            });
        }
        entry.locked -= amount;
        entry.available += amount;
        Ok(())
    }

    async fn locked_balance(
        &self,
        owner: Address,
        token: Address,
    ) -> Result<Decimal, ValidationError> {
        Ok(self.balance(owner, token).locked)
    }
}

/// Per-owner replay guard: a nonce is accepted only if it is greater than
/// every nonce accepted before it for the same owner.
#[derive(Debug, Default)]
pub struct NonceGuard {
    last_nonces: DashMap<Address, u64>,
}

impl NonceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_advance(&self, owner: Address, nonce: u64) -> Result<(), ValidationError> {
        let mut entry = self.last_nonces.entry(owner).or_insert(0);
        if nonce <= *entry {
            return Err(ValidationError::StaleNonce {
                owner,
                nonce,
                last: *entry,
            });
        }
        *entry = nonce;
        Ok(())
    }

    /// Smallest nonce the guard would accept next for `owner`.
    pub fn next_nonce(&self, owner: &Address) -> u64 {
        self.last_nonces.get(owner).map(|n| *n + 1).unwrap_or(1)
    }
}

/// Locks funds for an order before it may reach the engine.
///
/// A sell reserves its base quantity. A buy reserves quantity times its limit
/// price (the worst price for market buys) in quote. Releases use the same
/// formula for the released quantity, so a fully released order nets to zero.
#[derive(Clone)]
pub struct BalanceValidator {
    store: Arc<dyn BalanceStore>,
}

impl BalanceValidator {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        Self { store }
    }

    /// Token and amount backing `qty` of `order`.
    pub fn lock_requirement(order: &Order, qty: Decimal) -> (Address, Decimal) {
        match order.side {
            Side::Sell => (order.pair.base_token, qty),
            Side::Buy => (order.pair.quote_token, qty * order.price),
        }
    }

    /// Field checks that do not need any external state.
    pub fn check_shape(order: &Order) -> Result<(), ValidationError> {
        if order.amount <= Decimal::ZERO {
            return Err(ValidationError::Malformed("amount must be positive".into()));
        }
        if order.remaining != order.amount {
            return Err(ValidationError::Malformed(
                "new order must be unfilled".into(),
            ));
        }
        if order.status != OrderStatus::Open || order.fill_sequence != 0 {
            return Err(ValidationError::Malformed(
                "new order must be OPEN with no fills".into(),
            ));
        }
        if order.price < Decimal::ZERO {
            return Err(ValidationError::Malformed("negative price".into()));
        }
        if order.price.is_zero() && (!order.order_type.is_market() || order.side == Side::Buy) {
            // Only market sells may go without a price bound; buys need one to size the lock
            return Err(ValidationError::Malformed("price required".into()));
        }
        if order.order_type.is_stop() && !order.stop_price.is_some_and(|p| p > Decimal::ZERO) {
            return Err(ValidationError::Malformed("stop price required".into()));
        }
        if order.pair.base_token == order.pair.quote_token {
            return Err(ValidationError::Malformed("base and quote tokens are equal".into()));
        }
        Ok(())
    }

    pub async fn validate_and_lock(&self, order: &Order) -> Result<(), ValidationError> {
        Self::check_shape(order)?;
        let (token, amount) = Self::lock_requirement(order, order.remaining);
        self.store.lock(order.owner, token, amount).await?;
        debug!(order_hash = ?order.hash, token = ?token, amount = %amount, "Balance locked");
        Ok(())
    }

    /// Releases the lock backing `qty` of `order`.
    pub async fn release(&self, order: &Order, qty: Decimal) -> Result<(), ValidationError> {
        if qty <= Decimal::ZERO {
            return Ok(());
        }
        let (token, amount) = Self::lock_requirement(order, qty);
        if let Err(e) = self.store.unlock(order.owner, token, amount).await {
            warn!(order_hash = ?order.hash, error = %e, "Balance release failed");
            return Err(e);
        }
        debug!(order_hash = ?order.hash, token = ?token, amount = %amount, "Balance released");
        Ok(())
    }

    pub async fn locked_balance(
        &self,
        owner: Address,
        token: Address,
    ) -> Result<Decimal, ValidationError> {
        self.store.locked_balance(owner, token).await
    }
}
