/// Order and trade lifecycle state machines.
///
/// State Diagram:
/// ```text
///   Order:  Open ──→ PartialFilled ⟲ ──→ Filled
///             │            │
///             │            └────────────→ Cancelled
///             ├──→ Filled / Cancelled / Rejected
///             ⟲ (stop conversion, resting)
///
///   Trade:  Pending ⟲ (tx hash stamped) ──→ Success | Failed
///
///   Terminal states: Filled, Cancelled, Rejected, Success, Failed
/// ```
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::error;

use crate::model::{Order, OrderHash, OrderStatus, Trade, TradeHash, TradeStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("Illegal order transition for {hash:?}: {from} → {to}")]
    IllegalOrderStatus {
        hash: OrderHash,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("Remaining of {hash:?} would grow from {from} to {to}")]
    RemainingIncreased {
        hash: OrderHash,
        from: Decimal,
        to: Decimal,
    },
    #[error("Illegal trade transition for {hash:?}: {from} → {to}")]
    IllegalTradeStatus {
        hash: TradeHash,
        from: TradeStatus,
        to: TradeStatus,
    },
}

impl OrderStatus {
    /// Returns the set of states reachable from this state.
    pub fn valid_transitions(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Open => &[Open, PartialFilled, Filled, Cancelled, Rejected],
            PartialFilled => &[PartialFilled, Filled, Cancelled],
            // Terminal states cannot transition
            Filled => &[],
            Cancelled => &[],
            Rejected => &[],
        }
    }

    pub fn can_transition_to(&self, next: &OrderStatus) -> bool {
        self.valid_transitions().contains(next)
    }
}

impl TradeStatus {
    pub fn valid_transitions(&self) -> &'static [TradeStatus] {
        use TradeStatus::*;
        match self {
            Pending => &[Pending, Success, Failed],
            Success => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: &TradeStatus) -> bool {
        self.valid_transitions().contains(next)
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }
}

/// Validates replacing `current` with `next` for the same order.
pub fn check_order_update(current: &Order, next: &Order) -> Result<(), TransitionError> {
    if !current.status.can_transition_to(&next.status) {
        let err = TransitionError::IllegalOrderStatus {
            hash: current.hash,
            from: current.status,
            to: next.status,
        };
        error!("{}", err);
        return Err(err);
    }
    if next.remaining > current.remaining {
        let err = TransitionError::RemainingIncreased {
            hash: current.hash,
            from: current.remaining,
            to: next.remaining,
        };
        error!("{}", err);
        return Err(err);
    }
    Ok(())
}

pub fn check_trade_update(current: &Trade, next: TradeStatus) -> Result<(), TransitionError> {
    if !current.status.can_transition_to(&next) {
        return Err(TransitionError::IllegalTradeStatus {
            hash: current.hash,
            from: current.status,
            to: next,
        });
    }
    Ok(())
}
