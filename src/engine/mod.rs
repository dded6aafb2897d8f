pub mod matching;
pub mod stop_book;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Order, OrderHash, Pair, Trade};

pub use matching::MatchingEngine;
pub use stop_book::StopBook;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The order hash has been seen by this engine before (redelivery).
    #[error("Order {0:?} was already processed")]
    DuplicateOrder(OrderHash),
    /// Fatal for the pair; matching stops until an operator resumes it.
    #[error("Matching invariant violated on {pair}: {detail}")]
    InvariantViolation { pair: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    /// The order went through matching (rested, filled, parked as stop or expired as market).
    Processed,
    Cancelled,
    Rejected,
}

/// Who produced the response. Intake rejections never held a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseOrigin {
    Intake,
    Engine,
}

/// Outcome of one processed order, published once on `orders.matched`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub pair: Pair,
    /// Per-pair, strictly increasing.
    pub sequence: u64,
    pub event: EngineEvent,
    pub origin: ResponseOrigin,
    /// Final state of the incoming order.
    pub order: Order,
    /// Trades in execution order.
    pub trades: Vec<Trade>,
    /// Final state of every resting order touched.
    pub matched_orders: Vec<Order>,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: i64,
}

impl EngineResponse {
    /// Rejection notice for an order that never reached a book.
    pub fn intake_rejection(order: Order, reason: String, now_ms: i64) -> Self {
        Self {
            pair: order.pair,
            sequence: 0,
            event: EngineEvent::Rejected,
            origin: ResponseOrigin::Intake,
            order,
            trades: Vec::new(),
            matched_orders: Vec::new(),
            reason: Some(reason),
            timestamp: now_ms,
        }
    }

    /// Every order state carried by this response, incoming first.
    pub fn touched_orders(&self) -> impl Iterator<Item = &Order> {
        std::iter::once(&self.order).chain(self.matched_orders.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFilled,
    AlreadyCancelled,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub order_hash: OrderHash,
    pub pair: Pair,
    pub outcome: CancelOutcome,
    /// Present only when the cancel took effect.
    #[serde(default)]
    pub response: Option<EngineResponse>,
}
