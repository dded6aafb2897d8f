//! Payloads carried on the router topics.

use ethers::types::H256;
use serde::{Deserialize, Serialize};

use crate::engine::{CancelResponse, EngineResponse};
use crate::model::{Order, OrderCancel, Pair, Trade};

/// `orders.in`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderMessage {
    New(Order),
    Cancel(OrderCancel),
}

impl OrderMessage {
    pub fn pair(&self) -> &Pair {
        match self {
            OrderMessage::New(order) => &order.pair,
            OrderMessage::Cancel(cancel) => &cancel.pair,
        }
    }
}

/// `orders.matched`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineMessage {
    Response(EngineResponse),
    /// A cancel that changed nothing (already filled, cancelled or unknown).
    CancelReport(CancelResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    #[serde(rename = "TRADES_PENDING")]
    Pending,
    #[serde(rename = "TRADES_SUCCESS")]
    Success,
    #[serde(rename = "TRADES_FAILED")]
    Failed,
}

/// `trades.settled`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementMessage {
    pub batch_id: String,
    pub status: SettlementStatus,
    pub trades: Vec<Trade>,
    #[serde(default)]
    pub tx_hash: Option<H256>,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    InvariantViolation,
    StuckTransaction,
    LowOperatorBalance,
    SettlementFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    #[serde(default)]
    pub pair_key: Option<String>,
    #[serde(default)]
    pub nonce: Option<u64>,
    pub timestamp: i64,
}

/// `operator.control`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    HaltPair { pair_key: String, reason: String },
    ResumePair { pair_key: String },
    /// Clears a settlement escalation after manual nonce recovery.
    ResumeSettlement,
    Alert(Alert),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_format() {
        let msg = ControlMessage::HaltPair {
            pair_key: "a-b".into(),
            reason: "manual".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["command"], "HALT_PAIR");
        assert_eq!(json["pair_key"], "a-b");

        let alert: ControlMessage = serde_json::from_str(
            r#"{"command":"ALERT","kind":"LOW_OPERATOR_BALANCE","message":"low","timestamp":1}"#,
        )
        .unwrap();
        assert!(matches!(
            alert,
            ControlMessage::Alert(Alert { kind: AlertKind::LowOperatorBalance, .. })
        ));
    }

    #[test]
    fn test_settlement_status_names() {
        assert_eq!(
            serde_json::to_string(&SettlementStatus::Pending).unwrap(),
            "\"TRADES_PENDING\""
        );
        assert_eq!(
            serde_json::to_string(&SettlementStatus::Failed).unwrap(),
            "\"TRADES_FAILED\""
        );
    }
}
