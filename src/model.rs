use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type OrderHash = H256;
pub type TradeHash = H256;

/// Base units per whole token used when hashing and settling amounts.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "STOP_LIMIT")]
    StopLimit,
    #[serde(rename = "STOP_MARKET")]
    StopMarket,
}

impl OrderType {
    pub fn is_stop(&self) -> bool {
        matches!(self, OrderType::StopLimit | OrderType::StopMarket)
    }

    pub fn is_market(&self) -> bool {
        matches!(self, OrderType::Market | OrderType::StopMarket)
    }

    /// The live order type a stop order becomes once its trigger fires.
    pub fn triggered(&self) -> Self {
        match self {
            OrderType::StopLimit => OrderType::Limit,
            OrderType::StopMarket => OrderType::Market,
            other => *other,
        }
    }

    fn code(&self) -> u8 {
        match self {
            OrderType::Limit => 0,
            OrderType::Market => 1,
            OrderType::StopLimit => 2,
            OrderType::StopMarket => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    PartialFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Statuses an order may hold while resting in the book.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartialFilled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Success,
    Failed,
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Liquidity role of an order in its most recent match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub base_token: Address,
    pub quote_token: Address,
}

impl Pair {
    pub fn new(base_token: Address, quote_token: Address) -> Self {
        Self {
            base_token,
            quote_token,
        }
    }

    /// Partition key used for routing and per-pair serialization.
    pub fn key(&self) -> String {
        format!("{:?}-{:?}", self.base_token, self.quote_token)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub hash: OrderHash,
    pub pair: Pair,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Limit price. For market orders this is the worst acceptable price,
    /// zero meaning unbounded (sells only).
    pub price: Decimal,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    pub amount: Decimal,
    pub remaining: Decimal,
    pub status: OrderStatus,
    #[serde(default)]
    pub role: Option<Role>,
    pub owner: Address,
    pub nonce: u64,
    #[serde(default)]
    pub signature: Option<Signature>,
    /// Bumped by the engine on every mutation. Consumers discard updates
    /// whose sequence is not greater than the one already applied.
    #[serde(default)]
    pub fill_sequence: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    pub fn filled_amount(&self) -> Decimal {
        self.amount - self.remaining
    }

    pub fn is_resting_candidate(&self) -> bool {
        self.status.is_open() && self.remaining > Decimal::ZERO
    }

    /// Content hash over the fields a user signs.
    pub fn compute_hash(&self, exchange: Address) -> Option<OrderHash> {
        let mut packed = Vec::with_capacity(4 * 20 + 5 * 32);
        packed.extend_from_slice(exchange.as_bytes());
        packed.extend_from_slice(self.owner.as_bytes());
        packed.extend_from_slice(self.pair.base_token.as_bytes());
        packed.extend_from_slice(self.pair.quote_token.as_bytes());
        push_word(&mut packed, to_base_units(self.amount, DEFAULT_TOKEN_DECIMALS)?);
        push_word(&mut packed, to_base_units(self.price, DEFAULT_TOKEN_DECIMALS)?);
        let stop = self.stop_price.unwrap_or(Decimal::ZERO);
        push_word(&mut packed, to_base_units(stop, DEFAULT_TOKEN_DECIMALS)?);
        push_word(&mut packed, U256::from(self.nonce));
        packed.push(self.side.code());
        packed.push(self.order_type.code());
        Some(H256::from(keccak256(&packed)))
    }

    /// Recovers the EIP-191 signer of the order hash and compares it to the owner.
    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(sig) => match sig.recover(self.hash.as_bytes()) {
                Ok(signer) => signer == self.owner,
                Err(_) => false,
            },
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderCancel {
    pub order_hash: OrderHash,
    pub pair: Pair,
    pub owner: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub hash: TradeHash,
    pub pair: Pair,
    pub maker_order_hash: OrderHash,
    pub taker_order_hash: OrderHash,
    pub maker: Address,
    pub taker: Address,
    pub taker_side: Side,
    /// Always the resting order's price.
    pub price: Decimal,
    pub amount: Decimal,
    pub status: TradeStatus,
    #[serde(default)]
    pub tx_hash: Option<H256>,
    /// Engine sequence of the match that produced this trade.
    pub sequence: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Trade {
    pub fn new(maker: &Order, taker: &Order, amount: Decimal, sequence: u64, now_ms: i64) -> Self {
        let mut packed = Vec::with_capacity(2 * 32 + 3 * 32);
        packed.extend_from_slice(maker.hash.as_bytes());
        packed.extend_from_slice(taker.hash.as_bytes());
        push_word(
            &mut packed,
            to_base_units(amount, DEFAULT_TOKEN_DECIMALS).unwrap_or_default(),
        );
        push_word(
            &mut packed,
            to_base_units(maker.price, DEFAULT_TOKEN_DECIMALS).unwrap_or_default(),
        );
        push_word(&mut packed, U256::from(sequence));

        Self {
            hash: H256::from(keccak256(&packed)),
            pair: maker.pair,
            maker_order_hash: maker.hash,
            taker_order_hash: taker.hash,
            maker: maker.owner,
            taker: taker.owner,
            taker_side: taker.side,
            price: maker.price,
            amount,
            status: TradeStatus::Pending,
            tx_hash: None,
            sequence,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Quote value of the trade.
    pub fn notional(&self) -> Decimal {
        self.amount * self.price
    }
}

fn push_word(buf: &mut Vec<u8>, value: U256) {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    buf.extend_from_slice(&word);
}

/// Scales a decimal token amount into integer base units, truncating any
/// precision finer than `decimals`. Returns `None` on negative input or overflow.
pub fn to_base_units(value: Decimal, decimals: u32) -> Option<U256> {
    if value.is_sign_negative() {
        return None;
    }
    let factor = Decimal::from(10u64.checked_pow(decimals)?);
    let scaled = value.checked_mul(factor)?.trunc();
    scaled.to_u128().map(U256::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        Order {
            hash: H256::zero(),
            pair: Pair::new(Address::repeat_byte(0x11), Address::repeat_byte(0x22)),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: dec!(100),
            stop_price: None,
            amount: dec!(10),
            remaining: dec!(10),
            status: OrderStatus::Open,
            role: None,
            owner: Address::repeat_byte(0x33),
            nonce: 1,
            signature: None,
            fill_sequence: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_hash_is_content_derived() {
        let exchange = Address::repeat_byte(0x44);
        let a = sample_order();
        let mut b = sample_order();
        assert_eq!(a.compute_hash(exchange), b.compute_hash(exchange));

        b.nonce = 2;
        assert_ne!(a.compute_hash(exchange), b.compute_hash(exchange));

        // Remaining quantity and status are not part of the signed content
        let mut c = sample_order();
        c.remaining = dec!(3);
        c.status = OrderStatus::PartialFilled;
        assert_eq!(a.compute_hash(exchange), c.compute_hash(exchange));
    }

    #[test]
    fn test_base_units_conversion() {
        assert_eq!(to_base_units(dec!(1), 18), Some(U256::exp10(18)));
        assert_eq!(to_base_units(dec!(0.5), 2), Some(U256::from(50u64)));
        assert_eq!(to_base_units(dec!(0.001), 2), Some(U256::zero()));
        assert_eq!(to_base_units(dec!(-1), 18), None);
    }

    #[test]
    fn test_trade_takes_maker_price() {
        let maker = sample_order();
        let mut taker = sample_order();
        taker.hash = H256::repeat_byte(0x01);
        taker.side = Side::Sell;
        taker.price = dec!(90);

        let trade = Trade::new(&maker, &taker, dec!(4), 1, 0);
        assert_eq!(trade.price, dec!(100));
        assert_eq!(trade.notional(), dec!(400));
        assert_eq!(trade.taker_side, Side::Sell);
        assert_eq!(trade.status, TradeStatus::Pending);
    }

    #[test]
    fn test_status_families() {
        assert!(OrderStatus::Open.is_open());
        assert!(OrderStatus::PartialFilled.is_open());
        assert!(!OrderStatus::Filled.is_open());
        assert!(OrderStatus::Rejected.is_terminal());
        assert_eq!(OrderType::StopMarket.triggered(), OrderType::Market);
    }
}
