use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

// --- Matching ---

pub static ORDERS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dex_core_orders_processed_total",
        "Total orders processed by the matching engine"
    )
    .expect("orders_processed counter")
});

pub static ORDERS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dex_core_orders_rejected_total",
        "Total orders rejected, by stage",
        &["stage"]
    )
    .expect("orders_rejected counter")
});

pub static TRADES_MATCHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dex_core_trades_matched_total", "Total trades produced")
        .expect("trades_matched counter")
});

pub static MATCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "dex_core_match_latency_seconds",
        "Time spent inside the pair actor per order message",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
    )
    .expect("match_latency histogram")
});

pub static HALTED_PAIRS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("dex_core_halted_pairs", "Pairs currently halted")
        .expect("halted_pairs gauge")
});

// --- Router ---

pub static REDELIVERIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dex_core_redeliveries_total",
        "Messages received with a delivery attempt above one"
    )
    .expect("redeliveries counter")
});

pub static DUPLICATES_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dex_core_duplicates_skipped_total",
        "Already-applied updates discarded by consumers"
    )
    .expect("duplicates_skipped counter")
});

// --- Settlement ---

pub static SETTLEMENT_BATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dex_core_settlement_batches_total",
        "Settlement batches by outcome",
        &["outcome"]
    )
    .expect("settlement_batches counter")
});

pub static PENDING_TRANSACTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "dex_core_pending_transactions",
        "Settlement transactions awaiting a receipt"
    )
    .expect("pending_transactions gauge")
});

pub static REPLACEMENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dex_core_tx_replacements_total",
        "Same-nonce replacement transactions sent"
    )
    .expect("replacements counter")
});

pub static SETTLEMENT_STALLED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "dex_core_settlement_stalled",
        "1 while the operator waits for manual nonce recovery"
    )
    .expect("settlement_stalled gauge")
});

pub fn inc_orders_processed() {
    ORDERS_PROCESSED.inc();
}

pub fn inc_orders_rejected(stage: &str) {
    ORDERS_REJECTED.with_label_values(&[stage]).inc();
}

pub fn inc_trades_matched(count: u64) {
    TRADES_MATCHED.inc_by(count);
}

pub fn observe_match_latency(duration_sec: f64) {
    MATCH_LATENCY.observe(duration_sec);
}

pub fn set_halted_pairs(count: i64) {
    HALTED_PAIRS.set(count);
}

pub fn inc_redeliveries() {
    REDELIVERIES.inc();
}

pub fn inc_duplicates_skipped(count: u64) {
    DUPLICATES_SKIPPED.inc_by(count);
}

pub fn inc_settlement_batches(outcome: &str) {
    SETTLEMENT_BATCHES.with_label_values(&[outcome]).inc();
}

pub fn set_pending_transactions(count: i64) {
    PENDING_TRANSACTIONS.set(count);
}

pub fn inc_replacements() {
    REPLACEMENTS.inc();
}

pub fn set_settlement_stalled(stalled: bool) {
    SETTLEMENT_STALLED.set(i64::from(stalled));
}

/// Text exposition of the default registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
