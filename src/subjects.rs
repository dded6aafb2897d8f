// Canonical subject catalog.
// Every topic lives under the `dex.` root so a single stream captures them all.

pub const STREAM_SUBJECTS: &str = "dex.>";

// -----------------------------------------------------------------------------
// ORDER FLOW (partitioned by pair key)
// -----------------------------------------------------------------------------

pub const ORDERS_IN_PREFIX: &str = "dex.orders.in";
pub const ORDERS_MATCHED_PREFIX: &str = "dex.orders.matched";

pub const ORDERS_IN_WILDCARD: &str = "dex.orders.in.>";
pub const ORDERS_MATCHED_WILDCARD: &str = "dex.orders.matched.>";

// -----------------------------------------------------------------------------
// SETTLEMENT & OPERATIONS
// -----------------------------------------------------------------------------

pub const TRADES_SETTLED: &str = "dex.trades.settled";
pub const OPERATOR_CONTROL: &str = "dex.operator.control";

pub fn orders_in(pair_key: &str) -> String {
    format!("{}.{}", ORDERS_IN_PREFIX, pair_key)
}

pub fn orders_matched(pair_key: &str) -> String {
    format!("{}.{}", ORDERS_MATCHED_PREFIX, pair_key)
}

/// NATS-style match: `>` swallows one or more trailing tokens, `*` exactly one.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}
