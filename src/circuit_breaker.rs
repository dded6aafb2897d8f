use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Halt state for matching.
/// A pair is halted after a matching invariant violation and stays halted
/// until an operator resumes it; the global flag stops every pair at once.
#[derive(Debug, Default)]
pub struct HaltRegistry {
    global: AtomicBool,
    pairs: DashMap<String, String>,
}

impl HaltRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_halted(&self, pair_key: &str) -> bool {
        self.global.load(Ordering::SeqCst) || self.pairs.contains_key(pair_key)
    }

    /// Reason recorded for a halted pair, if any.
    pub fn reason(&self, pair_key: &str) -> Option<String> {
        if let Some(reason) = self.pairs.get(pair_key) {
            return Some(reason.value().clone());
        }
        if self.global.load(Ordering::SeqCst) {
            return Some("global halt".to_string());
        }
        None
    }

    pub fn halt_pair(&self, pair_key: &str, reason: &str) {
        let prev = self.pairs.insert(pair_key.to_string(), reason.to_string());
        if prev.is_none() {
            warn!(pair = %pair_key, reason = %reason, "🚨 PAIR HALTED");
        }
    }

    pub fn resume_pair(&self, pair_key: &str) -> bool {
        let removed = self.pairs.remove(pair_key).is_some();
        if removed {
            info!(pair = %pair_key, "✅ PAIR RESUMED");
        }
        removed
    }

    pub fn set_global(&self, active: bool, reason: &str) {
        let prev = self.global.swap(active, Ordering::SeqCst);
        if prev != active {
            if active {
                warn!("🚨 GLOBAL MATCHING HALT ACTIVATED: {}", reason);
            } else {
                info!("✅ GLOBAL MATCHING HALT LIFTED: {}", reason);
            }
        }
    }

    pub fn halted_pairs(&self) -> Vec<String> {
        self.pairs.iter().map(|e| e.key().clone()).collect()
    }
}
