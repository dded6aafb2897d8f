use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::balance::BalanceStore;
use crate::bus::MessageBus;
use crate::chain::ChainClient;
use crate::circuit_breaker::HaltRegistry;
use crate::persistence::RecordStore;

/// Trait for providing the current time.
/// Decouples matching and settlement from `Utc::now()` so tests stay deterministic.
pub trait TimeProvider: Send + Sync {
    fn now_millis(&self) -> i64;
    fn now(&self) -> DateTime<Utc>;
}

/// Trait for generating unique message and batch IDs.
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Everything a component may need from the outside world, built once at
/// startup and handed to each component explicitly.
#[derive(Clone)]
pub struct CoreContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
    pub bus: Arc<dyn MessageBus>,
    pub balances: Arc<dyn BalanceStore>,
    pub chain: Arc<dyn ChainClient>,
    pub store: Arc<dyn RecordStore>,
    pub halts: Arc<HaltRegistry>,
}

impl CoreContext {
    pub fn new_system(
        bus: Arc<dyn MessageBus>,
        balances: Arc<dyn BalanceStore>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            time: Arc::new(SystemTimeProvider),
            id: Arc::new(RandomIdProvider),
            bus,
            balances,
            chain,
            store,
            halts: Arc::new(HaltRegistry::new()),
        }
    }

    /// Same collaborators, but with a settable clock and sequential ids.
    pub fn new_simulated(
        start_time_ms: i64,
        bus: Arc<dyn MessageBus>,
        balances: Arc<dyn BalanceStore>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            time: Arc::new(SimulatedTimeProvider::new(start_time_ms)),
            id: Arc::new(DeterministicIdProvider::new()),
            bus,
            balances,
            chain,
            store,
            halts: Arc::new(HaltRegistry::new()),
        }
    }
}

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RandomIdProvider;

impl IdProvider for RandomIdProvider {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

pub struct SimulatedTimeProvider {
    current_time_ms: AtomicI64,
}

impl SimulatedTimeProvider {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            current_time_ms: AtomicI64::new(start_time_ms),
        }
    }

    pub fn set_time(&self, time_ms: i64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, duration_ms: i64) {
        self.current_time_ms.fetch_add(duration_ms, Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTimeProvider {
    fn now_millis(&self) -> i64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_default()
    }
}

pub struct DeterministicIdProvider {
    counter: Mutex<u64>,
}

impl DeterministicIdProvider {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(0),
        }
    }
}

impl Default for DeterministicIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdProvider for DeterministicIdProvider {
    fn new_id(&self) -> String {
        let mut num = self.counter.lock();
        *num += 1;
        format!("00000000-0000-0000-0000-{:012x}", *num)
    }
}
