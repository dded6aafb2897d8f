pub mod api;
pub mod balance;
pub mod bus;
pub mod chain;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod messages;
pub mod metrics;
pub mod model;
pub mod order_fsm;
pub mod orderbook;
pub mod persistence;
pub mod pipeline;
pub mod settlement;
pub mod subjects;
