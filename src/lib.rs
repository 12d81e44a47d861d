pub mod catalog;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pool;
pub mod query;
pub mod queue;
pub mod store;
pub mod task;
pub mod template;
pub mod unit;
pub mod version;
