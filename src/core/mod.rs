//! Core records, the event log and the persistence layer.
//!
//! Everything above `store::MarketStore` is backend-agnostic; `memory` and
//! `sqlite` are the two implementations.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod memory;
pub mod migration;
pub mod model;
pub mod schemas;
pub mod sqlite;
pub mod store;
pub mod time;
