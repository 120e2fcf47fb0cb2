//! Marketplace components built on the `MarketStore` contract.

pub mod adapters;
pub mod distribution;
pub mod foundups;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod treasury;
