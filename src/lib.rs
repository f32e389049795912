//! Incoming ERC-20 transfer monitor.
//!
//! Library modules shared by the `tokenwatch` daemon and the `tokens` CLI.

pub mod config;
pub mod dashboard;
pub mod monitor;
pub mod notify;
pub mod onchain;
pub mod registry;
pub mod store;
pub mod subscriptions;
