//! Reconciliation and aggregation of HTTP transactions captured by a
//! kernel-resident program into per-CPU batch storage.

pub mod agent;
pub mod config;
pub mod export;
pub mod http;
pub mod producer;
