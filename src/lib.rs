//! Tripwire: a condition engine that walks strategy instances through their
//! trading life-cycle as indicator snapshots arrive.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod strategies;
