//! The keeper binary: hosts the off-chain exchange state and runs the
//! periodic services around it, namely the blockchain indexer, the
//! settlement batcher and the reconciliation loop.

pub mod api;
pub mod arguments;
pub mod contracts;
pub mod indexer;
pub mod monitor;
pub mod reconciliation;
pub mod run;
pub mod shutdown_controller;

pub use run::start;
