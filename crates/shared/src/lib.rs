//! Infrastructure shared between the exchange crates: transport creation,
//! chain head tracking, maintenance scheduling, metrics and tracing setup.

pub mod arguments;
pub mod current_block;
pub mod maintenance;
pub mod metrics;
pub mod panic_hook;
pub mod signature_validator;
pub mod tracing;
pub mod transport;
