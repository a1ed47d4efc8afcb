//! Domain layer: the Bundle document model, per-entry outcomes and the port
//! that backend adapters implement.

pub mod bundle;
pub mod outcome;
pub mod ports;
