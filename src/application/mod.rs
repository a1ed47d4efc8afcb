//! Application layer orchestrating one Bundle from submission to response.
//!
//! [`BundleProcessor`] runs the pipeline: the validator checks the envelope,
//! the resolver orders entries by their `fullUrl` references, the dispatcher
//! applies each entry to its backends with bounded concurrency, and the
//! aggregator assembles the `transaction-response` Bundle.

pub mod aggregator;
pub mod coordinator;
pub mod dispatcher;
pub mod resolution_table;
pub mod resolver;
pub mod validator;

pub use coordinator::{BundleProcessor, Cancellation, Health, TransactionState};
pub use dispatcher::{RoutingTable, SUPPORTED_RESOURCE_TYPES};
