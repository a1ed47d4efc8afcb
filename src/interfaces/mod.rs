//! Adapters between the processor and the outside world: reading a submitted
//! Bundle and writing the response.

pub mod json;
