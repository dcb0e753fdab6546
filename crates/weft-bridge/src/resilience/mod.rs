//! Resilience wrapper around the transport: circuit breaking for every
//! call, bounded retries for the idempotent subset.

pub mod circuit;
pub mod client;
pub mod retry;
