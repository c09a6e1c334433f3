//! Durable job records, backed by a fjall keyspace.

mod error;
mod keys;
mod records;

pub use error::{Result, StoreError};
pub use records::JobStore;
