//! Persistent pool of pre-funded key indices.
//!
//! One [`Pool`] per network: a durable FIFO of account indices awaiting
//! handout (`keys` bucket) plus a table of time-bounded reservations
//! (`lease` bucket), both in a shared LMDB environment. A single worker
//! task owns all writes; callers reach it through request channels.
//!
//! Refill is demand-driven: when the free queue drops to the configured
//! threshold, the worker mints fresh indices from the bucket sequence
//! and has the [`Charger`] fund them on chain before they become
//! visible in the queue. Expired leases are polled for drain and either
//! recycled into the queue or retired.

mod db;
mod pool;

pub use db::StoreError;
pub use pool::{BoxError, Charger, Pool, PoolConfig, PoolError};
