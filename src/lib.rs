//! # Locality-Aware Pooled Memcache Client
//!
//! Purpose: Provide a blocking memcache cluster client with a bounded
//! connection pool, transparent value compression above a threshold, and
//! subnet-based preference for locally reachable servers.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Cluster sessions are checked out and returned,
//!    never opened per call.
//! 2. **Degrade Gracefully**: Unroutable servers are skipped, bulk failures
//!    are reported per key, and a fully filtered client stays inert instead
//!    of panicking.
//! 3. **Honest Metadata**: Values carry their expansion length on the wire;
//!    the read path trusts that field, never the current threshold.
//! 4. **Explicit Dependencies**: The interface snapshot lives in an injected
//!    router value, not in process-global state.

mod client;
mod codec;
mod locality;
mod pool;
mod proto;
mod router;

pub use client::{BulkOutcome, CacheClient, CacheError, CacheResult, Config};
pub use codec::{Compressor, Decompressor};
pub use locality::{Interface, SubnetRouter};
pub use pool::{
    Behavior, BehaviorSet, Connection, ConnectionPool, PooledConnection, RawValue,
    ServerDescriptor, DEFAULT_PORT,
};
pub use proto::StoreMode;
