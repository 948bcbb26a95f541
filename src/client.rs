//! # Cache Client Facade
//!
//! Purpose: Expose a compact, blocking API over the connection pool, the
//! compression codec and the locality router, with partial-failure reporting
//! for bulk operations.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `CacheClient` hides pooling, routing and framing.
//! 2. **Degrade, Don't Crash**: A client built from an empty or fully
//!    filtered server list stays inert; every operation is a safe no-op.
//! 3. **Scoped Checkout**: Each operation acquires one pooled connection and
//!    returns it on every exit path.
//! 4. **Explicit Outcomes**: Bulk calls report success and failure sets
//!    instead of mutating caller-owned collections.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::codec::{Compressor, Decompressor};
use crate::locality::SubnetRouter;
use crate::pool::{Behavior, BehaviorSet, ConnectionPool, RawValue, ServerDescriptor};
use crate::proto::StoreMode;

/// Result type for the client.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the client and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wire framing violated the text protocol.
    #[error("malformed wire framing")]
    Frame,
    /// Server replied with something other than success.
    #[error("server {server} replied: {reply}")]
    Protocol { reply: String, server: String },
    /// Pool is at capacity and the caller asked not to wait.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Hostname did not resolve to any usable address.
    #[error("cannot resolve host {host}")]
    Unroutable { host: String },
    /// Key is absent; expected, never logged as an error.
    #[error("key not found")]
    NotFound,
    /// Stored value failed to expand to its recorded length.
    #[error("stored value failed to decompress")]
    Corruption,
    /// Server descriptor string could not be parsed.
    #[error("invalid server descriptor {0:?}")]
    InvalidDescriptor(String),
}

/// Client configuration, mutated only through [`CacheClient::configure`] and
/// [`CacheClient::set_expiration_range`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on pooled connections.
    pub pool_size: u32,
    /// Whether checkout waits for a free connection or fails immediately.
    pub pool_blocking: bool,
    /// Values strictly larger than this are compressed before transmission.
    pub compression_threshold: usize,
    /// Fraction of configured servers that survived locality filtering.
    pub locality: f64,
    /// Lower bound of the jittered expiration window.
    pub expiration_min: Duration,
    /// Upper bound (exclusive) of the jittered expiration window.
    pub expiration_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool_size: 5,
            pool_blocking: false,
            // Disable compression by default.
            compression_threshold: usize::MAX,
            locality: 0.0,
            expiration_min: Duration::from_secs(120),
            expiration_max: Duration::from_secs(180),
        }
    }
}

/// Per-key result of a bulk store or remove.
///
/// Keys skipped for an empty key or value appear in neither set; they were
/// never attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub succeeded: HashSet<String>,
    pub failed: HashSet<String>,
}

/// Pooled, locality-aware memcache client.
///
/// Cheap to share behind an `Arc`; all operations take `&self`.
pub struct CacheClient {
    pool: Option<ConnectionPool>,
    config: Mutex<Config>,
}

impl CacheClient {
    /// Builds a client from `"host[:port]"` descriptors.
    ///
    /// With a router, only descriptors whose host resolves into a local
    /// subnet are kept; unresolvable hosts are skipped with a warning. If no
    /// descriptor survives, construction still returns a client, but an inert
    /// one: every operation is a safe no-op returning empty/false.
    pub fn new(servers: &[&str], router: Option<&SubnetRouter>) -> CacheClient {
        info!("initializing");
        info!("routing: {}", if router.is_some() { "on" } else { "off" });

        let mut config = Config::default();
        let mut descriptors = Vec::new();
        let mut parsed = 0usize;

        for raw in servers {
            let descriptor = match ServerDescriptor::parse(raw) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!("skipping malformed descriptor {raw:?}: {err}");
                    continue;
                }
            };
            parsed += 1;

            if let Some(router) = router {
                if !router.is_local(&descriptor.host) {
                    info!("skipping non-local server {descriptor}");
                    continue;
                }
            }

            info!("configuring server {descriptor}");
            descriptors.push(descriptor);
        }

        if parsed > 0 {
            config.locality = descriptors.len() as f64 / parsed as f64;
        }

        if descriptors.is_empty() {
            error!("server list is empty");
            return CacheClient {
                pool: None,
                config: Mutex::new(config),
            };
        }

        let pool = ConnectionPool::new(
            descriptors,
            BehaviorSet::default(),
            config.pool_size as usize,
        );
        CacheClient {
            pool: Some(pool),
            config: Mutex::new(config),
        }
    }

    /// True unless construction left the client inert.
    pub fn is_usable(&self) -> bool {
        self.pool.is_some()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.config.lock().expect("config mutex poisoned").clone()
    }

    /// Fraction of configured servers that survived locality filtering.
    pub fn locality(&self) -> f64 {
        self.config().locality
    }

    /// Applies a batch of named options.
    ///
    /// Recognized behavior names are forwarded to the pool; `pool-size`,
    /// `pool-blocking` and `compression-threshold` update the client;
    /// anything else is logged and skipped.
    pub fn configure(&self, options: &HashMap<String, u64>) {
        let Some(pool) = &self.pool else {
            error!("cannot configure an inert client");
            return;
        };

        for (name, &value) in options {
            info!("setting {name} to {value}");

            if let Some(behavior) = Behavior::from_name(name) {
                pool.set_behavior(behavior, value);
            } else if name == "pool-size" {
                if value == 0 {
                    warn!("ignoring pool-size 0");
                    continue;
                }
                self.config.lock().expect("config mutex poisoned").pool_size = value as u32;
                pool.resize(value as usize);
            } else if name == "pool-blocking" {
                self.config.lock().expect("config mutex poisoned").pool_blocking = value != 0;
            } else if name == "compression-threshold" {
                self.config
                    .lock()
                    .expect("config mutex poisoned")
                    .compression_threshold = value as usize;
            } else {
                warn!("skipping unknown option {name}");
            }
        }
    }

    /// Overrides the window used for jittered expirations.
    pub fn set_expiration_range(&self, min: Duration, max: Duration) {
        let mut config = self.config.lock().expect("config mutex poisoned");
        config.expiration_min = min;
        config.expiration_max = max;
    }

    /// Fetches one value. `None` covers miss, empty key, inert client and
    /// logged failures alike.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let pool = self.pool.as_ref()?;
        if key.is_empty() {
            return None;
        }

        let mut conn = match pool.acquire(self.blocking()) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("get failed to acquire a connection: {err}");
                return None;
            }
        };

        match conn.fetch(key) {
            Ok(Some(raw)) => expand(key, raw, &mut Decompressor::new()),
            Ok(None) => None,
            Err(err) => {
                error!("get of {key} failed: {err}");
                None
            }
        }
    }

    /// Fetches many values in one multiplexed round; the result only
    /// contains keys that were found (and expanded cleanly).
    pub fn get_multi(&self, keys: &[&str]) -> HashMap<String, Vec<u8>> {
        let mut result = HashMap::new();
        let Some(pool) = &self.pool else {
            return result;
        };

        let keys: Vec<&str> = keys.iter().copied().filter(|key| !key.is_empty()).collect();
        if keys.is_empty() {
            return result;
        }

        let mut conn = match pool.acquire(self.blocking()) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("multi-get failed to acquire a connection: {err}");
                return result;
            }
        };

        let mut inflate = Decompressor::new();
        for (key, raw) in conn.fetch_multi(&keys) {
            if let Some(value) = expand(&key, raw, &mut inflate) {
                result.insert(key, value);
            }
        }
        result
    }

    /// Stores a value unconditionally. `expire: None` draws a jittered TTL.
    pub fn set(&self, key: &str, value: &[u8], expire: Option<Duration>) -> bool {
        self.store_one(StoreMode::Set, key, value, expire)
    }

    /// Stores a value only when the key is vacant.
    pub fn add(&self, key: &str, value: &[u8], expire: Option<Duration>) -> bool {
        self.store_one(StoreMode::Add, key, value, expire)
    }

    /// Stores a value only when the key is occupied.
    pub fn replace(&self, key: &str, value: &[u8], expire: Option<Duration>) -> bool {
        self.store_one(StoreMode::Replace, key, value, expire)
    }

    pub fn set_multi(
        &self,
        entries: &HashMap<String, Vec<u8>>,
        expire: Option<Duration>,
    ) -> BulkOutcome {
        self.write(StoreMode::Set, entries, expire)
    }

    pub fn add_multi(
        &self,
        entries: &HashMap<String, Vec<u8>>,
        expire: Option<Duration>,
    ) -> BulkOutcome {
        self.write(StoreMode::Add, entries, expire)
    }

    pub fn replace_multi(
        &self,
        entries: &HashMap<String, Vec<u8>>,
        expire: Option<Duration>,
    ) -> BulkOutcome {
        self.write(StoreMode::Replace, entries, expire)
    }

    /// Removes one key; a key the server never had still counts as removed.
    pub fn remove(&self, key: &str) -> bool {
        self.remove_multi(&[key]).succeeded.contains(key)
    }

    /// Removes many keys, reporting per-key success and failure.
    pub fn remove_multi(&self, keys: &[&str]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        let Some(pool) = &self.pool else {
            return outcome;
        };

        let mut conn = match pool.acquire(self.blocking()) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("remove failed to acquire a connection: {err}");
                return outcome;
            }
        };

        for &key in keys {
            if key.is_empty() {
                continue;
            }
            match conn.delete(key) {
                // Idempotent delete: a missing key is as gone as a deleted
                // one.
                Ok(()) | Err(CacheError::NotFound) => {
                    outcome.succeeded.insert(key.to_string());
                }
                Err(err) => {
                    error!("remove of {key} failed: {err}");
                    outcome.failed.insert(key.to_string());
                }
            }
        }
        outcome
    }

    /// Invalidates every entry across the cluster.
    pub fn flush(&self) {
        let Some(pool) = &self.pool else {
            return;
        };
        match pool.acquire(self.blocking()) {
            Ok(mut conn) => conn.flush_all(),
            Err(err) => warn!("flush failed to acquire a connection: {err}"),
        }
    }

    /// Aggregated statistics keyed by `host:port`.
    pub fn stats(&self) -> HashMap<String, HashMap<String, String>> {
        let Some(pool) = &self.pool else {
            return HashMap::new();
        };
        match pool.acquire(self.blocking()) {
            Ok(mut conn) => conn.stats(),
            Err(err) => {
                warn!("stats failed to acquire a connection: {err}");
                HashMap::new()
            }
        }
    }

    /// Namespacing helper: `compose_key("session", 42)` is `"session:42"`.
    pub fn compose_key<K: fmt::Display>(prefix: &str, key: K) -> String {
        format!("{prefix}:{key}")
    }

    fn blocking(&self) -> bool {
        self.config.lock().expect("config mutex poisoned").pool_blocking
    }

    /// Shared store path for all modes and both arities.
    fn write(
        &self,
        mode: StoreMode,
        entries: &HashMap<String, Vec<u8>>,
        expire: Option<Duration>,
    ) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        let Some(pool) = &self.pool else {
            return outcome;
        };

        let (blocking, threshold, exp_min, exp_max) = {
            let config = self.config.lock().expect("config mutex poisoned");
            (
                config.pool_blocking,
                config.compression_threshold,
                config.expiration_min,
                config.expiration_max,
            )
        };

        let mut conn = match pool.acquire(blocking) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("store failed to acquire a connection: {err}");
                return outcome;
            }
        };

        let mut deflate = Compressor::new();
        let mut rng = rand::thread_rng();

        for (key, value) in entries {
            if key.is_empty() || value.is_empty() {
                continue;
            }

            let expire_secs = match expire {
                Some(expire) => expire.as_secs(),
                None => jittered_expiry(&mut rng, exp_min, exp_max),
            };

            let (payload, flags) = if value.len() > threshold {
                match deflate.compress(value) {
                    Some(compressed) => (compressed, value.len() as u32),
                    None => (value.as_slice(), 0),
                }
            } else {
                (value.as_slice(), 0)
            };

            match conn.store(mode, key, payload, flags, expire_secs) {
                Ok(()) => {
                    outcome.succeeded.insert(key.clone());
                }
                Err(err) => {
                    error!("{} of {key} failed: {err}", verb_name(mode));
                    outcome.failed.insert(key.clone());
                }
            }
        }
        outcome
    }

    fn store_one(&self, mode: StoreMode, key: &str, value: &[u8], expire: Option<Duration>) -> bool {
        if key.is_empty() || value.is_empty() {
            return false;
        }
        let mut entries = HashMap::with_capacity(1);
        entries.insert(key.to_string(), value.to_vec());
        self.write(mode, &entries, expire).succeeded.contains(key)
    }
}

fn verb_name(mode: StoreMode) -> &'static str {
    match mode {
        StoreMode::Set => "set",
        StoreMode::Add => "add",
        StoreMode::Replace => "replace",
    }
}

fn expand(key: &str, raw: RawValue, inflate: &mut Decompressor) -> Option<Vec<u8>> {
    if raw.flags == 0 {
        return Some(raw.data);
    }
    match inflate.decompress(&raw.data, raw.flags as usize) {
        Ok(data) => Some(data.to_vec()),
        Err(_) => {
            error!("failed to decompress the value for key {key}");
            None
        }
    }
}

fn jittered_expiry(rng: &mut impl Rng, min: Duration, max: Duration) -> u64 {
    let min_secs = min.as_secs();
    let max_secs = max.as_secs().max(min_secs + 1);
    rng.gen_range(min_secs..max_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locality::SubnetRouter;

    fn inert_client() -> CacheClient {
        CacheClient::new(&[], None)
    }

    #[test]
    fn empty_server_list_yields_inert_client() {
        let client = inert_client();
        assert!(!client.is_usable());
        assert_eq!(client.locality(), 0.0);
    }

    #[test]
    fn inert_client_operations_are_safe_noops() {
        let client = inert_client();
        assert_eq!(client.get("key"), None);
        assert!(client.get_multi(&["a", "b"]).is_empty());
        assert!(!client.set("key", b"value", None));
        assert!(!client.add("key", b"value", None));
        assert!(!client.replace("key", b"value", None));
        assert!(!client.remove("key"));
        assert_eq!(client.remove_multi(&["a"]), BulkOutcome::default());
        assert!(client.stats().is_empty());
        client.flush();
        client.configure(&HashMap::from([("pool-size".to_string(), 10u64)]));
    }

    #[test]
    fn malformed_descriptors_are_skipped() {
        let client = CacheClient::new(&["", ":11211", "host:badport"], None);
        assert!(!client.is_usable());
    }

    #[test]
    fn routing_filters_remote_literals() {
        // Only a 10.0.0.0/24 interface: both servers are remote literals, so
        // the client ends up inert with zero locality.
        let router = SubnetRouter::with_interfaces(vec![crate::locality::Interface {
            name: "eth0".to_string(),
            addr: std::net::Ipv4Addr::new(10, 0, 0, 5),
            mask: std::net::Ipv4Addr::new(255, 255, 255, 0),
        }]);
        let client = CacheClient::new(&["192.168.0.1:11211", "172.16.0.1"], Some(&router));
        assert!(!client.is_usable());
        assert_eq!(client.locality(), 0.0);
    }

    #[test]
    fn locality_counts_surviving_fraction() {
        let router = SubnetRouter::with_interfaces(vec![crate::locality::Interface {
            name: "eth0".to_string(),
            addr: std::net::Ipv4Addr::new(10, 0, 0, 5),
            mask: std::net::Ipv4Addr::new(255, 255, 255, 0),
        }]);
        let client = CacheClient::new(&["10.0.0.7:11211", "192.168.0.1:11211"], Some(&router));
        assert!(client.is_usable());
        assert_eq!(client.locality(), 0.5);
    }

    #[test]
    fn compose_key_joins_with_colon() {
        assert_eq!(CacheClient::compose_key("session", 42), "session:42");
        assert_eq!(CacheClient::compose_key("user", "alice"), "user:alice");
    }

    #[test]
    fn jittered_expiry_stays_in_window() {
        let mut rng = rand::thread_rng();
        let min = Duration::from_secs(120);
        let max = Duration::from_secs(180);
        for _ in 0..200 {
            let expiry = jittered_expiry(&mut rng, min, max);
            assert!((120..180).contains(&expiry), "expiry out of window: {expiry}");
        }
    }

    #[test]
    fn jittered_expiry_tolerates_degenerate_window() {
        let mut rng = rand::thread_rng();
        let pinned = Duration::from_secs(60);
        assert_eq!(jittered_expiry(&mut rng, pinned, pinned), 60);
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = Config::default();
        assert_eq!(config.pool_size, 5);
        assert!(!config.pool_blocking);
        assert_eq!(config.compression_threshold, usize::MAX);
        assert_eq!(config.expiration_min, Duration::from_secs(120));
        assert_eq!(config.expiration_max, Duration::from_secs(180));
    }
}
