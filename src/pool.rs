//! # Connection Pool
//!
//! Purpose: Keep a bounded set of reusable cluster sessions so callers never
//! pay per-operation connection setup, while supporting blocking and
//! non-blocking checkout and runtime resizing.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Connections are checked out exclusively and
//!    returned on every exit path via an RAII guard.
//! 2. **One Lock**: Acquire, release, and resize all serialize on the same
//!    mutex, so a resize can never be observed mid-teardown.
//! 3. **Generation Tags**: A resize bumps the pool generation; checkouts from
//!    an older generation are dropped on release instead of pooled.
//! 4. **Lazy Sockets**: A pooled connection owns one link per server and
//!    dials each link on first use, so warming the pool is allocation only.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::client::{CacheError, CacheResult};
use crate::proto::{self, Reply, StoreMode};
use crate::router::{self, HashRing};

/// Well-known memcache port, used when a descriptor omits one.
pub const DEFAULT_PORT: u16 = 11211;

/// One parsed `"host[:port]"` cluster member descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerDescriptor {
    pub host: String,
    pub port: u16,
}

impl ServerDescriptor {
    /// Parses `"host[:port]"`, defaulting the port to [`DEFAULT_PORT`].
    pub fn parse(raw: &str) -> CacheResult<Self> {
        let raw = raw.trim();
        let (host, port) = match raw.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| CacheError::InvalidDescriptor(raw.to_string()))?;
                (host, port)
            }
            None => (raw, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(CacheError::InvalidDescriptor(raw.to_string()));
        }
        Ok(ServerDescriptor {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Recognized per-connection behavior knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    NoBlock,
    CacheLookups,
    BinaryProtocol,
    ConsistentHashing,
    TcpNodelay,
    TcpKeepalive,
    TcpKeepaliveTimeout,
    ServerFailureLimit,
    ServerPollTimeout,
    ServerConnectTimeout,
    ServerRetryTimeout,
}

impl Behavior {
    /// Maps a `configure` option name onto a behavior, `None` for unknown
    /// names (the caller logs and skips those).
    pub fn from_name(name: &str) -> Option<Behavior> {
        match name {
            "no-block" => Some(Behavior::NoBlock),
            "cache-lookups" => Some(Behavior::CacheLookups),
            "binary-protocol" => Some(Behavior::BinaryProtocol),
            "consistent-hashing" => Some(Behavior::ConsistentHashing),
            "tcp-nodelay" => Some(Behavior::TcpNodelay),
            "tcp-keepalive" => Some(Behavior::TcpKeepalive),
            "tcp-keepalive-timeout" => Some(Behavior::TcpKeepaliveTimeout),
            "server-failure-limit" => Some(Behavior::ServerFailureLimit),
            "server-poll-timeout" => Some(Behavior::ServerPollTimeout),
            "server-connect-timeout" => Some(Behavior::ServerConnectTimeout),
            "server-retry-timeout" => Some(Behavior::ServerRetryTimeout),
            _ => None,
        }
    }
}

/// Typed view of the behavior table, shared by all pooled connections.
///
/// Timeouts are milliseconds except the keepalive idle time and the dead
/// server retry window, which are seconds.
#[derive(Debug, Clone)]
pub struct BehaviorSet {
    pub no_block: bool,
    pub cache_lookups: bool,
    pub binary_protocol: bool,
    pub consistent_hashing: bool,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    pub tcp_keepalive_secs: u64,
    pub failure_limit: u64,
    pub poll_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub retry_timeout_secs: u64,
}

impl Default for BehaviorSet {
    fn default() -> Self {
        BehaviorSet {
            no_block: false,
            cache_lookups: false,
            binary_protocol: false,
            consistent_hashing: false,
            tcp_nodelay: false,
            tcp_keepalive: false,
            tcp_keepalive_secs: 0,
            failure_limit: 5,
            poll_timeout_ms: 5_000,
            connect_timeout_ms: 4_000,
            retry_timeout_secs: 2,
        }
    }
}

impl BehaviorSet {
    pub fn apply(&mut self, behavior: Behavior, value: u64) {
        match behavior {
            Behavior::NoBlock => self.no_block = value != 0,
            Behavior::CacheLookups => self.cache_lookups = value != 0,
            Behavior::BinaryProtocol => {
                self.binary_protocol = value != 0;
                if value != 0 {
                    warn!("binary framing is not spoken by this client, staying on text");
                }
            }
            Behavior::ConsistentHashing => self.consistent_hashing = value != 0,
            Behavior::TcpNodelay => self.tcp_nodelay = value != 0,
            Behavior::TcpKeepalive => self.tcp_keepalive = value != 0,
            Behavior::TcpKeepaliveTimeout => self.tcp_keepalive_secs = value,
            Behavior::ServerFailureLimit => self.failure_limit = value,
            Behavior::ServerPollTimeout => self.poll_timeout_ms = value,
            Behavior::ServerConnectTimeout => self.connect_timeout_ms = value,
            Behavior::ServerRetryTimeout => self.retry_timeout_secs = value,
        }
    }
}

// Behaviors are versioned so connections can cheaply re-apply socket options
// only when something actually changed since their last checkout.
struct BehaviorState {
    set: BehaviorSet,
    version: u64,
}

/// A value as stored on the wire: payload plus expansion-length metadata.
///
/// `flags == 0` means the payload is plain; nonzero is the original
/// uncompressed length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue {
    pub data: Vec<u8>,
    pub flags: u32,
}

struct ServerLink {
    descriptor: ServerDescriptor,
    reader: Option<BufReader<TcpStream>>,
    resolved: Option<SocketAddr>,
    failures: u64,
    dead_until: Option<Instant>,
}

impl ServerLink {
    fn new(descriptor: ServerDescriptor) -> Self {
        ServerLink {
            descriptor,
            reader: None,
            resolved: None,
            failures: 0,
            dead_until: None,
        }
    }

    fn send(&mut self, request: &[u8], set: &BehaviorSet) -> CacheResult<()> {
        let reader = self.ensure_connected(set)?;
        let stream = reader.get_mut();
        stream.write_all(request)?;
        stream.flush()?;
        Ok(())
    }

    fn reply(&mut self, line_buf: &mut Vec<u8>) -> CacheResult<Reply> {
        let reader = self.reader.as_mut().expect("link connected");
        proto::read_reply(reader, line_buf)
    }

    fn ensure_connected(&mut self, set: &BehaviorSet) -> CacheResult<&mut BufReader<TcpStream>> {
        if let Some(until) = self.dead_until {
            if Instant::now() < until {
                return Err(CacheError::Protocol {
                    reply: "server marked dead".to_string(),
                    server: self.descriptor.to_string(),
                });
            }
            self.dead_until = None;
        }

        if self.reader.is_none() {
            let stream = self.dial(set)?;
            self.reader = Some(BufReader::new(stream));
        }
        Ok(self.reader.as_mut().expect("just connected"))
    }

    fn dial(&mut self, set: &BehaviorSet) -> CacheResult<TcpStream> {
        let addr = match self.resolved {
            Some(addr) if set.cache_lookups => addr,
            _ => {
                let addr = (self.descriptor.host.as_str(), self.descriptor.port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| CacheError::Unroutable {
                        host: self.descriptor.host.clone(),
                    })?;
                if set.cache_lookups {
                    self.resolved = Some(addr);
                }
                addr
            }
        };

        let stream = if set.connect_timeout_ms > 0 {
            TcpStream::connect_timeout(&addr, Duration::from_millis(set.connect_timeout_ms))?
        } else {
            TcpStream::connect(addr)?
        };
        apply_socket_behaviors(&stream, set)?;
        debug!("connected to {}", self.descriptor);
        Ok(stream)
    }

    /// Drops the socket without touching the failure counters; used to force
    /// a clean reframe after a lenient stream termination.
    fn reset(&mut self) {
        self.reader = None;
    }

    fn succeed(&mut self) {
        self.failures = 0;
    }

    fn fail(&mut self, set: &BehaviorSet) {
        self.reader = None;
        self.failures += 1;
        if set.failure_limit > 0 && self.failures >= set.failure_limit {
            warn!(
                "marking {} dead for {}s after {} consecutive failures",
                self.descriptor, set.retry_timeout_secs, self.failures
            );
            self.dead_until = Some(Instant::now() + Duration::from_secs(set.retry_timeout_secs));
            self.failures = 0;
        }
    }
}

// Only transport-level trouble counts against a server; replies it produced
// on a healthy socket do not.
fn fail_on_io(link: &mut ServerLink, set: &BehaviorSet, err: &CacheError) {
    if matches!(err, CacheError::Io(_) | CacheError::Frame) {
        link.fail(set);
    }
}

fn apply_socket_behaviors(stream: &TcpStream, set: &BehaviorSet) -> io::Result<()> {
    stream.set_nodelay(set.tcp_nodelay)?;

    let timeout = if set.poll_timeout_ms > 0 {
        Some(Duration::from_millis(set.poll_timeout_ms))
    } else {
        None
    };
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;

    let sock = socket2::SockRef::from(stream);
    if set.tcp_keepalive {
        let mut keepalive = socket2::TcpKeepalive::new();
        if set.tcp_keepalive_secs > 0 {
            keepalive = keepalive.with_time(Duration::from_secs(set.tcp_keepalive_secs));
        }
        sock.set_tcp_keepalive(&keepalive)?;
    } else {
        sock.set_keepalive(false)?;
    }
    Ok(())
}

/// One pooled session with the whole cluster: a lazily-dialed link per
/// server, key routing across them, and reusable wire buffers.
pub struct Connection {
    links: Vec<ServerLink>,
    ring: HashRing,
    behaviors: Arc<Mutex<BehaviorState>>,
    applied_version: u64,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn new(servers: &[ServerDescriptor], behaviors: Arc<Mutex<BehaviorState>>) -> Self {
        let identities: Vec<String> = servers.iter().map(|d| d.to_string()).collect();
        Connection {
            links: servers.iter().cloned().map(ServerLink::new).collect(),
            ring: HashRing::build(&identities),
            behaviors,
            applied_version: 0,
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        }
    }

    fn behaviors_snapshot(&self) -> BehaviorSet {
        self.behaviors
            .lock()
            .expect("behavior mutex poisoned")
            .set
            .clone()
    }

    /// Re-applies socket-level behaviors to open links if the shared set
    /// changed since this connection was last handed out.
    fn sync_behaviors(&mut self) {
        let (set, version) = {
            let guard = self.behaviors.lock().expect("behavior mutex poisoned");
            (guard.set.clone(), guard.version)
        };
        if version == self.applied_version {
            return;
        }
        for link in &mut self.links {
            if let Some(reader) = &link.reader {
                if let Err(err) = apply_socket_behaviors(reader.get_ref(), &set) {
                    debug!(
                        "failed to refresh socket options on {}: {err}",
                        link.descriptor
                    );
                }
            }
        }
        self.applied_version = version;
    }

    fn select(&self, key: &str, set: &BehaviorSet) -> usize {
        if set.consistent_hashing {
            self.ring.lookup(key.as_bytes())
        } else {
            router::route_key(key.as_bytes(), self.links.len())
        }
    }

    /// Retrieves one raw value; `Ok(None)` is a miss.
    pub fn fetch(&mut self, key: &str) -> CacheResult<Option<RawValue>> {
        let set = self.behaviors_snapshot();
        let idx = self.select(key, &set);
        self.write_buf.clear();
        proto::encode_get(&[key], &mut self.write_buf);

        let Connection {
            links,
            line_buf,
            write_buf,
            ..
        } = self;
        let link = &mut links[idx];
        if let Err(err) = link.send(write_buf, &set) {
            fail_on_io(link, &set, &err);
            return Err(err);
        }

        let mut found = None;
        loop {
            match link.reply(line_buf) {
                Ok(Reply::Value { flags, data, .. }) => {
                    found = Some(RawValue { data, flags });
                }
                Ok(Reply::End) => break,
                Ok(other) => {
                    // Lenient termination: anything that is not a VALUE ends
                    // the stream. Drop the socket so framing restarts clean.
                    warn!("get on {} terminated by {:?}", link.descriptor, other);
                    link.reset();
                    break;
                }
                Err(err) => {
                    fail_on_io(link, &set, &err);
                    return Err(err);
                }
            }
        }
        link.succeed();
        Ok(found)
    }

    /// Retrieves many raw values in one round per involved server.
    ///
    /// Best-effort: per-server trouble is logged and the affected keys are
    /// simply absent from the result.
    pub fn fetch_multi(&mut self, keys: &[&str]) -> HashMap<String, RawValue> {
        let set = self.behaviors_snapshot();
        let mut groups: HashMap<usize, Vec<&str>> = HashMap::new();
        for &key in keys {
            groups.entry(self.select(key, &set)).or_default().push(key);
        }

        let Connection {
            links,
            line_buf,
            write_buf,
            ..
        } = self;
        let mut result = HashMap::new();

        for (idx, group) in groups {
            let link = &mut links[idx];
            write_buf.clear();
            proto::encode_get(&group, write_buf);
            if let Err(err) = link.send(write_buf, &set) {
                fail_on_io(link, &set, &err);
                warn!("multi-get failed on {}: {err}", link.descriptor);
                continue;
            }

            loop {
                match link.reply(line_buf) {
                    Ok(Reply::Value { key, flags, data }) => {
                        result.insert(key, RawValue { data, flags });
                    }
                    Ok(Reply::End) => {
                        link.succeed();
                        break;
                    }
                    Ok(other) => {
                        warn!("multi-get on {} terminated by {:?}", link.descriptor, other);
                        link.reset();
                        break;
                    }
                    Err(err) => {
                        fail_on_io(link, &set, &err);
                        warn!("multi-get on {} aborted: {err}", link.descriptor);
                        break;
                    }
                }
            }
        }
        result
    }

    /// Writes one value with the given mode, expiry and expansion metadata.
    pub fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        payload: &[u8],
        flags: u32,
        expire_secs: u64,
    ) -> CacheResult<()> {
        let set = self.behaviors_snapshot();
        let idx = self.select(key, &set);
        self.write_buf.clear();
        proto::encode_store(mode, key, flags, expire_secs, payload, &mut self.write_buf);

        let Connection {
            links,
            line_buf,
            write_buf,
            ..
        } = self;
        let link = &mut links[idx];
        if let Err(err) = link.send(write_buf, &set) {
            fail_on_io(link, &set, &err);
            return Err(err);
        }

        match link.reply(line_buf) {
            Ok(Reply::Stored) => {
                link.succeed();
                Ok(())
            }
            Ok(Reply::NotStored) => {
                link.succeed();
                Err(CacheError::Protocol {
                    reply: "NOT_STORED".to_string(),
                    server: link.descriptor.to_string(),
                })
            }
            Ok(Reply::Error(reply)) => Err(CacheError::Protocol {
                reply,
                server: link.descriptor.to_string(),
            }),
            Ok(other) => {
                link.reset();
                Err(CacheError::Protocol {
                    reply: format!("{other:?}"),
                    server: link.descriptor.to_string(),
                })
            }
            Err(err) => {
                fail_on_io(link, &set, &err);
                Err(err)
            }
        }
    }

    /// Deletes one key. A missing key surfaces as [`CacheError::NotFound`],
    /// which callers treat as success (idempotent delete).
    pub fn delete(&mut self, key: &str) -> CacheResult<()> {
        let set = self.behaviors_snapshot();
        let idx = self.select(key, &set);
        self.write_buf.clear();
        proto::encode_delete(key, &mut self.write_buf);

        let Connection {
            links,
            line_buf,
            write_buf,
            ..
        } = self;
        let link = &mut links[idx];
        if let Err(err) = link.send(write_buf, &set) {
            fail_on_io(link, &set, &err);
            return Err(err);
        }

        match link.reply(line_buf) {
            Ok(Reply::Deleted) => {
                link.succeed();
                Ok(())
            }
            Ok(Reply::NotFound) => {
                link.succeed();
                Err(CacheError::NotFound)
            }
            Ok(Reply::Error(reply)) => Err(CacheError::Protocol {
                reply,
                server: link.descriptor.to_string(),
            }),
            Ok(other) => {
                link.reset();
                Err(CacheError::Protocol {
                    reply: format!("{other:?}"),
                    server: link.descriptor.to_string(),
                })
            }
            Err(err) => {
                fail_on_io(link, &set, &err);
                Err(err)
            }
        }
    }

    /// Invalidates every entry on every reachable server; trouble is logged
    /// per server and does not abort the sweep.
    pub fn flush_all(&mut self) {
        let set = self.behaviors_snapshot();
        let Connection {
            links,
            line_buf,
            write_buf,
            ..
        } = self;

        for link in links.iter_mut() {
            write_buf.clear();
            proto::encode_flush(write_buf);
            if let Err(err) = link.send(write_buf, &set) {
                fail_on_io(link, &set, &err);
                warn!("flush failed on {}: {err}", link.descriptor);
                continue;
            }
            match link.reply(line_buf) {
                Ok(Reply::Ok) => link.succeed(),
                Ok(other) => warn!("flush on {} returned {:?}", link.descriptor, other),
                Err(err) => {
                    fail_on_io(link, &set, &err);
                    warn!("flush on {} aborted: {err}", link.descriptor);
                }
            }
        }
    }

    /// Collects per-server statistics keyed by `host:port`.
    pub fn stats(&mut self) -> HashMap<String, HashMap<String, String>> {
        let set = self.behaviors_snapshot();
        let Connection {
            links,
            line_buf,
            write_buf,
            ..
        } = self;
        let mut result = HashMap::new();

        for link in links.iter_mut() {
            write_buf.clear();
            proto::encode_stats(write_buf);
            if let Err(err) = link.send(write_buf, &set) {
                fail_on_io(link, &set, &err);
                warn!("stats failed on {}: {err}", link.descriptor);
                continue;
            }

            let mut entries = HashMap::new();
            loop {
                match link.reply(line_buf) {
                    Ok(Reply::Stat { name, value }) => {
                        entries.insert(name, value);
                    }
                    Ok(Reply::End) => {
                        link.succeed();
                        break;
                    }
                    Ok(other) => {
                        warn!("stats on {} terminated by {:?}", link.descriptor, other);
                        link.reset();
                        break;
                    }
                    Err(err) => {
                        fail_on_io(link, &set, &err);
                        warn!("stats on {} aborted: {err}", link.descriptor);
                        break;
                    }
                }
            }
            result.insert(link.descriptor.to_string(), entries);
        }
        result
    }
}

struct PoolState {
    idle: Vec<Connection>,
    total: usize,
    max: usize,
    generation: u64,
}

struct PoolInner {
    servers: Vec<ServerDescriptor>,
    behaviors: Arc<Mutex<BehaviorState>>,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Bounded pool of cluster connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool bounded by `max` connections, with `max / 2` of them
    /// instantiated warm.
    pub fn new(servers: Vec<ServerDescriptor>, behaviors: BehaviorSet, max: usize) -> Self {
        let inner = Arc::new(PoolInner {
            servers,
            behaviors: Arc::new(Mutex::new(BehaviorState {
                set: behaviors,
                version: 0,
            })),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                max: max.max(1),
                generation: 0,
            }),
            available: Condvar::new(),
        });
        let pool = ConnectionPool { inner };
        pool.warm();
        pool
    }

    fn warm(&self) {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        let target = state.max / 2;
        while state.total < target {
            let conn = Connection::new(&self.inner.servers, self.inner.behaviors.clone());
            state.idle.push(conn);
            state.total += 1;
        }
    }

    /// Checks out a connection. A blocking acquire waits for a release with
    /// no independent timeout; a non-blocking one fails with
    /// [`CacheError::PoolExhausted`] when the pool is at capacity.
    pub fn acquire(&self, blocking: bool) -> CacheResult<PooledConnection> {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        loop {
            if let Some(mut conn) = state.idle.pop() {
                let generation = state.generation;
                drop(state);
                conn.sync_behaviors();
                return Ok(PooledConnection::new(self.inner.clone(), conn, generation));
            }

            if state.total < state.max {
                state.total += 1;
                let generation = state.generation;
                drop(state);
                let mut conn = Connection::new(&self.inner.servers, self.inner.behaviors.clone());
                conn.sync_behaviors();
                return Ok(PooledConnection::new(self.inner.clone(), conn, generation));
            }

            if !blocking {
                return Err(CacheError::PoolExhausted);
            }
            state = self
                .inner
                .available
                .wait(state)
                .expect("pool mutex poisoned");
        }
    }

    /// Applies a behavior to all current and future pooled connections.
    pub fn set_behavior(&self, behavior: Behavior, value: u64) {
        let mut guard = self.inner.behaviors.lock().expect("behavior mutex poisoned");
        guard.set.apply(behavior, value);
        guard.version += 1;
    }

    /// Current behavior table snapshot.
    pub fn behaviors(&self) -> BehaviorSet {
        self.inner
            .behaviors
            .lock()
            .expect("behavior mutex poisoned")
            .set
            .clone()
    }

    /// Rebuilds the pool with a new upper bound.
    ///
    /// Runs under the acquire/release lock, so no caller can observe the pool
    /// mid-teardown. Outstanding checkouts keep working; they are discarded
    /// on release instead of returning to the rebuilt pool.
    pub fn resize(&self, new_max: usize) {
        let new_max = new_max.max(1);
        {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            let discarded = state.idle.len();
            state.idle.clear();
            state.total -= discarded;
            state.max = new_max;
            state.generation += 1;
            let target = new_max / 2;
            while state.total < target {
                let conn = Connection::new(&self.inner.servers, self.inner.behaviors.clone());
                state.idle.push(conn);
                state.total += 1;
            }
        }
        self.inner.available.notify_all();
        info!("pool resized to {new_max}");
    }

    /// Servers this pool fans out to.
    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.inner.servers
    }
}

/// RAII checkout; the connection returns to the pool on drop, on every exit
/// path.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    generation: u64,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection, generation: u64) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            generation,
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let mut state = self.pool.state.lock().expect("pool mutex poisoned");
        if self.generation == state.generation {
            state.idle.push(conn);
        } else {
            // Stale checkout from before a resize.
            state.total = state.total.saturating_sub(1);
        }
        drop(state);
        self.pool.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn descriptors() -> Vec<ServerDescriptor> {
        vec![ServerDescriptor {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }]
    }

    #[test]
    fn parses_descriptor_with_default_port() {
        let desc = ServerDescriptor::parse("cache1.example").unwrap();
        assert_eq!(desc.host, "cache1.example");
        assert_eq!(desc.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_descriptor_with_explicit_port() {
        let desc = ServerDescriptor::parse("cache1.example:11222").unwrap();
        assert_eq!(desc.port, 11222);
        assert_eq!(desc.to_string(), "cache1.example:11222");
    }

    #[test]
    fn rejects_bad_descriptors() {
        assert!(ServerDescriptor::parse("").is_err());
        assert!(ServerDescriptor::parse(":11211").is_err());
        assert!(ServerDescriptor::parse("host:notaport").is_err());
        assert!(ServerDescriptor::parse("host:99999").is_err());
    }

    #[test]
    fn behavior_names_round_trip() {
        for name in [
            "no-block",
            "cache-lookups",
            "binary-protocol",
            "consistent-hashing",
            "tcp-nodelay",
            "tcp-keepalive",
            "tcp-keepalive-timeout",
            "server-failure-limit",
            "server-poll-timeout",
            "server-connect-timeout",
            "server-retry-timeout",
        ] {
            assert!(Behavior::from_name(name).is_some(), "unrecognized: {name}");
        }
        assert!(Behavior::from_name("autopickling").is_none());
        assert!(Behavior::from_name("pool-size").is_none());
    }

    #[test]
    fn half_of_max_is_kept_warm() {
        let pool = ConnectionPool::new(descriptors(), BehaviorSet::default(), 6);
        let state = pool.inner.state.lock().unwrap();
        assert_eq!(state.idle.len(), 3);
        assert_eq!(state.total, 3);
        assert_eq!(state.max, 6);
    }

    #[test]
    fn non_blocking_acquire_fails_when_exhausted() {
        let pool = ConnectionPool::new(descriptors(), BehaviorSet::default(), 2);
        let first = pool.acquire(false).unwrap();
        let second = pool.acquire(false).unwrap();
        assert!(matches!(
            pool.acquire(false),
            Err(CacheError::PoolExhausted)
        ));
        drop(first);
        let third = pool.acquire(false).unwrap();
        drop(second);
        drop(third);
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let pool = ConnectionPool::new(descriptors(), BehaviorSet::default(), 1);
        let held = pool.acquire(true).unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = pool.clone();
        let handle = thread::spawn(move || {
            let conn = contender.acquire(true).unwrap();
            tx.send(()).unwrap();
            drop(conn);
        });

        // The contender must still be parked while we hold the connection.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("blocked acquire should complete after release");
        handle.join().unwrap();
    }

    #[test]
    fn resize_discards_stale_checkouts() {
        let pool = ConnectionPool::new(descriptors(), BehaviorSet::default(), 2);
        let held = pool.acquire(false).unwrap();
        pool.resize(4);
        drop(held);

        let state = pool.inner.state.lock().unwrap();
        // One warm connection of the new generation; the stale handle was
        // dropped on release, not pooled.
        assert_eq!(state.idle.len(), 1);
        assert_eq!(state.total, 1);
        assert_eq!(state.max, 4);
        assert_eq!(state.generation, 1);
    }

    #[test]
    fn resize_raises_capacity_for_new_checkouts() {
        let pool = ConnectionPool::new(descriptors(), BehaviorSet::default(), 1);
        let first = pool.acquire(false).unwrap();
        assert!(pool.acquire(false).is_err());
        pool.resize(3);
        let second = pool.acquire(false).unwrap();
        let third = pool.acquire(false).unwrap();
        drop(first);
        drop(second);
        drop(third);
    }

    #[test]
    fn set_behavior_is_visible_to_pooled_connections() {
        let pool = ConnectionPool::new(descriptors(), BehaviorSet::default(), 2);
        pool.set_behavior(Behavior::ConsistentHashing, 1);
        pool.set_behavior(Behavior::ServerFailureLimit, 9);
        let conn = pool.acquire(false).unwrap();
        let set = conn.behaviors_snapshot();
        assert!(set.consistent_hashing);
        assert_eq!(set.failure_limit, 9);
        assert!(!set.binary_protocol);
    }
}
