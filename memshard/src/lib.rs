//! Sharded memcached client.
//!
//! memshard spreads keys across a pool of cache servers (legacy weighted
//! or ketama consistent hashing), pipelines commands per connection, and
//! fans batch operations out to every involved server under one shared
//! deadline. Values ride a transform pipeline — optional codec for
//! structured data, optional UTF-8 text mode, threshold/ratio-gated
//! compression — with the transform recorded in the protocol's flag word
//! so reads never depend on the writing client's configuration.
//!
//! A client is a single-flow engine: it is not `Sync`, owns its sockets
//! exclusively, and multiplexes multi-server I/O with readiness polling
//! instead of threads. Failed servers are shunned for a window but keys
//! are never rerouted; requests for a down server fail fast and visibly.
//!
//! # Example
//!
//! ```no_run
//! use memshard::{Client, Config};
//!
//! fn example() -> Result<(), memshard::Error> {
//!     let config = Config::builder()
//!         .server("10.0.0.1:11211")?
//!         .server("10.0.0.2:11211")?
//!         .ketama_points(160)
//!         .build()?;
//!     let mut client = Client::new(config)?;
//!
//!     client.set("greeting", "hello", 0)?;
//!     let value = client.get("greeting")?;
//!     assert_eq!(value.unwrap().as_bytes(), Some(&b"hello"[..]));
//!
//!     let by_key = client.get_many_by_key(&["greeting", "missing"]);
//!     assert!(by_key.contains_key("greeting"));
//!     assert!(!by_key.contains_key("missing"));
//!     Ok(())
//! }
//! ```

mod addr;
mod config;
mod dispatch;
mod engine;
mod error;
mod failure;
mod net;
mod transform;

pub use addr::ServerAddr;
pub use config::{Config, ConfigBuilder, ServerSpec};
pub use dispatch::ConnState;
pub use error::{Error, Outcome};
pub use transform::{
    CacheValue, Codec, JsonCodec, StorePayload, FLAG_CODEC, FLAG_COMPRESSED, FLAG_TEXT,
};

use std::collections::HashMap;
use std::time::Instant;

use memshard_proto::{ParseError, Request, StoreVerb};
use memshard_selector::Selector;

use crate::dispatch::{drive, ensure_connected, teardown, Server};
use crate::engine::{Expect, Pending, Slot, Wire};
use crate::failure::FailureTracker;
use crate::transform::Transformer;

/// Keys may be at most this long after namespace prefixing.
const MAX_KEY_LEN: usize = 250;

/// Simple single-key commands that batch through [`Client::enqueue_keyed`].
#[derive(Debug, Clone, Copy)]
enum KeyedOp {
    Delete,
    Incr(u64),
    Decr(u64),
}

/// cas/gets/append/prepend need at least this server version.
const MODERN_VERSION: (u64, u64, u64) = (1, 2, 4);
const MODERN_VERSION_LABEL: &str = "1.2.4";

/// Client handle owning the selector, failure tracker and one lazily
/// opened engine per server.
///
/// Generic over the [`Codec`] used for structured values; the default
/// [`JsonCodec`] stores self-describing JSON.
pub struct Client<C = JsonCodec> {
    servers: Vec<Server>,
    selector: Selector,
    failures: FailureTracker,
    transformer: Transformer<C>,
    namespace: String,
    connect_timeout: Option<std::time::Duration>,
    io_timeout: Option<std::time::Duration>,
    close_on_error: bool,
    nowait: bool,
}

impl Client<JsonCodec> {
    /// Build a client with the default JSON codec.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_codec(config, JsonCodec)
    }
}

impl<C: Codec> Client<C> {
    /// Build a client with a caller-provided codec for structured values.
    pub fn with_codec(config: Config, codec: C) -> Result<Self, Error> {
        config.validate()?;

        let identities: Vec<(String, f64)> = config
            .servers
            .iter()
            .map(|s| (s.addr.to_string(), s.weight))
            .collect();
        let selector = Selector::build(&identities, config.ketama_points)
            .map_err(|e| Error::Config(e.to_string()))?;
        let names: Vec<String> = identities.into_iter().map(|(name, _)| name).collect();
        let failures = FailureTracker::new(config.max_failures, config.failure_timeout, names);
        let transformer = Transformer::new(
            codec,
            config.utf8,
            config.compress_threshold,
            config.compress_ratio,
            &config.compress_algo,
        );
        let servers = config.servers.into_iter().map(|s| Server::new(s.addr)).collect();

        Ok(Client {
            servers,
            selector,
            failures,
            transformer,
            namespace: config.namespace,
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            close_on_error: config.close_on_error,
            nowait: config.nowait,
        })
    }

    // ── Retrieval ───────────────────────────────────────────────────────

    /// Fetch one key. `None` is an ordinary miss.
    pub fn get(&mut self, key: &str) -> Result<Option<CacheValue<C::Value>>, Error> {
        let mut outcomes = self.run_retrieval(&[key], false);
        let outcome = outcomes.pop().unwrap_or(Outcome::Err(Error::Timeout));
        outcome.and_then(|wire| self.decode(wire)).into_result()
    }

    /// Fetch one key with its CAS token.
    pub fn gets(&mut self, key: &str) -> Result<Option<(u64, CacheValue<C::Value>)>, Error> {
        let mut outcomes = self.run_retrieval(&[key], true);
        let outcome = outcomes.pop().unwrap_or(Outcome::Err(Error::Timeout));
        outcome
            .and_then(|wire| self.decode_with_cas(wire))
            .into_result()
    }

    /// Fetch many keys; the result vector is indexed like `keys`.
    pub fn get_many(&mut self, keys: &[&str]) -> Vec<Outcome<CacheValue<C::Value>>> {
        self.run_retrieval(keys, false)
            .into_iter()
            .map(|o| o.and_then(|wire| self.decode(wire)))
            .collect()
    }

    /// Fetch many keys as a map of hits keyed by the caller's key.
    /// Misses and per-key failures are simply absent; when the same key
    /// is passed twice the later occurrence wins.
    pub fn get_many_by_key(&mut self, keys: &[&str]) -> HashMap<String, CacheValue<C::Value>> {
        let outcomes = self.run_retrieval(keys, false);
        let mut map = HashMap::new();
        for (key, outcome) in keys.iter().zip(outcomes) {
            if let Outcome::Ok(wire) = outcome {
                if let Ok(value) = self.decode(wire) {
                    map.insert((*key).to_string(), value);
                }
            }
        }
        map
    }

    /// Fetch many keys with CAS tokens; indexed like `keys`.
    pub fn gets_many(&mut self, keys: &[&str]) -> Vec<Outcome<(u64, CacheValue<C::Value>)>> {
        self.run_retrieval(keys, true)
            .into_iter()
            .map(|o| o.and_then(|wire| self.decode_with_cas(wire)))
            .collect()
    }

    /// Fetch many keys with CAS tokens as a map of hits.
    pub fn gets_many_by_key(
        &mut self,
        keys: &[&str],
    ) -> HashMap<String, (u64, CacheValue<C::Value>)> {
        let outcomes = self.run_retrieval(keys, true);
        let mut map = HashMap::new();
        for (key, outcome) in keys.iter().zip(outcomes) {
            if let Outcome::Ok(wire) = outcome {
                if let Ok(pair) = self.decode_with_cas(wire) {
                    map.insert((*key).to_string(), pair);
                }
            }
        }
        map
    }

    // ── Storage ─────────────────────────────────────────────────────────

    /// Store unconditionally. Returns `true` when the server stored it.
    pub fn set<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
    ) -> Result<bool, Error>
    where
        C::Value: 'v,
    {
        self.run_store(StoreVerb::Set, key, value.into(), exptime)
    }

    /// Store only if the key does not exist yet.
    pub fn add<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
    ) -> Result<bool, Error>
    where
        C::Value: 'v,
    {
        self.run_store(StoreVerb::Add, key, value.into(), exptime)
    }

    /// Store only if the key already exists.
    pub fn replace<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
    ) -> Result<bool, Error>
    where
        C::Value: 'v,
    {
        self.run_store(StoreVerb::Replace, key, value.into(), exptime)
    }

    /// Append raw bytes to an existing value. No transform runs: the
    /// suffix is concatenated server-side to whatever representation is
    /// stored.
    pub fn append(&mut self, key: &str, suffix: impl AsRef<[u8]>) -> Result<bool, Error> {
        self.run_concat(StoreVerb::Append, key, suffix.as_ref())
    }

    /// Prepend raw bytes to an existing value.
    pub fn prepend(&mut self, key: &str, prefix: impl AsRef<[u8]>) -> Result<bool, Error> {
        self.run_concat(StoreVerb::Prepend, key, prefix.as_ref())
    }

    /// Compare-and-swap with a token from [`gets`](Client::gets). Returns
    /// `false` when another writer got there first or the key vanished.
    pub fn cas<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
        cas_token: u64,
    ) -> Result<bool, Error>
    where
        C::Value: 'v,
    {
        let wire = self.wire_key(key)?;
        let index = self.selector.select(&wire);
        self.require_modern_server(index)?;
        let (data, flags) = self.transformer.outbound(value.into())?;
        let request = Request::cas(&wire, &data, flags, exptime, cas_token);
        flag_outcome(self.run_one(index, &request, Expect::Cas))
    }

    /// Store many `(key, value)` pairs; the result vector is indexed like
    /// `items`.
    pub fn set_many<'v>(
        &mut self,
        items: &[(&str, StorePayload<'v, C::Value>)],
        exptime: u32,
    ) -> Vec<Outcome<bool>> {
        let mut slots: Vec<Slot> = vec![None; items.len()];
        let mut engaged: Vec<usize> = Vec::new();

        for (i, (key, payload)) in items.iter().enumerate() {
            let wire = match self.wire_key(key) {
                Ok(wire) => wire,
                Err(e) => {
                    slots[i] = Some(Outcome::Err(e));
                    continue;
                }
            };
            let (data, flags) = match self.transformer.outbound(*payload) {
                Ok(encoded) => encoded,
                Err(e) => {
                    slots[i] = Some(Outcome::Err(e));
                    continue;
                }
            };
            let index = self.selector.select(&wire);
            if let Err(e) = self.open(index) {
                slots[i] = Some(Outcome::Err(e));
                continue;
            }
            if let Some(engine) = self.servers[index].engine.as_mut() {
                engine.push(
                    &Request::store(StoreVerb::Set, &wire, &data, flags, exptime),
                    Pending::Simple {
                        expect: Expect::Store,
                        slot: i,
                    },
                );
                if !engaged.contains(&index) {
                    engaged.push(index);
                }
            }
        }

        self.finish(&engaged, &mut slots);
        collect(slots, |wire| match wire {
            Wire::Flag(stored) => Ok(stored),
            _ => Err(mismatch()),
        })
    }

    // ── Delete ──────────────────────────────────────────────────────────

    /// Delete a key. Returns `false` when it was not there.
    pub fn delete(&mut self, key: &str) -> Result<bool, Error> {
        let wire = self.wire_key(key)?;
        let index = self.selector.select(&wire);
        flag_outcome(self.run_one(index, &Request::delete(&wire, None), Expect::Delete))
    }

    /// Delete with the legacy queue-delay argument (old servers only).
    pub fn delete_delayed(&mut self, key: &str, delay: u32) -> Result<bool, Error> {
        let wire = self.wire_key(key)?;
        let index = self.selector.select(&wire);
        flag_outcome(self.run_one(index, &Request::delete(&wire, Some(delay)), Expect::Delete))
    }

    /// Delete many keys; indexed like `keys`.
    pub fn delete_many(&mut self, keys: &[&str]) -> Vec<Outcome<bool>> {
        let mut slots: Vec<Slot> = vec![None; keys.len()];
        let mut engaged: Vec<usize> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match self.enqueue_keyed(key, i, &mut slots, KeyedOp::Delete) {
                Some(index) if !engaged.contains(&index) => engaged.push(index),
                _ => {}
            }
        }
        self.finish(&engaged, &mut slots);
        collect(slots, |wire| match wire {
            Wire::Flag(deleted) => Ok(deleted),
            _ => Err(mismatch()),
        })
    }

    // ── Arithmetic ──────────────────────────────────────────────────────

    /// Increment a counter. `None` means the key does not exist.
    pub fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, Error> {
        let wire = self.wire_key(key)?;
        let index = self.selector.select(&wire);
        let outcome = self.run_one(index, &Request::incr(&wire, delta), Expect::Arith);
        arith_outcome(outcome)
    }

    /// Decrement a counter, saturating at zero. `None` means the key does
    /// not exist.
    pub fn decr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, Error> {
        let wire = self.wire_key(key)?;
        let index = self.selector.select(&wire);
        let outcome = self.run_one(index, &Request::decr(&wire, delta), Expect::Arith);
        arith_outcome(outcome)
    }

    /// Increment many counters; indexed like `pairs`.
    pub fn incr_many(&mut self, pairs: &[(&str, u64)]) -> Vec<Outcome<u64>> {
        self.run_arith_many(pairs, false)
    }

    /// Decrement many counters; indexed like `pairs`.
    pub fn decr_many(&mut self, pairs: &[(&str, u64)]) -> Vec<Outcome<u64>> {
        self.run_arith_many(pairs, true)
    }

    // ── Per-server commands ─────────────────────────────────────────────

    /// Flush every server, optionally spreading a delay so the flushes
    /// land staggered: with `N` servers and delay `D`, server `i` (in
    /// configuration order) gets `D × (N−1−i) / (N−1)` seconds — the
    /// first server flushes last, the last immediately.
    ///
    /// The result is keyed by canonical server identity.
    pub fn flush_all(&mut self, delay: Option<u32>) -> HashMap<String, Outcome<bool>> {
        let count = self.servers.len();
        let mut slots: Vec<Slot> = vec![None; count];
        let mut engaged: Vec<usize> = Vec::new();

        for index in 0..count {
            let spread = delay.map(|d| spread_delay(d, index, count));
            if let Err(e) = self.open(index) {
                slots[index] = Some(Outcome::Err(e));
                continue;
            }
            if let Some(engine) = self.servers[index].engine.as_mut() {
                engine.push(
                    &Request::flush_all(spread),
                    Pending::Simple {
                        expect: Expect::Flush,
                        slot: index,
                    },
                );
                engaged.push(index);
            }
        }

        self.finish(&engaged, &mut slots);
        let outcomes = collect(slots, |wire| match wire {
            Wire::Flag(done) => Ok(done),
            _ => Err(mismatch()),
        });
        self.servers
            .iter()
            .map(|s| s.name.clone())
            .zip(outcomes)
            .collect()
    }

    /// Ask every server for its version string, keyed by canonical server
    /// identity. Versions are cached for the command gate.
    pub fn versions(&mut self) -> HashMap<String, Outcome<String>> {
        let count = self.servers.len();
        let mut slots: Vec<Slot> = vec![None; count];
        let mut engaged: Vec<usize> = Vec::new();

        for index in 0..count {
            if let Err(e) = self.open(index) {
                slots[index] = Some(Outcome::Err(e));
                continue;
            }
            if let Some(engine) = self.servers[index].engine.as_mut() {
                engine.push(
                    &Request::version(),
                    Pending::Simple {
                        expect: Expect::Version,
                        slot: index,
                    },
                );
                engaged.push(index);
            }
        }

        self.finish(&engaged, &mut slots);
        let outcomes = collect(slots, |wire| match wire {
            Wire::Version(v) => Ok(v),
            _ => Err(mismatch()),
        });
        for (server, outcome) in self.servers.iter_mut().zip(&outcomes) {
            if let Outcome::Ok(version) = outcome {
                server.version = Some(version.clone());
            }
        }
        self.servers
            .iter()
            .map(|s| s.name.clone())
            .zip(outcomes)
            .collect()
    }

    // ── Fire-and-forget ─────────────────────────────────────────────────

    /// Quiet operations: issue the command and discard the reply. With
    /// `nowait` enabled the call returns as soon as the command is
    /// framed; the discarded reply is read later (next call on that
    /// connection, [`drain`](Client::drain), or drop). With `nowait`
    /// disabled the command runs synchronously and only transport errors
    /// surface.
    pub fn quiet(&mut self) -> Quiet<'_, C> {
        Quiet { client: self }
    }

    /// Flush outboxes and absorb every outstanding discarded reply,
    /// bounded by `io_timeout`. Called automatically on drop so
    /// fire-and-forget work is not lost when the client goes away.
    pub fn drain(&mut self) {
        self.drain_connections();
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Which server index a key routes to, after namespace prefixing.
    pub fn server_index(&self, key: &str) -> Result<usize, Error> {
        let wire = self.wire_key(key)?;
        Ok(self.selector.select(&wire))
    }

    /// Canonical server identities in configuration order.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Connection state per server, in configuration order.
    pub fn server_states(&self) -> Vec<ConnState> {
        self.servers.iter().map(|s| s.state).collect()
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Namespace-prefix and validate a user key.
    fn wire_key(&self, key: &str) -> Result<Vec<u8>, Error> {
        let mut wire = Vec::with_capacity(self.namespace.len() + key.len());
        wire.extend_from_slice(self.namespace.as_bytes());
        wire.extend_from_slice(key.as_bytes());
        if wire.is_empty() {
            return Err(Error::InvalidKey("empty key".into()));
        }
        if wire.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey(format!(
                "key is {} bytes, limit is {MAX_KEY_LEN}",
                wire.len()
            )));
        }
        if wire.iter().any(|&b| b <= b' ' || b == 0x7f) {
            return Err(Error::InvalidKey(
                "key contains space or control bytes".into(),
            ));
        }
        Ok(wire)
    }

    fn deadline(&self) -> Option<Instant> {
        self.io_timeout.map(|t| Instant::now() + t)
    }

    fn open(&mut self, index: usize) -> Result<(), Error> {
        ensure_connected(
            &mut self.servers[index],
            index,
            self.connect_timeout,
            &mut self.failures,
        )
    }

    fn finish(&mut self, engaged: &[usize], slots: &mut [Slot]) {
        let deadline = self.deadline();
        drive(
            &mut self.servers,
            engaged,
            slots,
            deadline,
            self.close_on_error,
            false,
            &mut self.failures,
        );
    }

    /// Run one simple command against one server and wait for its reply.
    fn run_one(&mut self, index: usize, request: &Request<'_>, expect: Expect) -> Outcome<Wire> {
        if let Err(e) = self.open(index) {
            return Outcome::Err(e);
        }
        let mut slots: Vec<Slot> = vec![None];
        if let Some(engine) = self.servers[index].engine.as_mut() {
            engine.push(request, Pending::Simple { expect, slot: 0 });
        }
        self.finish(&[index], &mut slots);
        slots.pop().flatten().unwrap_or(Outcome::Err(Error::Timeout))
    }

    fn run_store(
        &mut self,
        verb: StoreVerb,
        key: &str,
        payload: StorePayload<'_, C::Value>,
        exptime: u32,
    ) -> Result<bool, Error> {
        let wire = self.wire_key(key)?;
        let index = self.selector.select(&wire);
        let (data, flags) = self.transformer.outbound(payload)?;
        let request = Request::store(verb, &wire, &data, flags, exptime);
        flag_outcome(self.run_one(index, &request, Expect::Store))
    }

    fn run_concat(&mut self, verb: StoreVerb, key: &str, bytes: &[u8]) -> Result<bool, Error> {
        let wire = self.wire_key(key)?;
        let index = self.selector.select(&wire);
        self.require_modern_server(index)?;
        let request = Request::store(verb, &wire, bytes, 0, 0);
        flag_outcome(self.run_one(index, &request, Expect::Store))
    }

    /// Enqueue one simple keyed command for a batch; returns the engaged
    /// server index on success.
    fn enqueue_keyed(
        &mut self,
        key: &str,
        slot: usize,
        slots: &mut [Slot],
        op: KeyedOp,
    ) -> Option<usize> {
        let wire = match self.wire_key(key) {
            Ok(wire) => wire,
            Err(e) => {
                slots[slot] = Some(Outcome::Err(e));
                return None;
            }
        };
        let index = self.selector.select(&wire);
        if let Err(e) = self.open(index) {
            slots[slot] = Some(Outcome::Err(e));
            return None;
        }
        let engine = self.servers[index].engine.as_mut()?;
        let (request, expect) = match op {
            KeyedOp::Delete => (Request::delete(&wire, None), Expect::Delete),
            KeyedOp::Incr(delta) => (Request::incr(&wire, delta), Expect::Arith),
            KeyedOp::Decr(delta) => (Request::decr(&wire, delta), Expect::Arith),
        };
        engine.push(&request, Pending::Simple { expect, slot });
        Some(index)
    }

    fn run_arith_many(&mut self, pairs: &[(&str, u64)], decrement: bool) -> Vec<Outcome<u64>> {
        let mut slots: Vec<Slot> = vec![None; pairs.len()];
        let mut engaged: Vec<usize> = Vec::new();
        for (i, (key, delta)) in pairs.iter().enumerate() {
            let op = if decrement {
                KeyedOp::Decr(*delta)
            } else {
                KeyedOp::Incr(*delta)
            };
            if let Some(index) = self.enqueue_keyed(key, i, &mut slots, op) {
                if !engaged.contains(&index) {
                    engaged.push(index);
                }
            }
        }
        self.finish(&engaged, &mut slots);
        collect(slots, |wire| match wire {
            Wire::Number(n) => Ok(n),
            _ => Err(mismatch()),
        })
    }

    /// Group keys by server, emit one `get`/`gets` per engaged server,
    /// drive the batch, and return wire-level outcomes in key order.
    fn run_retrieval(&mut self, keys: &[&str], with_cas: bool) -> Vec<Outcome<Wire>> {
        let mut slots: Vec<Slot> = vec![None; keys.len()];
        let mut groups: HashMap<usize, Vec<(Vec<u8>, usize)>> = HashMap::new();

        for (i, key) in keys.iter().enumerate() {
            match self.wire_key(key) {
                Ok(wire) => {
                    let index = self.selector.select(&wire);
                    groups.entry(index).or_default().push((wire, i));
                }
                Err(e) => slots[i] = Some(Outcome::Err(e)),
            }
        }

        let mut engaged: Vec<usize> = Vec::new();
        for (index, group) in groups {
            if with_cas {
                if let Err(e) = self.require_modern_server(index) {
                    for (_, slot) in &group {
                        slots[*slot] = Some(Outcome::Err(e.clone()));
                    }
                    continue;
                }
            }
            if let Err(e) = self.open(index) {
                for (_, slot) in &group {
                    slots[*slot] = Some(Outcome::Err(e.clone()));
                }
                continue;
            }
            let Some(engine) = self.servers[index].engine.as_mut() else {
                continue;
            };
            {
                let wire_keys: Vec<&[u8]> = group.iter().map(|(k, _)| k.as_slice()).collect();
                let request = if with_cas {
                    Request::gets(&wire_keys)
                } else {
                    Request::get(&wire_keys)
                };
                engine.frame(&request);
            }
            engine.enqueue(Pending::Retrieval { keys: group });
            engaged.push(index);
        }

        self.finish(&engaged, &mut slots);
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Outcome::Err(Error::Timeout)))
            .collect()
    }

    fn decode(&self, wire: Wire) -> Result<CacheValue<C::Value>, Error> {
        match wire {
            Wire::Found { flags, data, .. } => self.transformer.inbound(data, flags),
            _ => Err(mismatch()),
        }
    }

    fn decode_with_cas(&self, wire: Wire) -> Result<(u64, CacheValue<C::Value>), Error> {
        match wire {
            Wire::Found { flags, data, cas } => {
                let token = cas.ok_or(Error::Protocol(ParseError::Protocol(
                    "gets reply without a cas token",
                )))?;
                Ok((token, self.transformer.inbound(data, flags)?))
            }
            _ => Err(mismatch()),
        }
    }

    /// Learn (and cache) the server's version, then check it against the
    /// minimum for cas/gets/append/prepend. The command is not sent to a
    /// server that would mis-parse it.
    fn require_modern_server(&mut self, index: usize) -> Result<(), Error> {
        if self.servers[index].version.is_none() {
            match self.run_one(index, &Request::version(), Expect::Version) {
                Outcome::Ok(Wire::Version(v)) => self.servers[index].version = Some(v),
                Outcome::Err(e) => return Err(e),
                _ => return Err(mismatch()),
            }
        }
        let server = &self.servers[index];
        let Some(version) = server.version.as_deref() else {
            return Err(mismatch());
        };
        if parse_version(version) < MODERN_VERSION {
            return Err(Error::ServerTooOld {
                server: server.name.clone(),
                version: version.to_string(),
                required: MODERN_VERSION_LABEL,
            });
        }
        Ok(())
    }

    /// Issue a command whose reply nobody will read.
    fn fire(&mut self, index: usize, request: &Request<'_>, expect: Expect) -> Result<(), Error> {
        if !self.nowait {
            return match self.run_one(index, request, expect) {
                Outcome::Err(e) => Err(e),
                _ => Ok(()),
            };
        }
        self.open(index)?;
        let Some(engine) = self.servers[index].engine.as_mut() else {
            return Ok(());
        };
        engine.push(request, Pending::Discard);
        // Opportunistic flush; whatever the socket does not take now goes
        // out with the next drive or drain on this connection.
        if let Err(e) = engine.flush() {
            let error = Error::Io {
                server: self.servers[index].name.clone(),
                reason: e.to_string(),
            };
            let mut no_slots: [Slot; 0] = [];
            teardown(
                &mut self.servers,
                index,
                error.clone(),
                &mut no_slots,
                &mut self.failures,
            );
            return Err(error);
        }
        Ok(())
    }
}

impl<C> Client<C> {
    // Drop must not depend on the codec bound, so the drain drive lives
    // here.
    fn drain_connections(&mut self) {
        let engaged: Vec<usize> = (0..self.servers.len()).collect();
        let mut slots: Vec<Slot> = Vec::new();
        let deadline = self.io_timeout.map(|t| Instant::now() + t);
        drive(
            &mut self.servers,
            &engaged,
            &mut slots,
            deadline,
            self.close_on_error,
            true,
            &mut self.failures,
        );
    }
}

impl<C> Drop for Client<C> {
    fn drop(&mut self) {
        self.drain_connections();
    }
}

/// Fire-and-forget view of a [`Client`], created by
/// [`Client::quiet`]. Every method issues its command without waiting
/// for the reply; replies are still read later to keep the connection
/// aligned.
pub struct Quiet<'a, C: Codec = JsonCodec> {
    client: &'a mut Client<C>,
}

impl<C: Codec> Quiet<'_, C> {
    pub fn set<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
    ) -> Result<(), Error>
    where
        C::Value: 'v,
    {
        self.fire_store(StoreVerb::Set, key, value.into(), exptime)
    }

    pub fn add<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
    ) -> Result<(), Error>
    where
        C::Value: 'v,
    {
        self.fire_store(StoreVerb::Add, key, value.into(), exptime)
    }

    pub fn replace<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
    ) -> Result<(), Error>
    where
        C::Value: 'v,
    {
        self.fire_store(StoreVerb::Replace, key, value.into(), exptime)
    }

    pub fn append(&mut self, key: &str, suffix: impl AsRef<[u8]>) -> Result<(), Error> {
        self.fire_concat(StoreVerb::Append, key, suffix.as_ref())
    }

    pub fn prepend(&mut self, key: &str, prefix: impl AsRef<[u8]>) -> Result<(), Error> {
        self.fire_concat(StoreVerb::Prepend, key, prefix.as_ref())
    }

    pub fn cas<'v>(
        &mut self,
        key: &str,
        value: impl Into<StorePayload<'v, C::Value>>,
        exptime: u32,
        cas_token: u64,
    ) -> Result<(), Error>
    where
        C::Value: 'v,
    {
        let wire = self.client.wire_key(key)?;
        let index = self.client.selector.select(&wire);
        self.client.require_modern_server(index)?;
        let (data, flags) = self.client.transformer.outbound(value.into())?;
        let request = Request::cas(&wire, &data, flags, exptime, cas_token);
        self.client.fire(index, &request, Expect::Cas)
    }

    pub fn incr(&mut self, key: &str, delta: u64) -> Result<(), Error> {
        let wire = self.client.wire_key(key)?;
        let index = self.client.selector.select(&wire);
        self.client
            .fire(index, &Request::incr(&wire, delta), Expect::Arith)
    }

    pub fn decr(&mut self, key: &str, delta: u64) -> Result<(), Error> {
        let wire = self.client.wire_key(key)?;
        let index = self.client.selector.select(&wire);
        self.client
            .fire(index, &Request::decr(&wire, delta), Expect::Arith)
    }

    pub fn delete(&mut self, key: &str) -> Result<(), Error> {
        let wire = self.client.wire_key(key)?;
        let index = self.client.selector.select(&wire);
        self.client
            .fire(index, &Request::delete(&wire, None), Expect::Delete)
    }

    /// Fire a staggered flush to every server (same delay spread as
    /// [`Client::flush_all`]). Returns the first transport error, if any.
    pub fn flush_all(&mut self, delay: Option<u32>) -> Result<(), Error> {
        let count = self.client.servers.len();
        let mut first_error = None;
        for index in 0..count {
            let spread = delay.map(|d| spread_delay(d, index, count));
            let result = self
                .client
                .fire(index, &Request::flush_all(spread), Expect::Flush);
            if let (Err(e), None) = (result, &first_error) {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fire_store(
        &mut self,
        verb: StoreVerb,
        key: &str,
        payload: StorePayload<'_, C::Value>,
        exptime: u32,
    ) -> Result<(), Error> {
        let wire = self.client.wire_key(key)?;
        let index = self.client.selector.select(&wire);
        let (data, flags) = self.client.transformer.outbound(payload)?;
        let request = Request::store(verb, &wire, &data, flags, exptime);
        self.client.fire(index, &request, Expect::Store)
    }

    fn fire_concat(&mut self, verb: StoreVerb, key: &str, bytes: &[u8]) -> Result<(), Error> {
        let wire = self.client.wire_key(key)?;
        let index = self.client.selector.select(&wire);
        self.client.require_modern_server(index)?;
        let request = Request::store(verb, &wire, bytes, 0, 0);
        self.client.fire(index, &request, Expect::Store)
    }
}

/// `D × (N−1−i) / (N−1)` rounded toward zero; the sole server gets `D`.
fn spread_delay(delay: u32, index: usize, count: usize) -> u32 {
    if count <= 1 {
        return delay;
    }
    let numerator = delay as u64 * (count - 1 - index) as u64;
    (numerator / (count - 1) as u64) as u32
}

fn mismatch() -> Error {
    Error::Protocol(ParseError::Protocol("reply does not match the command"))
}

/// Leading numeric components of a version string, padded with zeros.
fn parse_version(s: &str) -> (u64, u64, u64) {
    let mut nums = [0u64; 3];
    for (i, part) in s.split('.').take(3).enumerate() {
        let digits = part
            .find(|c: char| !c.is_ascii_digit())
            .map_or(part, |at| &part[..at]);
        nums[i] = digits.parse().unwrap_or(0);
    }
    (nums[0], nums[1], nums[2])
}

fn arith_outcome(outcome: Outcome<Wire>) -> Result<Option<u64>, Error> {
    match outcome {
        Outcome::Ok(Wire::Number(n)) => Ok(Some(n)),
        Outcome::Ok(_) => Err(mismatch()),
        Outcome::Miss => Ok(None),
        Outcome::Err(e) => Err(e),
    }
}

fn flag_outcome(outcome: Outcome<Wire>) -> Result<bool, Error> {
    match outcome {
        Outcome::Ok(Wire::Flag(yes)) => Ok(yes),
        Outcome::Ok(_) => Err(mismatch()),
        Outcome::Miss => Ok(false),
        Outcome::Err(e) => Err(e),
    }
}

/// Map resolved slots into typed outcomes.
fn collect<T>(slots: Vec<Slot>, f: impl Fn(Wire) -> Result<T, Error>) -> Vec<Outcome<T>> {
    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or(Outcome::Err(Error::Timeout))
                .and_then(&f)
        })
        .collect()
}
