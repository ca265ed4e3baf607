//! Command encoding for the Memcache ASCII dialect.
//!
//! Commands are appended to a growable buffer so that a connection can
//! frame many pipelined commands into one outbox before flushing. The
//! `noreply` keyword is never emitted: fire-and-forget is handled above
//! this layer by discarding replies, which keeps the reply stream aligned
//! with the command stream.

use std::io::Write;

/// Storage verbs that share the
/// `<verb> <key> <flags> <exptime> <bytes>\r\n<data>\r\n` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreVerb {
    fn token(self) -> &'static [u8] {
        match self {
            StoreVerb::Set => b"set",
            StoreVerb::Add => b"add",
            StoreVerb::Replace => b"replace",
            StoreVerb::Append => b"append",
            StoreVerb::Prepend => b"prepend",
        }
    }
}

/// A single outbound command.
///
/// Borrows key and value bytes from the caller; encoding copies them into
/// the outbox exactly once.
#[derive(Debug, Clone)]
pub enum Request<'a> {
    /// `get <k1> <k2> ...\r\n`
    Get { keys: &'a [&'a [u8]] },
    /// `gets <k1> <k2> ...\r\n` — like `Get` but replies carry CAS tokens.
    Gets { keys: &'a [&'a [u8]] },
    /// Storage frame shared by set/add/replace/append/prepend.
    Store {
        verb: StoreVerb,
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
    },
    /// `cas <key> <flags> <exptime> <bytes> <token>\r\n<data>\r\n`
    Cas {
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        exptime: u32,
        cas_unique: u64,
    },
    /// `incr <key> <delta>\r\n`
    Incr { key: &'a [u8], delta: u64 },
    /// `decr <key> <delta>\r\n`
    Decr { key: &'a [u8], delta: u64 },
    /// `delete <key>[ <delay>]\r\n` — the delay form is accepted by old
    /// servers only and is encoded only when present.
    Delete { key: &'a [u8], delay: Option<u32> },
    /// `flush_all[ <delay>]\r\n`
    FlushAll { delay: Option<u32> },
    /// `version\r\n`
    Version,
}

impl<'a> Request<'a> {
    #[inline]
    pub fn get(keys: &'a [&'a [u8]]) -> Self {
        Request::Get { keys }
    }

    #[inline]
    pub fn gets(keys: &'a [&'a [u8]]) -> Self {
        Request::Gets { keys }
    }

    #[inline]
    pub fn store(verb: StoreVerb, key: &'a [u8], value: &'a [u8], flags: u32, exptime: u32) -> Self {
        Request::Store {
            verb,
            key,
            value,
            flags,
            exptime,
        }
    }

    #[inline]
    pub fn cas(key: &'a [u8], value: &'a [u8], flags: u32, exptime: u32, cas_unique: u64) -> Self {
        Request::Cas {
            key,
            value,
            flags,
            exptime,
            cas_unique,
        }
    }

    #[inline]
    pub fn incr(key: &'a [u8], delta: u64) -> Self {
        Request::Incr { key, delta }
    }

    #[inline]
    pub fn decr(key: &'a [u8], delta: u64) -> Self {
        Request::Decr { key, delta }
    }

    #[inline]
    pub fn delete(key: &'a [u8], delay: Option<u32>) -> Self {
        Request::Delete { key, delay }
    }

    #[inline]
    pub fn flush_all(delay: Option<u32>) -> Self {
        Request::FlushAll { delay }
    }

    #[inline]
    pub fn version() -> Self {
        Request::Version
    }

    /// Append the encoded command to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Request::Get { keys } => put_retrieval(out, b"get", keys),
            Request::Gets { keys } => put_retrieval(out, b"gets", keys),
            Request::Store {
                verb,
                key,
                value,
                flags,
                exptime,
            } => put_storage(out, verb.token(), key, value, *flags, *exptime, None),
            Request::Cas {
                key,
                value,
                flags,
                exptime,
                cas_unique,
            } => put_storage(out, b"cas", key, value, *flags, *exptime, Some(*cas_unique)),
            Request::Incr { key, delta } => put_arith(out, b"incr", key, *delta),
            Request::Decr { key, delta } => put_arith(out, b"decr", key, *delta),
            Request::Delete { key, delay } => {
                out.extend_from_slice(b"delete ");
                out.extend_from_slice(key);
                if let Some(d) = delay {
                    // Write into a Vec cannot fail.
                    write!(out, " {d}").unwrap();
                }
                out.extend_from_slice(b"\r\n");
            }
            Request::FlushAll { delay } => {
                out.extend_from_slice(b"flush_all");
                if let Some(d) = delay {
                    write!(out, " {d}").unwrap();
                }
                out.extend_from_slice(b"\r\n");
            }
            Request::Version => out.extend_from_slice(b"version\r\n"),
        }
    }
}

fn put_retrieval(out: &mut Vec<u8>, verb: &[u8], keys: &[&[u8]]) {
    debug_assert!(!keys.is_empty(), "retrieval command needs at least one key");
    out.extend_from_slice(verb);
    for key in keys {
        out.push(b' ');
        out.extend_from_slice(key);
    }
    out.extend_from_slice(b"\r\n");
}

/// `<verb> <key> <flags> <exptime> <bytes>[ <cas>]\r\n<data>\r\n`
fn put_storage(
    out: &mut Vec<u8>,
    verb: &[u8],
    key: &[u8],
    value: &[u8],
    flags: u32,
    exptime: u32,
    cas: Option<u64>,
) {
    out.extend_from_slice(verb);
    out.push(b' ');
    out.extend_from_slice(key);
    match cas {
        Some(token) => write!(out, " {flags} {exptime} {} {token}\r\n", value.len()).unwrap(),
        None => write!(out, " {flags} {exptime} {}\r\n", value.len()).unwrap(),
    }
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn put_arith(out: &mut Vec<u8>, verb: &[u8], key: &[u8], delta: u64) {
    out.extend_from_slice(verb);
    out.push(b' ');
    out.extend_from_slice(key);
    write!(out, " {delta}\r\n").unwrap();
}
