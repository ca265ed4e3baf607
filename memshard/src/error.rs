//! Error taxonomy and per-slot outcomes.

use memshard_proto::ParseError;
use thiserror::Error;

/// Errors surfaced by the client.
///
/// `Clone` is deliberate: one socket failure fans out into every
/// unresolved slot of the batch that was using that connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid configuration detected at construction.
    #[error("config: {0}")]
    Config(String),

    /// Key rejected client-side (empty, too long, or containing space or
    /// control bytes) before anything touched the wire.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The connector could not produce a usable socket, including the
    /// fail-fast case while a server is shunned.
    #[error("connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    /// Socket I/O failed after the connection was established.
    #[error("i/o on {server}: {reason}")]
    Io { server: String, reason: String },

    /// The batch deadline expired before this slot's reply arrived. The
    /// connection is kept; the late reply will be parsed and discarded.
    #[error("deadline expired before reply")]
    Timeout,

    /// The reply stream could not be parsed. Always breaks the connection.
    #[error(transparent)]
    Protocol(#[from] ParseError),

    /// The server answered `ERROR`, `CLIENT_ERROR` or `SERVER_ERROR`.
    #[error("server error: {0}")]
    Server(String),

    /// The command needs a newer server (cas/gets/append/prepend require
    /// 1.2.4); the command was not sent.
    #[error("server {server} runs {version}, command needs {required}")]
    ServerTooOld {
        server: String,
        version: String,
        required: &'static str,
    },

    /// Compression or codec transform failed for one value. Never affects
    /// the connection or other keys in the batch.
    #[error("value transform: {0}")]
    Transform(String),

    /// The connection was lost before this slot's reply arrived.
    #[error("connection lost before reply")]
    Disconnected,
}

/// Per-key result of a batch operation.
///
/// `Miss` is a well-formed "not there" (absent key, vanished counter) and
/// is distinct from `Err`, which means the operation itself failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    Miss,
    Err(Error),
}

impl<T> Outcome<T> {
    /// The success value, if any.
    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Outcome::Miss)
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Outcome::Err(_))
    }

    /// Collapse into a `Result`, mapping `Miss` to `None`. Used by the
    /// single-key facade methods.
    pub fn into_result(self) -> Result<Option<T>, Error> {
        match self {
            Outcome::Ok(v) => Ok(Some(v)),
            Outcome::Miss => Ok(None),
            Outcome::Err(e) => Err(e),
        }
    }

    /// Map the success value, keeping `Miss`/`Err` as-is.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Miss => Outcome::Miss,
            Outcome::Err(e) => Outcome::Err(e),
        }
    }

    /// Map the success value through a fallible transform.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Result<U, Error>) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => match f(v) {
                Ok(u) => Outcome::Ok(u),
                Err(e) => Outcome::Err(e),
            },
            Outcome::Miss => Outcome::Miss,
            Outcome::Err(e) => Outcome::Err(e),
        }
    }
}
