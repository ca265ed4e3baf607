//! Memcache ASCII protocol support for the memshard client.
//!
//! This crate covers the wire half of a client connection: encoding
//! commands into an append-only outbound buffer and parsing replies
//! incrementally from an inbound buffer.
//!
//! Parsing is pull-based: [`Response::parse`] either returns a complete
//! reply plus the number of bytes it consumed, or
//! [`ParseError::Incomplete`] to signal that the caller should read more
//! bytes and retry. Nothing before a complete reply is consumed, so a
//! short read never desynchronizes the stream.
//!
//! # Example
//!
//! ```
//! use memshard_proto::{Request, Response};
//!
//! let mut outbox = Vec::new();
//! Request::incr(b"hits", 1).encode(&mut outbox);
//! assert_eq!(outbox, b"incr hits 1\r\n");
//!
//! let (reply, consumed) = Response::parse(b"7\r\n").unwrap();
//! assert_eq!(reply, Response::Numeric(7));
//! assert_eq!(consumed, 3);
//! ```

mod error;
mod request;
mod response;

pub use error::ParseError;
pub use request::{Request, StoreVerb};
pub use response::{Response, Value};
