//! Reply parsing for the Memcache ASCII dialect.
//!
//! Reply forms:
//! - single-token lines: `STORED`, `NOT_STORED`, `EXISTS`, `NOT_FOUND`,
//!   `DELETED`, `OK`, `ERROR`
//! - message lines: `CLIENT_ERROR <msg>`, `SERVER_ERROR <msg>`,
//!   `VERSION <string>`
//! - bare decimal: the new counter value after `incr`/`decr`
//! - retrieval blocks: zero or more
//!   `VALUE <key> <flags> <bytes>[ <cas>]\r\n<data>\r\n` terminated by
//!   `END\r\n`
//!
//! The parser never consumes a partial reply: either a full reply is
//! returned together with its consumed length, or
//! [`ParseError::Incomplete`] tells the caller to read more first.

use crate::error::ParseError;

/// One `VALUE` block from a retrieval reply.
///
/// `data` is copied out of the read buffer on hand-off so the buffer can
/// be reused for the next read cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub key: Vec<u8>,
    pub flags: u32,
    pub data: Vec<u8>,
    /// CAS token; present when the command was `gets`.
    pub cas: Option<u64>,
}

/// A complete parsed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Retrieval reply. Missing keys simply do not appear; an empty vec is
    /// a miss for every requested key.
    Values(Vec<Value>),
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Ok,
    /// New counter value after `incr`/`decr`.
    Numeric(u64),
    Version(String),
    Error,
    ClientError(String),
    ServerError(String),
}

impl Response {
    /// True for `ERROR`, `CLIENT_ERROR` and `SERVER_ERROR`.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Response::Error | Response::ClientError(_) | Response::ServerError(_)
        )
    }

    /// Parse one reply from the front of `data`.
    ///
    /// Returns the reply and the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let line_end = find_crlf(data).ok_or(ParseError::Incomplete)?;
        let line = &data[..line_end];

        // Retrieval blocks span multiple lines; everything else is one line.
        if line.starts_with(b"VALUE ") || line == b"END" {
            return parse_values(data);
        }

        let reply = match line {
            b"STORED" => Response::Stored,
            b"NOT_STORED" => Response::NotStored,
            b"EXISTS" => Response::Exists,
            b"NOT_FOUND" => Response::NotFound,
            b"DELETED" => Response::Deleted,
            b"OK" => Response::Ok,
            b"ERROR" => Response::Error,
            _ => {
                if let Some(msg) = line.strip_prefix(b"CLIENT_ERROR ") {
                    Response::ClientError(String::from_utf8_lossy(msg).into_owned())
                } else if let Some(msg) = line.strip_prefix(b"SERVER_ERROR ") {
                    Response::ServerError(String::from_utf8_lossy(msg).into_owned())
                } else if let Some(v) = line.strip_prefix(b"VERSION ") {
                    Response::Version(String::from_utf8_lossy(v).into_owned())
                } else if !line.is_empty() && line.iter().all(u8::is_ascii_digit) {
                    Response::Numeric(ascii_u64(line)?)
                } else {
                    return Err(ParseError::Protocol("unrecognized reply"));
                }
            }
        };
        Ok((reply, line_end + 2))
    }
}

/// Position of the `\r` of the first complete CRLF, if any.
fn find_crlf(data: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = memchr::memchr(b'\r', &data[from..]) {
        let at = from + pos;
        if at + 1 < data.len() {
            if data[at + 1] == b'\n' {
                return Some(at);
            }
            from = at + 1;
        } else {
            return None;
        }
    }
    None
}

/// Parse `VALUE ... END` retrieval blocks starting at `data[0]`.
fn parse_values(data: &[u8]) -> Result<(Response, usize), ParseError> {
    let mut values = Vec::new();
    let mut at = 0;

    loop {
        let rest = &data[at..];
        let line_end = find_crlf(rest).ok_or(ParseError::Incomplete)?;
        let line = &rest[..line_end];

        if line == b"END" {
            return Ok((Response::Values(values), at + line_end + 2));
        }

        let header = line
            .strip_prefix(b"VALUE ")
            .ok_or(ParseError::Protocol("expected VALUE or END"))?;

        // VALUE <key> <flags> <bytes>[ <cas>]
        let mut fields = header.split(|&b| b == b' ').filter(|f| !f.is_empty());
        let key = fields.next().ok_or(ParseError::Protocol("VALUE without key"))?;
        let flags = ascii_u32(fields.next().ok_or(ParseError::Protocol("VALUE without flags"))?)?;
        let len = ascii_u64(fields.next().ok_or(ParseError::Protocol("VALUE without length"))?)?;
        let cas = match fields.next() {
            Some(field) => Some(ascii_u64(field)?),
            None => None,
        };
        if fields.next().is_some() {
            return Err(ParseError::Protocol("trailing fields on VALUE line"));
        }

        let len = usize::try_from(len).map_err(|_| ParseError::InvalidNumber)?;
        at += line_end + 2;

        // Payload plus its trailing CRLF must be fully buffered.
        let payload_end = at
            .checked_add(len)
            .ok_or(ParseError::Protocol("value length overflow"))?;
        if data.len() < payload_end.saturating_add(2) {
            return Err(ParseError::Incomplete);
        }
        if &data[payload_end..payload_end + 2] != b"\r\n" {
            return Err(ParseError::Protocol("value payload not CRLF-terminated"));
        }

        values.push(Value {
            key: key.to_vec(),
            flags,
            data: data[at..payload_end].to_vec(),
            cas,
        });
        at = payload_end + 2;
    }
}

fn ascii_u64(field: &[u8]) -> Result<u64, ParseError> {
    if field.is_empty() || field.len() > 20 {
        return Err(ParseError::InvalidNumber);
    }
    let mut n: u64 = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            return Err(ParseError::InvalidNumber);
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(b - b'0')))
            .ok_or(ParseError::InvalidNumber)?;
    }
    Ok(n)
}

fn ascii_u32(field: &[u8]) -> Result<u32, ParseError> {
    u32::try_from(ascii_u64(field)?).map_err(|_| ParseError::InvalidNumber)
}
