//! Per-server connection engine.
//!
//! An engine owns one socket plus the buffers and bookkeeping around it:
//! an append-only outbox of framed commands, an inbox fed from the
//! socket, and a FIFO of pending requests. Replies arrive strictly in
//! command order, so reply N always belongs to `pending[0]` — the parser
//! pops exactly one entry per complete reply.
//!
//! Fire-and-forget commands still get a reply on the wire (`noreply` is
//! never sent). They are queued as [`Pending::Discard`]: the reply is
//! parsed structurally to keep the stream aligned, then dropped. The
//! same mechanism absorbs replies that arrive after their batch deadline
//! expired, which is why a timeout does not poison the connection.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BytesMut};
use memshard_proto::{ParseError, Request, Response};

use crate::error::{Error, Outcome};
use crate::net::Stream;

/// What kind of reply a simple (single-line) pending entry expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// set/add/replace/append/prepend → STORED / NOT_STORED
    Store,
    /// cas → STORED / EXISTS (lost the race) / NOT_FOUND (key gone)
    Cas,
    /// delete → DELETED / NOT_FOUND
    Delete,
    /// incr/decr → numeric / NOT_FOUND
    Arith,
    /// flush_all → OK
    Flush,
    /// version → VERSION <s>
    Version,
}

/// One outstanding request in a connection's FIFO.
#[derive(Debug)]
pub(crate) enum Pending {
    /// Expects a single-line reply delivered into one slot.
    Simple { expect: Expect, slot: usize },
    /// Expects a `VALUE ... END` block. Each requested wire key maps to a
    /// caller slot; keys the server omits resolve to `Miss`.
    Retrieval { keys: Vec<(Vec<u8>, usize)> },
    /// Reply is parsed for alignment and discarded (fire-and-forget, or a
    /// slot whose deadline already expired).
    Discard,
}

impl Pending {
    fn is_discard(&self) -> bool {
        matches!(self, Pending::Discard)
    }

    /// Slot indices this entry would have filled.
    fn slots(&self) -> Vec<usize> {
        match self {
            Pending::Simple { slot, .. } => vec![*slot],
            Pending::Retrieval { keys } => keys.iter().map(|(_, slot)| *slot).collect(),
            Pending::Discard => Vec::new(),
        }
    }
}

/// Raw per-slot result before the value transform runs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Wire {
    /// Boolean verdict of a store/delete/flush command.
    Flag(bool),
    /// New counter value from incr/decr.
    Number(u64),
    /// One retrieval hit.
    Found {
        flags: u32,
        data: Vec<u8>,
        cas: Option<u64>,
    },
    /// Server version string.
    Version(String),
}

pub(crate) type Slot = Option<Outcome<Wire>>;

pub(crate) struct Engine {
    stream: Stream,
    outbox: Vec<u8>,
    sent: usize,
    inbox: BytesMut,
    pending: VecDeque<Pending>,
    nowait_count: usize,
}

impl Engine {
    pub(crate) fn new(stream: Stream) -> Self {
        Engine {
            stream,
            outbox: Vec::new(),
            sent: 0,
            inbox: BytesMut::with_capacity(16 * 1024),
            pending: VecDeque::new(),
            nowait_count: 0,
        }
    }

    pub(crate) fn fd(&self) -> std::os::fd::RawFd {
        self.stream.fd()
    }

    /// Frame a command into the outbox without queueing anything. Must be
    /// paired with exactly one [`enqueue`](Engine::enqueue).
    pub(crate) fn frame(&mut self, request: &Request<'_>) {
        request.encode(&mut self.outbox);
    }

    /// Queue the pending entry for the most recently framed command.
    pub(crate) fn enqueue(&mut self, entry: Pending) {
        if entry.is_discard() {
            self.nowait_count += 1;
        }
        self.pending.push_back(entry);
    }

    /// Frame a command and queue its pending entry in one step.
    pub(crate) fn push(&mut self, request: &Request<'_>, entry: Pending) {
        self.frame(request);
        self.enqueue(entry);
    }

    /// Unsent outbox bytes remain.
    pub(crate) fn wants_write(&self) -> bool {
        self.sent < self.outbox.len()
    }

    /// Pending entries that still fill caller slots.
    pub(crate) fn live_pending(&self) -> usize {
        self.pending.len() - self.nowait_count
    }

    /// Any pending entry at all, including discards.
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn nowait_count(&self) -> usize {
        self.nowait_count
    }

    /// Write as much of the outbox as the socket accepts right now.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        while self.sent < self.outbox.len() {
            match self.stream.write(&self.outbox[self.sent..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.sent == self.outbox.len() {
            self.outbox.clear();
            self.sent = 0;
        }
        Ok(())
    }

    /// Read whatever the socket has into the inbox.
    ///
    /// Returns `Ok(false)` on orderly EOF, `Ok(true)` otherwise.
    pub(crate) fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse every complete reply in the inbox, resolving pending entries
    /// in FIFO order.
    ///
    /// An `Err` return means the connection must be torn down: the reply
    /// stream is unparseable, bytes arrived with nothing outstanding, or
    /// the server reported an error and `close_on_error` is set. The
    /// entry that triggered a server error has already been resolved when
    /// this returns.
    pub(crate) fn consume(&mut self, slots: &mut [Slot], close_on_error: bool) -> Result<(), Error> {
        loop {
            if self.pending.is_empty() {
                if !self.inbox.is_empty() {
                    return Err(Error::Protocol(ParseError::Protocol(
                        "reply with no outstanding command",
                    )));
                }
                return Ok(());
            }

            let (response, used) = match Response::parse(&self.inbox) {
                Ok(parsed) => parsed,
                Err(e) if e.is_incomplete() => return Ok(()),
                Err(e) => return Err(Error::Protocol(e)),
            };
            self.inbox.advance(used);

            let Some(entry) = self.pending.pop_front() else {
                return Ok(());
            };
            if entry.is_discard() {
                self.nowait_count -= 1;
                continue;
            }

            let error_token = match &response {
                Response::Error => Some("ERROR".to_string()),
                Response::ClientError(m) => Some(format!("CLIENT_ERROR {m}")),
                Response::ServerError(m) => Some(format!("SERVER_ERROR {m}")),
                _ => None,
            };
            if let Some(message) = error_token {
                let err = Error::Server(message);
                for slot in entry.slots() {
                    slots[slot] = Some(Outcome::Err(err.clone()));
                }
                if close_on_error {
                    return Err(err);
                }
                continue;
            }

            match entry {
                Pending::Simple { expect, slot } => {
                    slots[slot] = Some(resolve_simple(expect, response));
                }
                Pending::Retrieval { keys } => {
                    let Response::Values(values) = response else {
                        for (_, slot) in &keys {
                            slots[*slot] = Some(Outcome::Err(Error::Protocol(
                                ParseError::Protocol("expected a retrieval reply"),
                            )));
                        }
                        return Err(Error::Protocol(ParseError::Protocol(
                            "expected a retrieval reply",
                        )));
                    };
                    let mut by_key: HashMap<&[u8], &memshard_proto::Value> =
                        HashMap::with_capacity(values.len());
                    for value in &values {
                        by_key.insert(value.key.as_slice(), value);
                    }
                    for (key, slot) in &keys {
                        slots[*slot] = Some(match by_key.get(key.as_slice()) {
                            Some(value) => Outcome::Ok(Wire::Found {
                                flags: value.flags,
                                data: value.data.clone(),
                                cas: value.cas,
                            }),
                            // Unknown keys are absences, not errors.
                            None => Outcome::Miss,
                        });
                    }
                }
                Pending::Discard => continue,
            }
        }
    }

    /// Turn every live pending entry into a discard and report which
    /// slots were abandoned. Used when the batch deadline fires: the
    /// replies may still arrive late and must be parsed for alignment,
    /// but nobody is waiting for them anymore.
    pub(crate) fn abandon_live(&mut self) -> Vec<usize> {
        let mut orphaned = Vec::new();
        for entry in self.pending.iter_mut() {
            if entry.is_discard() {
                continue;
            }
            orphaned.extend(entry.slots());
            *entry = Pending::Discard;
            self.nowait_count += 1;
        }
        orphaned
    }

    /// Slots of every live pending entry; used when tearing the engine
    /// down so each can be resolved with the fatal error.
    pub(crate) fn take_live_slots(&mut self) -> Vec<usize> {
        let mut live = Vec::new();
        while let Some(entry) = self.pending.pop_front() {
            live.extend(entry.slots());
        }
        self.nowait_count = 0;
        live
    }
}

fn resolve_simple(expect: Expect, response: Response) -> Outcome<Wire> {
    use Response::*;
    match (expect, response) {
        (Expect::Store, Stored) => Outcome::Ok(Wire::Flag(true)),
        (Expect::Store, NotStored) => Outcome::Ok(Wire::Flag(false)),
        (Expect::Cas, Stored) => Outcome::Ok(Wire::Flag(true)),
        // Another writer won the race, or the key is gone entirely;
        // either way the swap did not happen.
        (Expect::Cas, Exists) | (Expect::Cas, NotFound) => Outcome::Ok(Wire::Flag(false)),
        (Expect::Delete, Deleted) => Outcome::Ok(Wire::Flag(true)),
        (Expect::Delete, NotFound) => Outcome::Ok(Wire::Flag(false)),
        (Expect::Arith, Numeric(n)) => Outcome::Ok(Wire::Number(n)),
        (Expect::Arith, NotFound) => Outcome::Miss,
        (Expect::Flush, Ok) => Outcome::Ok(Wire::Flag(true)),
        (Expect::Version, Version(v)) => Outcome::Ok(Wire::Version(v)),
        (_, other) => Outcome::Err(crate::error::Error::Protocol(ParseError::Protocol(
            reply_mismatch_name(&other),
        ))),
    }
}

fn reply_mismatch_name(response: &Response) -> &'static str {
    match response {
        Response::Values(_) => "unexpected retrieval reply",
        _ => "reply does not match the command",
    }
}
