//! Batch dispatch: readiness-polled I/O across the engines a batch
//! touches, bounded by one shared deadline.
//!
//! The drive loop owns no threads. Every engaged socket is registered
//! with `poll(2)`, writable engines flush their outboxes, readable ones
//! fill their inboxes and consume replies, and the loop exits when every
//! engaged engine has resolved its live entries or the deadline fires.
//! The deadline is batch-wide: one slow server cannot stretch the wait
//! for healthy servers sharing the call. Expired slots become
//! `Error::Timeout` and their connections survive — late replies are
//! absorbed as discards.

use std::time::Instant;

use tracing::debug;

use crate::addr::ServerAddr;
use crate::engine::{Engine, Slot};
use crate::error::{Error, Outcome};
use crate::failure::FailureTracker;
use crate::net;

/// Connection lifecycle of one server slot.
///
/// `Broken` is sticky until the next connect attempt: after an I/O or
/// protocol failure the engine is dropped and nothing is sent or read
/// until a later operation reopens the connection (failure tracker
/// permitting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Open,
    Broken,
}

/// One configured server: address, lazily-opened engine, lazily-learned
/// version.
pub(crate) struct Server {
    pub(crate) addr: ServerAddr,
    /// Canonical identity (`host:port` or socket path), cached for error
    /// messages and result maps.
    pub(crate) name: String,
    pub(crate) engine: Option<Engine>,
    pub(crate) state: ConnState,
    pub(crate) version: Option<String>,
}

impl Server {
    pub(crate) fn new(addr: ServerAddr) -> Self {
        let name = addr.to_string();
        Server {
            addr,
            name,
            engine: None,
            state: ConnState::Disconnected,
            version: None,
        }
    }
}

/// Open the server's engine if it is not already open. Consults the
/// failure tracker first: a shunned server fails here without a syscall.
pub(crate) fn ensure_connected(
    server: &mut Server,
    index: usize,
    connect_timeout: Option<std::time::Duration>,
    failures: &mut FailureTracker,
) -> Result<(), Error> {
    if server.engine.is_some() {
        return Ok(());
    }
    if !failures.may_connect(index, Instant::now()) {
        return Err(Error::Connect {
            server: server.name.clone(),
            reason: "shunned after repeated failures".into(),
        });
    }
    server.state = ConnState::Connecting;
    match net::connect(&server.addr, connect_timeout) {
        Ok(stream) => {
            server.engine = Some(Engine::new(stream));
            server.state = ConnState::Open;
            failures.record_success(index);
            Ok(())
        }
        Err(e) => {
            server.state = ConnState::Disconnected;
            failures.record_failure(index, Instant::now());
            Err(e)
        }
    }
}

/// Drive I/O for one batch until its engaged engines are quiet or the
/// deadline fires.
///
/// With `wait_nowait` the loop also waits out discard entries (used by
/// the destructor drain); a normal batch only waits for entries that
/// fill slots.
pub(crate) fn drive(
    servers: &mut [Server],
    engaged: &[usize],
    slots: &mut [Slot],
    deadline: Option<Instant>,
    close_on_error: bool,
    wait_nowait: bool,
    failures: &mut FailureTracker,
) {
    loop {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut active: Vec<usize> = Vec::new();
        for &index in engaged {
            let Some(engine) = servers[index].engine.as_ref() else {
                continue;
            };
            let waiting = if wait_nowait {
                engine.has_pending()
            } else {
                engine.live_pending() > 0
            };
            if !engine.wants_write() && !waiting {
                continue;
            }
            let mut events: libc::c_short = libc::POLLIN;
            if engine.wants_write() {
                events |= libc::POLLOUT;
            }
            fds.push(libc::pollfd {
                fd: engine.fd(),
                events,
                revents: 0,
            });
            active.push(index);
        }
        if active.is_empty() {
            return;
        }

        let timeout_ms: libc::c_int = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    expire(servers, engaged, slots);
                    return;
                }
                // Round up so a sub-millisecond remainder does not spin.
                ((d - now).as_millis() as i64 + 1).min(i32::MAX as i64) as libc::c_int
            }
            None => -1,
        };

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            for &index in &active {
                let error = Error::Io {
                    server: servers[index].name.clone(),
                    reason: err.to_string(),
                };
                teardown(servers, index, error, slots, failures);
            }
            return;
        }
        if rc == 0 {
            // poll timed out; the loop top re-checks the deadline
            continue;
        }

        for (pollfd, &index) in fds.iter().zip(&active) {
            if pollfd.revents != 0 {
                service(servers, index, pollfd.revents, slots, close_on_error, failures);
            }
        }
    }
}

/// Handle one ready socket: flush, fill, consume. Any failure tears the
/// engine down and errors its remaining slots.
fn service(
    servers: &mut [Server],
    index: usize,
    revents: libc::c_short,
    slots: &mut [Slot],
    close_on_error: bool,
    failures: &mut FailureTracker,
) {
    let server = &mut servers[index];
    let Some(engine) = server.engine.as_mut() else {
        return;
    };

    let mut verdict: Result<(), Error> = Ok(());

    if revents & libc::POLLOUT != 0 {
        if let Err(e) = engine.flush() {
            verdict = Err(Error::Io {
                server: server.name.clone(),
                reason: e.to_string(),
            });
        }
    }

    if verdict.is_ok() && revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
        match engine.fill() {
            Ok(still_open) => {
                verdict = engine.consume(slots, close_on_error);
                if verdict.is_ok() && !still_open {
                    // Orderly EOF: parse what arrived, then the
                    // connection is gone.
                    verdict = Err(Error::Disconnected);
                }
            }
            Err(e) => {
                verdict = Err(Error::Io {
                    server: server.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    } else if verdict.is_ok() && revents & libc::POLLNVAL != 0 {
        verdict = Err(Error::Io {
            server: server.name.clone(),
            reason: "stale descriptor".into(),
        });
    }

    if let Err(error) = verdict {
        teardown(servers, index, error, slots, failures);
    }
}

/// Drop the engine, error every slot it still owed, count the failure.
pub(crate) fn teardown(
    servers: &mut [Server],
    index: usize,
    error: Error,
    slots: &mut [Slot],
    failures: &mut FailureTracker,
) {
    let server = &mut servers[index];
    debug!(server = %server.name, %error, "dropping connection");
    if let Some(mut engine) = server.engine.take() {
        for slot in engine.take_live_slots() {
            if slots[slot].is_none() {
                slots[slot] = Some(Outcome::Err(error.clone()));
            }
        }
    }
    server.state = ConnState::Broken;
    failures.record_failure(index, Instant::now());
}

/// Deadline fired: abandoned live entries become discards (their replies
/// may still arrive and must be parsed), their slots report `Timeout`,
/// and every connection stays open.
fn expire(servers: &mut [Server], engaged: &[usize], slots: &mut [Slot]) {
    for &index in engaged {
        let Some(engine) = servers[index].engine.as_mut() else {
            continue;
        };
        for slot in engine.abandon_live() {
            if slots[slot].is_none() {
                slots[slot] = Some(Outcome::Err(Error::Timeout));
            }
        }
    }
}
