//! Bounded connector and the non-blocking stream it produces.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::addr::ServerAddr;
use crate::error::Error;

/// A connected, non-blocking socket to one cache server.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub(crate) fn fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }
}

/// Connect to `addr` and return a non-blocking stream with Nagle disabled.
///
/// For TCP the name may resolve to several addresses; each is tried in
/// order with `timeout` applied per attempt, so a multi-homed name can
/// take longer than one timeout in total. `None` means no bound.
pub(crate) fn connect(addr: &ServerAddr, timeout: Option<Duration>) -> Result<Stream, Error> {
    let connect_err = |reason: String| Error::Connect {
        server: addr.to_string(),
        reason,
    };

    match addr {
        ServerAddr::Tcp { .. } => {
            let candidates = addr.resolve().map_err(|e| connect_err(e.to_string()))?;
            if candidates.is_empty() {
                return Err(connect_err("name resolved to no addresses".into()));
            }
            let mut last = None;
            for candidate in &candidates {
                let attempt = match timeout {
                    Some(bound) => TcpStream::connect_timeout(candidate, bound),
                    None => TcpStream::connect(candidate),
                };
                match attempt {
                    Ok(stream) => {
                        stream
                            .set_nodelay(true)
                            .and_then(|_| stream.set_nonblocking(true))
                            .map_err(|e| connect_err(e.to_string()))?;
                        return Ok(Stream::Tcp(stream));
                    }
                    Err(e) => last = Some(e),
                }
            }
            // candidates was non-empty, so at least one attempt ran
            Err(connect_err(
                last.map(|e| e.to_string()).unwrap_or_default(),
            ))
        }
        ServerAddr::Unix { path } => {
            // Local connect either succeeds immediately or fails; the
            // per-attempt timeout does not apply.
            let stream = UnixStream::connect(path).map_err(|e| connect_err(e.to_string()))?;
            stream
                .set_nonblocking(true)
                .map_err(|e| connect_err(e.to_string()))?;
            Ok(Stream::Unix(stream))
        }
    }
}
