//! In-process mock memcached servers for integration tests.
//!
//! Each mock speaks enough of the ASCII dialect to exercise the client:
//! storage verbs, retrieval with and without CAS, arithmetic, delete,
//! flush_all (recording the delay argument), and version. Options allow
//! scripting a reply delay, an early connection drop, and an arbitrary
//! version string.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoredItem {
    pub flags: u32,
    pub data: Vec<u8>,
    pub cas: u64,
}

/// Observable state shared between the mock and the test body.
#[derive(Default)]
pub struct Stats {
    pub connections: AtomicUsize,
    pub commands: AtomicUsize,
    pub flush_delays: Mutex<Vec<Option<u32>>>,
    pub command_log: Mutex<Vec<String>>,
    pub items: Mutex<HashMap<String, StoredItem>>,
    cas_counter: AtomicU64,
}

impl Stats {
    pub fn item(&self, key: &str) -> Option<StoredItem> {
        self.items.lock().unwrap().get(key).cloned()
    }

    pub fn inject(&self, key: &str, flags: u32, data: Vec<u8>) {
        let cas = self.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.items
            .lock()
            .unwrap()
            .insert(key.to_string(), StoredItem { flags, data, cas });
    }
}

#[derive(Clone)]
pub struct MockOptions {
    pub version: String,
    /// Sleep this long before answering each command.
    pub delay: Option<Duration>,
    /// Drop the connection (without replying) once this many commands
    /// have arrived on it.
    pub die_after: Option<usize>,
}

impl Default for MockOptions {
    fn default() -> Self {
        MockOptions {
            version: "1.6.21".to_string(),
            delay: None,
            die_after: None,
        }
    }
}

pub struct MockServer {
    pub addr: String,
    pub stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start() -> MockServer {
        MockServer::start_with(MockOptions::default())
    }

    pub fn start_with(options: MockOptions) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        listener.set_nonblocking(true).unwrap();

        let stats = Arc::new(Stats::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_stats = Arc::clone(&stats);
        let accept_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            loop {
                if accept_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        accept_stats.connections.fetch_add(1, Ordering::SeqCst);
                        let conn_stats = Arc::clone(&accept_stats);
                        let conn_options = options.clone();
                        thread::spawn(move || serve(stream, conn_stats, conn_options));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        MockServer {
            addr,
            stats,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn start_unix(path: &Path) -> MockServer {
        let listener = UnixListener::bind(path).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = path.display().to_string();

        let stats = Arc::new(Stats::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let options = MockOptions::default();

        let accept_stats = Arc::clone(&stats);
        let accept_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            loop {
                if accept_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        accept_stats.connections.fetch_add(1, Ordering::SeqCst);
                        let conn_stats = Arc::clone(&accept_stats);
                        let conn_options = options.clone();
                        thread::spawn(move || serve(stream, conn_stats, conn_options));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        MockServer {
            addr,
            stats,
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Buffered command reader over one connection.
struct Conn<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: Read> Conn<S> {
    fn line(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(at) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf[..at].to_vec();
                self.buf.drain(..at + 2);
                return Some(line);
            }
            if !self.fill() {
                return None;
            }
        }
    }

    fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        while self.buf.len() < n + 2 {
            if !self.fill() {
                return None;
            }
        }
        let data = self.buf[..n].to_vec();
        self.buf.drain(..n + 2);
        Some(data)
    }

    fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk) {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
        }
    }
}

fn serve<S: Read + Write>(stream: S, stats: Arc<Stats>, options: MockOptions) {
    let mut conn = Conn {
        stream,
        buf: Vec::new(),
    };
    let mut seen = 0usize;

    loop {
        let Some(line) = conn.line() else { return };
        let text = String::from_utf8_lossy(&line).into_owned();
        let words: Vec<&str> = text.split(' ').filter(|w| !w.is_empty()).collect();
        let Some(&verb) = words.first() else { return };

        seen += 1;
        stats.commands.fetch_add(1, Ordering::SeqCst);
        stats.command_log.lock().unwrap().push(text.clone());

        if let Some(limit) = options.die_after {
            if seen >= limit {
                return;
            }
        }
        if let Some(delay) = options.delay {
            thread::sleep(delay);
        }

        let reply: Vec<u8> = match verb {
            "get" | "gets" => {
                let with_cas = verb == "gets";
                let mut out = Vec::new();
                let items = stats.items.lock().unwrap();
                for key in &words[1..] {
                    if let Some(item) = items.get(*key) {
                        if with_cas {
                            out.extend_from_slice(
                                format!(
                                    "VALUE {key} {} {} {}\r\n",
                                    item.flags,
                                    item.data.len(),
                                    item.cas
                                )
                                .as_bytes(),
                            );
                        } else {
                            out.extend_from_slice(
                                format!("VALUE {key} {} {}\r\n", item.flags, item.data.len())
                                    .as_bytes(),
                            );
                        }
                        out.extend_from_slice(&item.data);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                out.extend_from_slice(b"END\r\n");
                out
            }
            "set" | "add" | "replace" | "append" | "prepend" => {
                let key = words[1].to_string();
                let flags: u32 = words[2].parse().unwrap();
                let len: usize = words[4].parse().unwrap();
                let Some(payload) = conn.take(len) else { return };

                let mut items = stats.items.lock().unwrap();
                let exists = items.contains_key(&key);
                let stored = match verb {
                    "add" if exists => false,
                    "replace" if !exists => false,
                    "append" | "prepend" if !exists => false,
                    "append" => {
                        if let Some(item) = items.get_mut(&key) {
                            item.data.extend_from_slice(&payload);
                            item.cas = stats.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        }
                        true
                    }
                    "prepend" => {
                        if let Some(item) = items.get_mut(&key) {
                            let mut joined = payload.clone();
                            joined.extend_from_slice(&item.data);
                            item.data = joined;
                            item.cas = stats.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        }
                        true
                    }
                    _ => {
                        let cas = stats.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        items.insert(
                            key,
                            StoredItem {
                                flags,
                                data: payload,
                                cas,
                            },
                        );
                        true
                    }
                };
                if stored {
                    b"STORED\r\n".to_vec()
                } else {
                    b"NOT_STORED\r\n".to_vec()
                }
            }
            "cas" => {
                let key = words[1].to_string();
                let flags: u32 = words[2].parse().unwrap();
                let len: usize = words[4].parse().unwrap();
                let token: u64 = words[5].parse().unwrap();
                let Some(payload) = conn.take(len) else { return };

                let mut items = stats.items.lock().unwrap();
                match items.get(&key) {
                    None => b"NOT_FOUND\r\n".to_vec(),
                    Some(item) if item.cas != token => b"EXISTS\r\n".to_vec(),
                    Some(_) => {
                        let cas = stats.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        items.insert(
                            key,
                            StoredItem {
                                flags,
                                data: payload,
                                cas,
                            },
                        );
                        b"STORED\r\n".to_vec()
                    }
                }
            }
            "incr" | "decr" => {
                let key = words[1];
                let delta: u64 = words[2].parse().unwrap();
                let mut items = stats.items.lock().unwrap();
                match items.get_mut(key) {
                    None => b"NOT_FOUND\r\n".to_vec(),
                    Some(item) => match String::from_utf8_lossy(&item.data).trim().parse::<u64>() {
                        Err(_) => {
                            b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
                                .to_vec()
                        }
                        Ok(current) => {
                            let next = if verb == "incr" {
                                current.wrapping_add(delta)
                            } else {
                                current.saturating_sub(delta)
                            };
                            item.data = next.to_string().into_bytes();
                            format!("{next}\r\n").into_bytes()
                        }
                    },
                }
            }
            "delete" => {
                let key = words[1];
                if stats.items.lock().unwrap().remove(key).is_some() {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                }
            }
            "flush_all" => {
                let delay = words.get(1).map(|d| d.parse().unwrap());
                stats.flush_delays.lock().unwrap().push(delay);
                stats.items.lock().unwrap().clear();
                b"OK\r\n".to_vec()
            }
            "version" => format!("VERSION {}\r\n", options.version).into_bytes(),
            _ => b"ERROR\r\n".to_vec(),
        };

        if conn.stream.write_all(&reply).is_err() {
            return;
        }
    }
}
