//! Server address forms and resolution.
//!
//! Two address families: TCP `host:port` and filesystem sockets, written
//! as an absolute path. The `Display` form is the canonical identity used
//! to key result maps and to place ketama ring points.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

/// Address of one cache server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddr {
    /// TCP endpoint. `host` may be a name or a literal address; it is
    /// resolved at connect time and may expand to several socket
    /// addresses (IPv4/IPv6), which the connector tries in order.
    Tcp { host: String, port: u16 },
    /// Filesystem socket, given as an absolute path.
    Unix { path: PathBuf },
}

impl ServerAddr {
    /// Resolve to concrete socket addresses. Only meaningful for TCP.
    pub(crate) fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        match self {
            ServerAddr::Tcp { host, port } => {
                Ok((host.as_str(), *port).to_socket_addrs()?.collect())
            }
            ServerAddr::Unix { .. } => Ok(Vec::new()),
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp { host, port } => write!(f, "{host}:{port}"),
            ServerAddr::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for ServerAddr {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self, Error> {
        if spec.starts_with('/') {
            return Ok(ServerAddr::Unix {
                path: PathBuf::from(spec),
            });
        }
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("server spec {spec:?} has no port")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("server spec {spec:?} has no host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("server spec {spec:?} has a bad port")))?;
        Ok(ServerAddr::Tcp {
            host: host.to_string(),
            port,
        })
    }
}
