//! Client configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::addr::ServerAddr;
use crate::error::Error;

/// One configured server: address plus routing weight.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSpec {
    pub addr: ServerAddr,
    /// Positive routing weight; 1 is the default share.
    pub weight: f64,
}

impl ServerSpec {
    pub fn new(addr: ServerAddr) -> Self {
        ServerSpec { addr, weight: 1.0 }
    }

    pub fn weighted(addr: ServerAddr, weight: f64) -> Self {
        ServerSpec { addr, weight }
    }
}

impl FromStr for ServerSpec {
    type Err = Error;

    /// Parse `"host:port"` or an absolute socket path, weight 1.
    fn from_str(spec: &str) -> Result<Self, Error> {
        Ok(ServerSpec::new(spec.parse()?))
    }
}

/// Client configuration.
///
/// Fields are public and can be set directly; [`ConfigBuilder`] offers
/// chained setters with validation at `build()`. Either way the client
/// validates at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Servers in insertion order. Order matters: it fixes server
    /// indices, ketama identities and the flush_all delay spread.
    pub servers: Vec<ServerSpec>,
    /// Prefix applied to every user key before hashing and before it goes
    /// on the wire.
    pub namespace: String,
    /// Per-attempt connect bound. `None` means no bound.
    pub connect_timeout: Option<Duration>,
    /// Per-batch I/O bound shared by every server in the batch. `None`
    /// means no bound.
    pub io_timeout: Option<Duration>,
    /// Drop a connection when the server answers with an error token.
    pub close_on_error: bool,
    /// Try compressing values at least this large. `None` disables
    /// compression.
    pub compress_threshold: Option<usize>,
    /// Keep the compressed form only when `compressed ≤ ratio × original`.
    pub compress_ratio: f64,
    /// Name of the compression algorithm. Unknown names log a warning and
    /// disable compression.
    pub compress_algo: String,
    /// Shun a server after this many errors inside one failure window.
    /// 0 disables failure tracking.
    pub max_failures: u32,
    /// Width of the failure window, and how long a shun lasts.
    pub failure_timeout: Duration,
    /// Ketama points per unit of weight. 0 selects the legacy weighted
    /// table.
    pub ketama_points: u32,
    /// Allow fire-and-forget for quiet calls. When off, quiet calls run
    /// synchronously and discard the result.
    pub nowait: bool,
    /// Transcode character strings to UTF-8 with flag bit b2.
    pub utf8: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            servers: Vec::new(),
            namespace: String::new(),
            connect_timeout: Some(Duration::from_millis(250)),
            io_timeout: Some(Duration::from_secs(1)),
            close_on_error: true,
            compress_threshold: None,
            compress_ratio: 0.8,
            compress_algo: "gzip".to_string(),
            max_failures: 0,
            failure_timeout: Duration::from_secs(10),
            ketama_points: 0,
            nowait: false,
            utf8: false,
        }
    }
}

impl Config {
    /// Check values that cannot work at all. Soft problems (an unknown
    /// compression algorithm) are handled by downgrading, not here.
    pub fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::Config("no servers configured".into()));
        }
        for spec in &self.servers {
            if !(spec.weight > 0.0) || !spec.weight.is_finite() {
                return Err(Error::Config(format!(
                    "server {} has non-positive weight {}",
                    spec.addr, spec.weight
                )));
            }
        }
        if !(self.compress_ratio > 0.0 && self.compress_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "compress_ratio {} is outside (0, 1]",
                self.compress_ratio
            )));
        }
        if self.failure_timeout.is_zero() {
            return Err(Error::Config("failure_timeout must be positive".into()));
        }
        if self
            .namespace
            .bytes()
            .any(|b| b <= b' ' || b == 0x7f)
        {
            return Err(Error::Config(
                "namespace contains space or control bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`] with a validating `build()`.
///
/// # Example
///
/// ```
/// use memshard::Config;
/// use std::time::Duration;
///
/// let config = Config::builder()
///     .server("10.0.0.1:11211").unwrap()
///     .weighted_server("10.0.0.2:11211", 2.0).unwrap()
///     .namespace("app:")
///     .ketama_points(160)
///     .io_timeout(Some(Duration::from_millis(500)))
///     .build()
///     .unwrap();
/// assert_eq!(config.servers.len(), 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Add a server from a `"host:port"` or absolute-path spec, weight 1.
    pub fn server(mut self, spec: &str) -> Result<Self, Error> {
        self.config.servers.push(spec.parse()?);
        Ok(self)
    }

    /// Add a server with an explicit weight.
    pub fn weighted_server(mut self, spec: &str, weight: f64) -> Result<Self, Error> {
        let addr: ServerAddr = spec.parse()?;
        self.config.servers.push(ServerSpec::weighted(addr, weight));
        Ok(self)
    }

    /// Add an already-parsed server spec.
    pub fn server_spec(mut self, spec: ServerSpec) -> Self {
        self.config.servers.push(spec);
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.config.namespace = namespace.to_string();
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    pub fn close_on_error(mut self, enable: bool) -> Self {
        self.config.close_on_error = enable;
        self
    }

    /// Enable compression for values of at least `threshold` bytes.
    pub fn compress_threshold(mut self, threshold: Option<usize>) -> Self {
        self.config.compress_threshold = threshold;
        self
    }

    pub fn compress_ratio(mut self, ratio: f64) -> Self {
        self.config.compress_ratio = ratio;
        self
    }

    pub fn compress_algo(mut self, algo: &str) -> Self {
        self.config.compress_algo = algo.to_string();
        self
    }

    pub fn max_failures(mut self, count: u32) -> Self {
        self.config.max_failures = count;
        self
    }

    pub fn failure_timeout(mut self, window: Duration) -> Self {
        self.config.failure_timeout = window;
        self
    }

    /// Enable ketama routing with this many points per unit of weight.
    pub fn ketama_points(mut self, points: u32) -> Self {
        self.config.ketama_points = points;
        self
    }

    pub fn nowait(mut self, enable: bool) -> Self {
        self.config.nowait = enable;
        self
    }

    pub fn utf8(mut self, enable: bool) -> Self {
        self.config.utf8 = enable;
        self
    }

    /// Validate and produce the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
