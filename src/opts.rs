//! Connection configuration.

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

/// Configuration for a connection engine.
///
/// A plain struct with a `#[no_panic]` default and `TryFrom` parsers for
/// a connection URL, validated eagerly rather than lazily at first use.
#[derive(Debug, Clone)]
pub struct Opts {
    pub host: String,
    pub port: u16,
    /// Per-socket read/write timeout. `None` means block indefinitely.
    pub io_timeout: Option<Duration>,
    /// How long `wait()` blocks on a single completion before raising
    /// `Error::Timeout`.
    pub sync_timeout: Duration,
    pub password: Option<String>,
    /// Sent via `CLIENT SETNAME` during the init handshake, if set.
    pub name: Option<String>,
    /// Caps the `unsent` queue length; `None` means unbounded.
    pub max_unsent: Option<usize>,
    /// Whether `Error::Timeout` carries the oldest in-flight command's
    /// summary (command name plus the first few argument bytes).
    pub include_detail_in_timeouts: bool,
}

#[no_panic::no_panic]
impl Default for Opts {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 6379,
            io_timeout: None,
            sync_timeout: Duration::from_millis(10_000),
            password: None,
            name: None,
            max_unsent: None,
            include_detail_in_timeouts: false,
        }
    }
}

impl Opts {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Configuration("host must not be empty".to_string()));
        }
        if let Some(name) = &self.name {
            let printable = !name.is_empty() && name.bytes().all(|b| (b'!'..=b'~').contains(&b));
            if !printable {
                return Err(Error::Configuration(format!(
                    "invalid client name {name:?}: must be non-empty printable ASCII ('!'..'~') with no whitespace"
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    #[no_panic::no_panic]
    fn try_from(value: &Url) -> Result<Self> {
        if value.scheme() != "redis" {
            return Err(Error::Configuration(format!(
                "unsupported URL scheme {:?}, expected \"redis\"",
                value.scheme()
            )));
        }
        let mut opts = Opts {
            host: value.host_str().unwrap_or("127.0.0.1").to_string(),
            port: value.port().unwrap_or(6379),
            password: value.password().map(str::to_string),
            ..Opts::default()
        };
        for (key, val) in value.query_pairs() {
            match key.as_ref() {
                "name" => opts.name = Some(val.into_owned()),
                "io_timeout_ms" => {
                    if let Ok(ms) = val.parse::<u64>() {
                        opts.io_timeout = Some(Duration::from_millis(ms));
                    }
                }
                "sync_timeout_ms" => {
                    if let Ok(ms) = val.parse::<u64>() {
                        opts.sync_timeout = Duration::from_millis(ms);
                    }
                }
                "max_unsent" => {
                    if let Ok(n) = val.parse::<usize>() {
                        opts.max_unsent = Some(n);
                    }
                }
                "include_detail_in_timeouts" => {
                    opts.include_detail_in_timeouts = val == "true" || val == "1";
                }
                _ => {}
            }
        }
        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        let url = Url::parse(value)
            .map_err(|e| Error::Configuration(format!("invalid connection URL: {e}")))?;
        Opts::try_from(&url)
    }
}
