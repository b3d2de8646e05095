//! Connection options.

use url::Url;

use crate::error::Error;

/// Default number of rows a named cursor fetches per round trip.
pub const DEFAULT_ITERSIZE: usize = 2000;

/// Execution mode, fixed when the connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Every operation blocks until the server answered.
    #[default]
    Sync,
    /// Queries are dispatched without blocking and driven with `poll()`.
    Async,
}

/// Connection options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path. Takes precedence over `host`.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name to use.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,

    /// Synchronous or asynchronous execution.
    ///
    /// Default: `Mode::Sync`
    pub mode: Mode,

    /// Start in autocommit mode. Asynchronous connections always autocommit.
    ///
    /// Default: `false`
    pub autocommit: bool,

    /// Initial `itersize` of the cursors created by the connection.
    ///
    /// Default: `2000`
    pub itersize: usize,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            params: Vec::new(),
            mode: Mode::Sync,
            autocommit: false,
            itersize: DEFAULT_ITERSIZE,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "True" | "1" | "yes" | "on" => Ok(true),
        "false" | "False" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidUsage(format!("Invalid {}: {}", key, value))),
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?param1=value1&param2=value2&..]`
    ///
    /// Supported query parameters:
    /// - `application_name`: application name
    /// - `socket`: Unix socket path
    /// - `async`: true/1/yes/on for an asynchronous connection
    /// - `autocommit`: true/1/yes/on or false/0/no/off
    /// - `itersize`: rows per named cursor fetch (positive integer)
    ///
    /// Anything else is sent to the server as a startup parameter.
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "postgresql", "pg"].contains(&url.scheme()) {
            return Err(Error::InvalidUsage(format!(
                "Invalid scheme: expected 'postgres://' or 'pg://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            database: url
                .path()
                .strip_prefix('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            ..Opts::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "application_name" => {
                    opts.application_name = Some(value.to_string());
                }
                "socket" => {
                    opts.socket = Some(value.to_string());
                }
                "async" => {
                    opts.mode = if parse_bool("async", &value)? {
                        Mode::Async
                    } else {
                        Mode::Sync
                    };
                }
                "autocommit" => {
                    opts.autocommit = parse_bool("autocommit", &value)?;
                }
                "itersize" => {
                    opts.itersize = value
                        .parse()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            Error::InvalidUsage(format!("Invalid itersize: {}", value))
                        })?;
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}
