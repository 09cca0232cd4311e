//! Command-line interface for coordkit.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;

/// Command-line arguments.
///
/// Everything except the flags is optional so that unset options fall back
/// to the environment, the config file and then the defaults.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Host address for the HTTP API.
    pub host: Option<IpAddr>,
    /// Port for the HTTP API.
    pub port: Option<u16>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Endpoints the embedded ensemble serves and the client connects to.
    pub endpoints: Vec<String>,
    /// Requested session timeout in milliseconds.
    pub session_timeout_ms: Option<u64>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('H') | Long("host") => {
                let value: String = parser.value()?.parse()?;
                result.host = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("host", value))?,
                );
            }
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('e') | Long("endpoint") => {
                let value: String = parser.value()?.parse()?;
                if !is_endpoint(&value) {
                    return Err(ArgsError::InvalidValue("endpoint", value));
                }
                result.endpoints.push(value);
            }
            Long("session-timeout") => {
                let value: String = parser.value()?.parse()?;
                let ms: u64 = value
                    .parse()
                    .ok()
                    .filter(|ms| *ms > 0)
                    .ok_or(ArgsError::InvalidValue("session-timeout", value))?;
                result.session_timeout_ms = Some(ms);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

/// `host:port` with a numeric port.
fn is_endpoint(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"coordkit {version}
Coordination-service client with sessions, versioned nodes and cached watches

USAGE:
    coordkit [OPTIONS]

OPTIONS:
    -H, --host <ADDR>            HTTP API host address [default: 127.0.0.1]
    -p, --port <PORT>            HTTP API port [default: 3000]
    -c, --config <FILE>          Path to configuration file (JSON)
    -e, --endpoint <HOST:PORT>   Ensemble endpoint, repeatable [default: 127.0.0.1:2181]
        --session-timeout <MS>   Requested session timeout in milliseconds
    -l, --log-level <LVL>        Log level (error, warn, info, debug, trace)
    -h, --help                   Print help
    -V, --version                Print version

ENVIRONMENT VARIABLES:
    COORDKIT_HOST                 HTTP API host (overrides config)
    COORDKIT_PORT                 HTTP API port (overrides config)
    COORDKIT_ENDPOINT             Comma-separated endpoints (overrides config)
    COORDKIT_SESSION_TIMEOUT_MS   Session timeout (overrides config)
    COORDKIT_LOG_LEVEL            Log level (overrides config)
    RUST_LOG                      Alternative log level setting

EXAMPLES:
    # Start with defaults (API on localhost:3000, ensemble at 127.0.0.1:2181)
    coordkit

    # Short sessions, verbose logging
    coordkit --session-timeout 5000 -l debug

    # Start with config file
    coordkit -c /etc/coordkit/config.json
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("coordkit {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
