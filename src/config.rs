//! Startup configuration: CLI flags (§4.7), bind-address resolution, and
//! construction of the chosen [`RdfBackend`] from a run-time flag.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::backend::{BackendError, DatasetBackend, LocalGraphBackend, RdfBackend, TriplestoreBackend};

const DEFAULT_BIND: &str = "default";

/// `musepa-broker`: a CoAP publish/subscribe broker fronting a pluggable
/// RDF store. Flags map 1:1 onto the broker's configuration surface; there
/// are no subcommands, since the process only ever does one thing (run).
#[derive(Debug, Parser)]
#[command(name = "musepa-broker", version, about)]
pub struct Cli {
    /// IPv4 bind address, or "default" for loopback.
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind_v4: String,

    /// IPv6 bind address, or "default" for loopback.
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind_v6: String,

    /// UDP port both sockets listen on.
    #[arg(long, default_value_t = 5683)]
    pub port: u16,

    /// Which RDF backend to front.
    #[arg(long, value_enum, default_value_t = BackendChoice::Local)]
    pub backend: BackendChoice,

    /// Backend-specific parameter (a base URL for the remote backends;
    /// mandatory for `remote-b`).
    #[arg(long)]
    pub backend_param: Option<String>,

    /// Optional path to a Turtle-formatted prefix file.
    #[arg(long)]
    pub prefixes: Option<PathBuf>,

    /// Path to the document served verbatim at `/info`.
    #[arg(long, default_value = "./README.md")]
    pub info: PathBuf,

    /// `tracing` verbosity, e.g. "info", "debug", or a full `EnvFilter`
    /// directive string such as "musepa_broker=debug,warn".
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as newline-delimited JSON instead of human-readable text.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendChoice {
    Local,
    #[value(name = "remote-a")]
    RemoteA,
    #[value(name = "remote-b")]
    RemoteB,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The two loopback/explicit addresses the server binds to.
pub struct ResolvedAddresses {
    pub v4: IpAddr,
    pub v6: IpAddr,
}

/// Resolve the textual `--bind-v4`/`--bind-v6` flags into concrete
/// addresses. `"default"` means loopback for that address family (§4.7).
pub fn resolve_bind_addresses(bind_v4: &str, bind_v6: &str) -> Result<ResolvedAddresses, ConfigError> {
    let v4 = if bind_v4 == DEFAULT_BIND {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        bind_v4
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(bind_v4.to_string()))?
    };
    let v6 = if bind_v6 == DEFAULT_BIND {
        IpAddr::V6(Ipv6Addr::LOCALHOST)
    } else {
        bind_v6
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(bind_v6.to_string()))?
    };
    Ok(ResolvedAddresses { v4, v6 })
}

/// Build the backend named by `choice`, performing its one-time
/// reachability check (§4.2). Fatal: startup aborts if this fails.
pub async fn build_backend(
    choice: BackendChoice,
    param: Option<&str>,
) -> Result<Box<dyn RdfBackend>, ConfigError> {
    let backend: Box<dyn RdfBackend> = match choice {
        BackendChoice::Local => Box::new(LocalGraphBackend::new()?),
        BackendChoice::RemoteA => Box::new(TriplestoreBackend::new(param).await?),
        BackendChoice::RemoteB => Box::new(DatasetBackend::new(param).await?),
    };
    Ok(backend)
}

/// Initialize the global `tracing` subscriber from `--log-level`/`--log-json`.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
