//! Centralized configuration for pymol-remote.
//!
//! Constants live on unit structs; the runtime-tunable pieces (bind address,
//! candidate port range, temp directory) are carried by [`ServerConfig`] and
//! can be read from the `PYMOL_RPC_*` environment variables.

use crate::{PymolRemoteError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Network defaults shared by the server and the client.
pub struct RpcConfig;

impl RpcConfig {
    /// Loopback only; does not accept connections from other machines.
    pub const DEFAULT_HOST: &'static str = "localhost";
    /// Accepts connections from other machines.
    pub const ALL_INTERFACES: &'static str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 9123;
    pub const DEFAULT_N_PORTS_TO_TRY: u16 = 5;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub const RPC_PATH: &'static str = "/rpc";
    pub const HEALTH_PATH: &'static str = "/health";

    /// Whole-session blobs are far larger than axum's default body limit.
    pub const MAX_REQUEST_BODY_BYTES: usize = 512 * 1024 * 1024;

    pub const SERVER_THREAD_NAME: &'static str = "pymol-remote-rpc";
    pub const TEMP_FILE_PREFIX: &'static str = "pymol-remote-";
}

/// Names of the environment variables read by the library and the binary.
pub struct EnvVars;

impl EnvVars {
    pub const LOG_LEVEL: &'static str = "PYMOL_RPC_LOG_LEVEL";
    pub const HOST: &'static str = "PYMOL_RPC_HOST";
    pub const PORT: &'static str = "PYMOL_RPC_PORT";
    pub const N_PORTS_TO_TRY: &'static str = "PYMOL_RPC_N_PORTS_TO_TRY";
}

/// Settings for [`crate::server::start_server`] and [`crate::server::launch_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host name or address to bind.
    pub host: String,
    /// First candidate port.
    pub port: u16,
    /// Number of consecutive ports to try, starting at `port`.
    pub n_ports_to_try: u16,
    /// Directory for state-transfer temp files; the system temp dir when `None`.
    pub temp_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: RpcConfig::DEFAULT_HOST.to_string(),
            port: RpcConfig::DEFAULT_PORT,
            n_ports_to_try: RpcConfig::DEFAULT_N_PORTS_TO_TRY,
            temp_dir: None,
        }
    }
}

impl ServerConfig {
    /// Build a config from `PYMOL_RPC_HOST`, `PYMOL_RPC_PORT` and
    /// `PYMOL_RPC_N_PORTS_TO_TRY`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: std::env::var(EnvVars::HOST).unwrap_or(defaults.host),
            port: env_or(EnvVars::PORT, defaults.port)?,
            n_ports_to_try: env_or(EnvVars::N_PORTS_TO_TRY, defaults.n_ports_to_try)?,
            temp_dir: None,
        })
    }

    /// Candidate ports in probing order. Stops early at `u16::MAX`.
    pub fn candidate_ports(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.n_ports_to_try).map_while(move |offset| self.port.checked_add(offset))
    }
}

/// Read and parse an environment variable, using `default` when it is unset.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| PymolRemoteError::Config {
            message: format!("{key}={raw:?} is invalid: {e}"),
        }),
        Err(_) => Ok(default),
    }
}
