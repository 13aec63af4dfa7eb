//! Client side: a session proxy for a remote PyMOL RPC server.
//!
//! A [`Session`] forwards named calls to the server over a shared
//! [`Connection`]. Connections are cached per endpoint in a caller-owned
//! [`ConnectionCache`], so opening a second session to the same server reuses
//! the first one's handle (and its cached command list) unless `force_new`
//! is requested.
//!
//! # Calling convention
//!
//! Calls are first sent packed as `[args, kwargs]`, which keyword-adapted
//! procedures understand. If the server rejects that shape with an
//! invalid-params error, the call is re-sent once as plain positional params,
//! keyword params or no params, depending on which arguments were given.
//! Transport failures are returned immediately.

use crate::config::{env_or, EnvVars, RpcConfig};
use crate::matching;
use crate::protocol::{CallArgs, CallConvention, RpcRequest, RpcResponse};
use crate::registry::{names, INTROSPECTION_PREFIX};
use crate::state::{GetStateRequest, SetStateRequest, StateBlob};
use crate::{PymolRemoteError, Result};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

/// Number of suggestions attached to a command-not-found error.
const MAX_SUGGESTIONS: usize = 5;

/// How to reach a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub hostname: String,
    pub port: u16,
    /// Open and probe a fresh connection even if one is cached.
    pub force_new: bool,
    /// Connect timeout for every call, and total timeout of the liveness probe.
    pub timeout: Duration,
    /// Total timeout of each call after the probe; unbounded when `None`.
    pub call_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            hostname: RpcConfig::DEFAULT_HOST.to_string(),
            port: RpcConfig::DEFAULT_PORT,
            force_new: false,
            timeout: RpcConfig::DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
        }
    }
}

impl SessionOptions {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ..Default::default()
        }
    }

    /// Options from `PYMOL_RPC_HOST` and `PYMOL_RPC_PORT`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            hostname: std::env::var(EnvVars::HOST).unwrap_or(defaults.hostname),
            port: env_or(EnvVars::PORT, defaults.port)?,
            ..defaults
        })
    }

    pub fn force_new(mut self, force_new: bool) -> Self {
        self.force_new = force_new;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = Some(call_timeout);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to one server endpoint.
///
/// Shared between sessions through the [`ConnectionCache`]. Request ids are
/// unique per connection.
#[derive(Debug)]
pub struct Connection {
    endpoint: String,
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    connect_timeout: Duration,
    call_timeout: Option<Duration>,
    /// Advertised procedure names, fetched on first use.
    commands: OnceCell<BTreeSet<String>>,
}

impl Connection {
    fn open(options: &SessionOptions) -> Result<Self> {
        let endpoint = options.endpoint();
        let http = reqwest::Client::builder()
            .connect_timeout(options.timeout)
            .no_proxy()
            .build()
            .map_err(|e| PymolRemoteError::Connection {
                endpoint: endpoint.clone(),
                message: error_chain(&e),
            })?;

        Ok(Self {
            url: format!("http://{}{}", endpoint, RpcConfig::RPC_PATH),
            endpoint,
            http,
            next_id: AtomicU64::new(1),
            connect_timeout: options.timeout,
            call_timeout: options.call_timeout,
            commands: OnceCell::new(),
        })
    }

    /// `host:port` this connection talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one JSON-RPC request and return its result.
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PymolRemoteError::Protocol {
                message: format!("`{method}` answered with HTTP {status}: {body}"),
            });
        }

        let response: RpcResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                PymolRemoteError::Protocol {
                    message: format!("Failed to parse response to `{method}`: {e}"),
                }
            } else {
                self.transport_error(e, timeout)
            }
        })?;

        if let Some(err) = response.error {
            return Err(PymolRemoteError::Remote {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Call `method`, negotiating the calling convention.
    pub async fn call(&self, method: &str, args: &CallArgs) -> Result<Value> {
        let fallback = CallConvention::negotiation_order(args)
            .into_iter()
            .find(|convention| *convention != CallConvention::Packed);

        let packed = CallConvention::Packed.encode(args);
        match self.send(method, packed, self.call_timeout).await {
            Err(e) if e.is_calling_convention_mismatch() => match fallback {
                Some(convention) => {
                    debug!(
                        "`{}` rejected packed arguments, retrying as {:?}",
                        method, convention
                    );
                    self.send(method, convention.encode(args), self.call_timeout)
                        .await
                }
                None => Err(e),
            },
            result => result,
        }
    }

    /// Procedure names advertised by the server, fetched once.
    pub async fn commands(&self) -> Result<&BTreeSet<String>> {
        self.commands
            .get_or_try_init(|| async {
                let listed = self
                    .send(names::LIST_METHODS, None, self.call_timeout)
                    .await?;
                let names: Vec<String> =
                    serde_json::from_value(listed).map_err(|e| PymolRemoteError::Protocol {
                        message: format!("Invalid method list from server: {e}"),
                    })?;
                debug!("Server at {} advertises {} methods", self.endpoint, names.len());
                Ok::<_, PymolRemoteError>(names.into_iter().collect())
            })
            .await
    }

    /// Liveness check used when a connection is opened.
    ///
    /// Anything but a timeout is reported as a connection error, including
    /// services that answer HTTP without speaking JSON-RPC.
    async fn probe(&self, timeout: Duration) -> Result<()> {
        let alive = match self.send(names::IS_ALIVE, None, Some(timeout)).await {
            Ok(alive) => alive,
            Err(e @ (PymolRemoteError::Timeout { .. } | PymolRemoteError::Connection { .. })) => {
                return Err(e)
            }
            Err(e) => {
                return Err(PymolRemoteError::Connection {
                    endpoint: self.endpoint.clone(),
                    message: e.to_string(),
                })
            }
        };
        if alive == Value::Bool(true) {
            return Ok(());
        }
        Err(PymolRemoteError::Connection {
            endpoint: self.endpoint.clone(),
            message: format!(
                "Failed to connect to PyMOL RPC server at `{}` (is_alive returned {}). \
                 Did you start the server already? Can you ping the host from the terminal?",
                self.endpoint, alive
            ),
        })
    }

    fn transport_error(&self, err: reqwest::Error, timeout: Option<Duration>) -> PymolRemoteError {
        if err.is_timeout() {
            PymolRemoteError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: timeout.unwrap_or(self.connect_timeout),
            }
        } else {
            PymolRemoteError::Connection {
                endpoint: self.endpoint.clone(),
                message: error_chain(&err),
            }
        }
    }
}

/// `err` and all its sources joined with `: `.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

// ============================================================================
// Connection cache
// ============================================================================

/// Connections keyed by `(hostname, port)`.
#[derive(Debug, Default)]
pub struct ConnectionCache {
    connections: Mutex<HashMap<(String, u16), Arc<Connection>>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached connection for the endpoint, if any.
    pub async fn get(&self, hostname: &str, port: u16) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .await
            .get(&(hostname.to_string(), port))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Forget every cached connection.
    pub async fn clear(&self) {
        self.connections.lock().await.clear();
    }

    async fn insert(&self, hostname: String, port: u16, connection: Arc<Connection>) {
        self.connections
            .lock()
            .await
            .insert((hostname, port), connection);
    }
}

// ============================================================================
// Session
// ============================================================================

/// Remote PyMOL session.
#[derive(Debug, Clone)]
pub struct Session {
    hostname: String,
    port: u16,
    connection: Arc<Connection>,
}

impl Session {
    /// Connect to a server, reusing a cached connection unless
    /// `options.force_new` is set.
    ///
    /// A new connection is probed with `is_alive` before it is cached.
    pub async fn connect(cache: &ConnectionCache, options: SessionOptions) -> Result<Self> {
        if !options.force_new {
            if let Some(connection) = cache.get(&options.hostname, options.port).await {
                debug!("Reusing connection to {}", connection.endpoint());
                return Ok(Self {
                    hostname: options.hostname,
                    port: options.port,
                    connection,
                });
            }
        }

        info!("Connecting to PyMOL RPC server at `{}`", options.endpoint());
        let connection = Arc::new(Connection::open(&options)?);
        connection.probe(options.timeout).await?;

        cache
            .insert(options.hostname.clone(), options.port, connection.clone())
            .await;
        Ok(Self {
            hostname: options.hostname,
            port: options.port,
            connection,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Call a procedure the server advertises.
    pub async fn invoke(&self, name: &str, args: CallArgs) -> Result<Value> {
        self.command(name).await?.call(args).await
    }

    /// Handle for a procedure the server advertises.
    ///
    /// Unknown names fail with suggestions from [`Self::find_command`].
    pub async fn command(&self, name: &str) -> Result<RemoteCommand> {
        let commands = self.connection.commands().await?;
        if !commands.contains(name) {
            return Err(PymolRemoteError::CommandNotFound {
                name: name.to_string(),
                suggestions: matching::suggest(name, commands, MAX_SUGGESTIONS),
            });
        }
        Ok(RemoteCommand {
            name: name.to_string(),
            connection: self.connection.clone(),
        })
    }

    /// Run a line of PyMOL command language.
    pub async fn do_command(&self, command: &str) -> Result<Value> {
        self.invoke(names::DO, CallArgs::new().arg(command)).await
    }

    /// Run Python code inside the PyMOL interpreter.
    pub async fn python(&self, code: &str) -> Result<Value> {
        self.do_command(&wrap_python(code)).await
    }

    /// Save (part of) the remote session.
    pub async fn get_state(&self, request: &GetStateRequest) -> Result<StateBlob> {
        let args = CallArgs::new()
            .kwarg("selection", request.selection.as_str())
            .kwarg("state", request.state)
            .kwarg("format", request.format.as_str());
        let value = self.invoke(names::GET_STATE, args).await?;
        serde_json::from_value(value).map_err(|e| PymolRemoteError::Protocol {
            message: format!("Invalid state payload: {e}"),
        })
    }

    /// Load a saved state into the remote session.
    pub async fn set_state(&self, buffer: &StateBlob, request: &SetStateRequest) -> Result<()> {
        let args = CallArgs::new()
            .arg(serde_json::to_value(buffer)?)
            .kwarg("object", request.object.as_str())
            .kwarg("state", request.state)
            .kwarg("format", request.format.as_str());
        self.invoke(names::SET_STATE, args).await.map(|_| ())
    }

    /// Usage text listing every command, or the server's help for one.
    pub async fn help(&self, command: Option<&str>) -> Result<String> {
        let Some(command) = command else {
            let commands = self.available_commands().await?;
            return Ok(render_command_list(&commands));
        };
        match self.invoke(names::HELP, CallArgs::new().arg(command)).await? {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }

    /// Advertised names matching `query` as a subsequence, shortest first.
    pub async fn find_command(&self, query: &str) -> Result<Vec<String>> {
        let commands = self.connection.commands().await?;
        Ok(matching::find_command(query, commands))
    }

    /// Every advertised name, sorted.
    pub async fn available_commands(&self) -> Result<Vec<String>> {
        Ok(self.connection.commands().await?.iter().cloned().collect())
    }

    pub async fn is_alive(&self) -> Result<bool> {
        let alive = self.invoke(names::IS_ALIVE, CallArgs::new()).await?;
        Ok(alive == Value::Bool(true))
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PymolSession(hostname={:?}, port={})",
            self.hostname, self.port
        )
    }
}

/// A procedure known to exist on the server.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    name: String,
    connection: Arc<Connection>,
}

impl RemoteCommand {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: CallArgs) -> Result<Value> {
        self.connection.call(&self.name, &args).await
    }
}

/// `code` inside PyMOL's `python` / `python end` block.
pub fn wrap_python(code: &str) -> String {
    format!("python\n{code}\npython end")
}

/// Usage hints plus commands, without introspection and capitalized names.
fn render_command_list(commands: &[String]) -> String {
    let mut text = String::from(
        "Get help for a specific command by passing its name to `help`.\n\
         For example:\n\
         ```\n\
         session.help(Some(\"fetch\"))\n\
         ```\n\
         \n\
         Available commands:",
    );
    for name in commands {
        let capitalized = name.chars().next().is_some_and(char::is_uppercase);
        if name.starts_with(INTROSPECTION_PREFIX) || capitalized {
            continue;
        }
        text.push_str("\n  - ");
        text.push_str(name);
    }
    text
}
