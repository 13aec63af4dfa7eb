//! HTTP server implementation using Axum.

use crate::config::{RpcConfig, ServerConfig};
use crate::handler::{handle_health, handle_rpc, ServerContext};
use crate::interpreter::Interpreter;
use crate::registry::Registry;
use crate::{PymolRemoteError, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// A running server.
///
/// The serve loop lives as long as the process; dropping the handle does not
/// stop it.
#[derive(Clone)]
pub struct ServerHandle {
    addr: SocketAddr,
    requested_port: u16,
    context: Arc<ServerContext>,
}

impl ServerHandle {
    /// Address actually bound.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port actually bound; differs from [`Self::requested_port`] when the
    /// first candidates were taken.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requested_port(&self) -> u16 {
        self.requested_port
    }

    pub fn registry(&self) -> &Registry {
        &self.context.registry
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .field("requested_port", &self.requested_port)
            .field("procedures", &self.context.registry.len())
            .finish()
    }
}

/// Bind the first free port among the config's candidate ports.
pub fn bind_first_available(config: &ServerConfig) -> Result<TcpListener> {
    if config.n_ports_to_try == 0 {
        return Err(PymolRemoteError::Config {
            message: "n_ports_to_try must be at least 1".to_string(),
        });
    }

    let mut last = config.port;
    for port in config.candidate_ports() {
        last = port;
        match TcpListener::bind((config.host.as_str(), port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => warn!("Port {} on {} unavailable: {}", port, config.host, e),
        }
    }

    Err(PymolRemoteError::NoPortAvailable {
        host: config.host.clone(),
        first: config.port,
        last,
    })
}

/// Router serving `/rpc` and `/health` for `ctx`.
pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route(RpcConfig::RPC_PATH, post(handle_rpc))
        // One RPC at a time, like the host's own command loop.
        .route_layer(GlobalConcurrencyLimitLayer::new(1))
        .route(RpcConfig::HEALTH_PATH, get(handle_health))
        .layer(DefaultBodyLimit::max(RpcConfig::MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Query the host's command list and build the shared context.
///
/// Blocking: talks to the interpreter.
pub fn build_context(
    mut interpreter: Box<dyn Interpreter>,
    temp_dir: Option<PathBuf>,
) -> Result<ServerContext> {
    let native = interpreter.commands()?;
    debug!("Host advertises {} native commands", native.len());
    let registry = Registry::with_builtins(native);

    Ok(ServerContext {
        registry: Arc::new(registry),
        interpreter: Arc::new(Mutex::new(interpreter)),
        temp_dir,
    })
}

/// Start the JSON-RPC server on the current tokio runtime.
///
/// Returns once a port is bound and the registry is built; the serve loop
/// runs as a spawned task.
pub async fn start_server(
    config: ServerConfig,
    interpreter: Box<dyn Interpreter>,
) -> Result<ServerHandle> {
    let listener = bind_first_available(&config)?;
    let temp_dir = config.temp_dir.clone();
    let context = tokio::task::spawn_blocking(move || build_context(interpreter, temp_dir))
        .await
        .map_err(|e| PymolRemoteError::Host {
            command: "<commands>".to_string(),
            message: format!("command discovery panicked: {e}"),
        })??;

    let (handle, listener) = prepare(listener, &config, context)?;
    let app = build_router(handle.context.clone());

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("RPC server stopped: {}", e);
        }
    });

    report_bound(&handle, &config.host);
    Ok(handle)
}

/// Start the JSON-RPC server on a dedicated background thread.
///
/// Blocks until the port is bound and the registry is built. The thread runs
/// a single-threaded runtime for the rest of the process lifetime.
pub fn launch_server(
    config: ServerConfig,
    interpreter: Box<dyn Interpreter>,
) -> Result<ServerHandle> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<ServerHandle>>();
    let thread_config = config.clone();

    std::thread::Builder::new()
        .name(RpcConfig::SERVER_THREAD_NAME.to_string())
        .spawn(move || serve_on_current_thread(thread_config, interpreter, ready_tx))?;

    let handle = ready_rx.recv().map_err(|_| PymolRemoteError::Protocol {
        message: "server thread exited before reporting its address".to_string(),
    })??;

    report_bound(&handle, &config.host);
    Ok(handle)
}

fn serve_on_current_thread(
    config: ServerConfig,
    interpreter: Box<dyn Interpreter>,
    ready_tx: mpsc::Sender<Result<ServerHandle>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
    };

    runtime.block_on(async move {
        let started = bind_first_available(&config).and_then(|listener| {
            let context = build_context(interpreter, config.temp_dir.clone())?;
            prepare(listener, &config, context)
        });

        let (handle, listener) = match started {
            Ok(started) => started,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let app = build_router(handle.context.clone());
        if ready_tx.send(Ok(handle)).is_err() {
            return;
        }
        if let Err(e) = axum::serve(listener, app).await {
            error!("RPC server stopped: {}", e);
        }
    });
}

/// Hand a bound std listener to tokio and describe the result.
///
/// Must run inside a tokio runtime.
fn prepare(
    listener: TcpListener,
    config: &ServerConfig,
    context: ServerContext,
) -> Result<(ServerHandle, tokio::net::TcpListener)> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let handle = ServerHandle {
        addr,
        requested_port: config.port,
        context: Arc::new(context),
    };
    Ok((handle, listener))
}

/// Log where the server can be reached.
fn report_bound(handle: &ServerHandle, host: &str) {
    if handle.port() != handle.requested_port() {
        info!(
            "Port {} was taken, using port {} instead",
            handle.requested_port(),
            handle.port()
        );
    }
    info!(
        "PyMOL RPC server listening on {}:{} ({} procedures)",
        host,
        handle.port(),
        handle.registry().len()
    );

    let ip = local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "<server-ip>".to_string());

    if host == RpcConfig::ALL_INTERFACES {
        warn!(
            "Server accepts connections from any machine that can reach {}:{}; \
             there is no authentication",
            ip,
            handle.port()
        );
    } else {
        info!(
            "To reach this server from another machine, forward the port over SSH: \
             ssh -N -L {port}:localhost:{port} <user>@{ip}",
            port = handle.port(),
            ip = ip
        );
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
