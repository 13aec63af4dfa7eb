//! JSON-RPC request handlers.

use crate::interpreter::{Interpreter, SharedInterpreter};
use crate::protocol::{codes, CallArgs, RpcRequest, RpcResponse};
use crate::registry::{ProcedureKind, Registry, SIGNATURE_NOT_SUPPORTED};
use crate::state::{self, StateBlob};
use crate::{PymolRemoteError, Result};
use axum::extract::rejection::JsonRejection;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Everything a request needs, shared by all handlers.
pub struct ServerContext {
    /// Immutable after start.
    pub registry: Arc<Registry>,
    /// Held for the whole invocation of any procedure that reaches the host.
    pub interpreter: SharedInterpreter,
    /// Directory for state-transfer temp files.
    pub temp_dir: Option<PathBuf>,
}

// ============================================================================
// HTTP endpoints
// ============================================================================

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
///
/// Bodies that are not a JSON-RPC request still get a JSON-RPC error back:
/// `-32700` for malformed JSON, `-32600` for anything else.
pub async fn handle_rpc(
    State(ctx): State<Arc<ServerContext>>,
    request: std::result::Result<Json<RpcRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match request {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let code = match rejection {
                JsonRejection::JsonSyntaxError(_) => codes::PARSE_ERROR,
                _ => codes::INVALID_REQUEST,
            };
            warn!("Rejected RPC body ({}): {}", code, rejection.body_text());
            return (
                StatusCode::OK,
                Json(RpcResponse::error(None, code, rejection.body_text())),
            );
        }
    };

    let RpcRequest {
        method, params, id, ..
    } = request;

    debug!("RPC call: {}({:?})", method, params);

    let dispatch_ctx = ctx.clone();
    let dispatch_method = method.clone();
    let result = tokio::task::spawn_blocking(move || {
        dispatch(&dispatch_ctx, &dispatch_method, params)
    })
    .await
    .unwrap_or_else(|e| {
        Err(PymolRemoteError::Host {
            command: method.clone(),
            message: format!("procedure panicked: {e}"),
        })
    });

    match result {
        Ok(value) => (StatusCode::OK, Json(RpcResponse::success(id, value))),
        Err(e) => {
            match &e {
                PymolRemoteError::InvalidParams { .. } => debug!("RPC rejected {}: {}", method, e),
                PymolRemoteError::Host { .. } => warn!("RPC error for {}: {}", method, e),
                _ => error!("RPC error for {}: {}", method, e),
            }
            let code = e.to_rpc_error_code();
            (
                StatusCode::OK,
                Json(RpcResponse::error(id, code, e.to_string())),
            )
        }
    }
}

// ============================================================================
// Method dispatcher
// ============================================================================

/// Dispatch one call to its registered procedure.
///
/// Blocking: anything touching the host runs under the interpreter lock.
pub fn dispatch(ctx: &ServerContext, method: &str, params: Option<Value>) -> Result<Value> {
    let procedure = ctx
        .registry
        .get(method)
        .ok_or_else(|| PymolRemoteError::MethodNotFound {
            method: method.to_string(),
        })?;
    let args = procedure.adapter.unpack(method, params)?;

    match procedure.kind {
        ProcedureKind::Native => with_interpreter(ctx, |host| host.invoke(method, &args)),

        ProcedureKind::IsAlive => {
            args.bind(method, &[])?;
            Ok(json!(true))
        }

        ProcedureKind::GetState => {
            let slots = args.bind(method, &["selection", "state", "format"])?;
            let selection = str_arg(method, "selection", slots[0])?.unwrap_or("(all)");
            let state = i64_arg(method, "state", slots[1])?.unwrap_or(-1);
            let format = str_arg(method, "format", slots[2])?.unwrap_or("pdb");

            let blob = with_interpreter(ctx, |host| {
                state::get_state(host, ctx.temp_dir.as_deref(), selection, state, format)
            })?;
            Ok(serde_json::to_value(blob)?)
        }

        ProcedureKind::SetState => {
            let slots = args.bind(method, &["buffer", "object", "state", "format"])?;
            let buffer: StateBlob = match slots[0] {
                Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                    PymolRemoteError::invalid_params(method, format!("invalid buffer: {e}"))
                })?,
                None => {
                    return Err(PymolRemoteError::invalid_params(
                        method,
                        "missing required argument 'buffer'",
                    ))
                }
            };
            let object = str_arg(method, "object", slots[1])?.unwrap_or("");
            let state = i64_arg(method, "state", slots[2])?.unwrap_or(0);
            let format = str_arg(method, "format", slots[3])?.unwrap_or("pse");

            with_interpreter(ctx, |host| {
                state::set_state(host, ctx.temp_dir.as_deref(), &buffer, object, state, format)
            })?;
            Ok(Value::Null)
        }

        ProcedureKind::Help => {
            let slots = args.bind(method, &["command"])?;
            let command = str_arg(method, "command", slots[0])?;
            Ok(ctx.registry.help(command))
        }

        ProcedureKind::ListMethods => {
            args.bind(method, &[])?;
            Ok(json!(ctx.registry.names().collect::<Vec<_>>()))
        }

        ProcedureKind::MethodHelp => {
            let name = required_method_name(method, &args)?;
            let doc = ctx
                .registry
                .get(name)
                .map(|p| p.doc.clone())
                .unwrap_or_default();
            Ok(Value::String(doc))
        }

        ProcedureKind::MethodSignature => {
            let name = required_method_name(method, &args)?;
            let signature = ctx
                .registry
                .get(name)
                .and_then(|p| p.signature.clone())
                .unwrap_or_else(|| SIGNATURE_NOT_SUPPORTED.to_string());
            Ok(Value::String(signature))
        }
    }
}

/// Run `f` with exclusive access to the host interpreter.
fn with_interpreter<T>(
    ctx: &ServerContext,
    f: impl FnOnce(&mut dyn Interpreter) -> Result<T>,
) -> Result<T> {
    let mut guard = ctx
        .interpreter
        .lock()
        .map_err(|_| PymolRemoteError::Host {
            command: "<interpreter>".to_string(),
            message: "interpreter lock poisoned by an earlier panic".to_string(),
        })?;
    f(guard.as_mut())
}

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Optional string argument; `null` counts as absent.
fn str_arg<'a>(method: &str, name: &str, value: Option<&'a Value>) -> Result<Option<&'a str>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(PymolRemoteError::invalid_params(
            method,
            format!("argument '{name}' must be a string, got {other}"),
        )),
    }
}

/// Optional integer argument; `null` counts as absent.
fn i64_arg(method: &str, name: &str, value: Option<&Value>) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| {
            PymolRemoteError::invalid_params(
                method,
                format!("argument '{name}' must be an integer, got {v}"),
            )
        }),
    }
}

fn required_method_name<'a>(method: &str, args: &'a CallArgs) -> Result<&'a str> {
    let slots = args.bind(method, &["method_name"])?;
    str_arg(method, "method_name", slots[0])?.ok_or_else(|| {
        PymolRemoteError::invalid_params(method, "missing required argument 'method_name'")
    })
}
