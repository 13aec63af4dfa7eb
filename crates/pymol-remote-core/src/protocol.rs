//! Wire types shared by the server and the client.
//!
//! Requests are JSON-RPC 2.0 objects posted to `/rpc`. A procedure that wants
//! keyword arguments is called with the packed params `[positional, keyword]`;
//! plain procedures take native JSON-RPC params (array or object).

use crate::{PymolRemoteError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used on the wire.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const HOST_ERROR: i32 = -32000;
    pub const VALIDATION_ERROR: i32 = -32005;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

impl RpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<Value>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Positional and keyword arguments of a single call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Bind the arguments to the declared parameter names of `method`.
    ///
    /// Returns one slot per declared parameter, `None` when the caller left it
    /// to its default. Surplus positional arguments, unknown keywords and
    /// parameters given twice are rejected.
    pub fn bind<'a>(&'a self, method: &str, params: &[&str]) -> Result<Vec<Option<&'a Value>>> {
        if self.positional.len() > params.len() {
            return Err(PymolRemoteError::invalid_params(
                method,
                format!(
                    "takes {} positional argument(s) but {} were given",
                    params.len(),
                    self.positional.len()
                ),
            ));
        }

        let mut slots: Vec<Option<&Value>> = params
            .iter()
            .enumerate()
            .map(|(index, _)| self.positional.get(index))
            .collect();

        for (name, value) in &self.keyword {
            let Some(index) = params.iter().position(|p| p == name) else {
                return Err(PymolRemoteError::invalid_params(
                    method,
                    format!("got an unexpected keyword argument '{name}'"),
                ));
            };
            if slots[index].is_some() {
                return Err(PymolRemoteError::invalid_params(
                    method,
                    format!("got multiple values for argument '{name}'"),
                ));
            }
            slots[index] = Some(value);
        }

        Ok(slots)
    }
}

/// Shape in which a call's arguments are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// `[positional, keyword]`, understood by keyword-adapted procedures.
    Packed,
    /// Positional arguments as a plain params array.
    Positional,
    /// Keyword arguments as a params object.
    Keyword,
    /// No params at all.
    NoArgs,
}

impl CallConvention {
    /// Conventions to try for `args`, in order.
    ///
    /// The packed form always comes first; at most one fallback follows, picked
    /// by the shape of the arguments. Mixed positional and keyword arguments can
    /// only travel packed.
    pub fn negotiation_order(args: &CallArgs) -> Vec<CallConvention> {
        let fallback = match (args.positional.is_empty(), args.keyword.is_empty()) {
            (false, true) => Some(CallConvention::Positional),
            (true, false) => Some(CallConvention::Keyword),
            (true, true) => Some(CallConvention::NoArgs),
            (false, false) => None,
        };
        std::iter::once(CallConvention::Packed).chain(fallback).collect()
    }

    /// Encode `args` as JSON-RPC params under this convention.
    pub fn encode(self, args: &CallArgs) -> Option<Value> {
        match self {
            CallConvention::Packed => Some(Value::Array(vec![
                Value::Array(args.positional.clone()),
                Value::Object(args.keyword.clone()),
            ])),
            CallConvention::Positional => Some(Value::Array(args.positional.clone())),
            CallConvention::Keyword => Some(Value::Object(args.keyword.clone())),
            CallConvention::NoArgs => None,
        }
    }
}
