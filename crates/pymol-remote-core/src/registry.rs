//! Server-side command registry.
//!
//! Built once at server start from the host's native command list plus the
//! custom procedures, then shared read-only with every request.

use crate::interpreter::CommandSpec;
use crate::protocol::CallArgs;
use crate::{PymolRemoteError, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Prefix of the standard introspection procedures.
pub const INTROSPECTION_PREFIX: &str = "system.";

/// Returned by `help` for names that are not registered.
pub const HELP_NOT_FOUND: &str = "Command Not Found";

/// Returned by `system.methodSignature` when no signature is known.
pub const SIGNATURE_NOT_SUPPORTED: &str = "signatures not supported";

/// Procedure names with a fixed meaning.
pub mod names {
    pub const IS_ALIVE: &str = "is_alive";
    pub const GET_STATE: &str = "get_state";
    pub const SET_STATE: &str = "set_state";
    pub const HELP: &str = "help";
    pub const DO: &str = "do";
    pub const LIST_METHODS: &str = "system.listMethods";
    pub const METHOD_HELP: &str = "system.methodHelp";
    pub const METHOD_SIGNATURE: &str = "system.methodSignature";
}

/// How a procedure's params are unpacked into [`CallArgs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAdapter {
    /// Native JSON-RPC params: absent, a positional array, or a keyword object.
    Plain,
    /// Packed `[positional]` or `[positional, keyword]` only.
    Keyword,
}

impl ArgAdapter {
    /// Unpack request params for `method`.
    pub fn unpack(self, method: &str, params: Option<Value>) -> Result<CallArgs> {
        match self {
            ArgAdapter::Plain => match params {
                None | Some(Value::Null) => Ok(CallArgs::new()),
                Some(Value::Array(positional)) => Ok(CallArgs {
                    positional,
                    ..CallArgs::default()
                }),
                Some(Value::Object(keyword)) => Ok(CallArgs {
                    keyword,
                    ..CallArgs::default()
                }),
                Some(other) => Err(PymolRemoteError::invalid_params(
                    method,
                    format!("params must be an array or an object, got {other}"),
                )),
            },
            ArgAdapter::Keyword => {
                let packed = match params {
                    Some(Value::Array(packed)) if (1..=2).contains(&packed.len()) => packed,
                    _ => return Err(packed_shape_error(method)),
                };
                let mut parts = packed.into_iter();
                let positional = match parts.next() {
                    Some(Value::Array(positional)) => positional,
                    _ => return Err(packed_shape_error(method)),
                };
                let keyword = match parts.next() {
                    None | Some(Value::Null) => Default::default(),
                    Some(Value::Object(keyword)) => keyword,
                    Some(_) => return Err(packed_shape_error(method)),
                };
                Ok(CallArgs {
                    positional,
                    keyword,
                })
            }
        }
    }
}

fn packed_shape_error(method: &str) -> PymolRemoteError {
    PymolRemoteError::invalid_params(method, "expects params of the form [args, kwargs]")
}

/// What a registered name does when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    /// Forwarded to the host interpreter under the same name.
    Native,
    IsAlive,
    GetState,
    SetState,
    Help,
    ListMethods,
    MethodHelp,
    MethodSignature,
}

/// One registered procedure.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub signature: Option<String>,
    pub doc: String,
    pub adapter: ArgAdapter,
    pub kind: ProcedureKind,
}

impl Procedure {
    fn custom(
        name: &str,
        signature: &str,
        doc: &str,
        adapter: ArgAdapter,
        kind: ProcedureKind,
    ) -> Self {
        Self {
            name: name.to_string(),
            signature: Some(signature.to_string()),
            doc: doc.to_string(),
            adapter,
            kind,
        }
    }

    /// Signature for help output, `name(...)` when none is known.
    pub fn display_signature(&self) -> String {
        self.signature
            .clone()
            .unwrap_or_else(|| format!("{}(...)", self.name))
    }
}

/// Name → procedure map.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    procedures: BTreeMap<String, Procedure>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the host's native commands, the custom procedures and the
    /// introspection procedures, in that order.
    pub fn with_builtins(native: impl IntoIterator<Item = CommandSpec>) -> Self {
        let mut registry = Self::new();
        for spec in native {
            registry.register_native(spec);
        }
        for procedure in custom_procedures() {
            registry.register(procedure);
        }
        for procedure in introspection_procedures() {
            registry.register(procedure);
        }
        registry
    }

    /// Register `procedure`, replacing an earlier one with the same name.
    pub fn register(&mut self, procedure: Procedure) {
        if let Some(previous) = self.procedures.get(&procedure.name) {
            debug!(
                "Overriding {:?} procedure `{}` with {:?}",
                previous.kind, procedure.name, procedure.kind
            );
        }
        self.procedures.insert(procedure.name.clone(), procedure);
    }

    /// Register a host command behind the keyword adapter.
    pub fn register_native(&mut self, spec: CommandSpec) {
        self.register(Procedure {
            name: spec.name,
            signature: spec.signature,
            doc: spec.doc,
            adapter: ArgAdapter::Keyword,
            kind: ProcedureKind::Native,
        });
    }

    pub fn get(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    /// Every registered name, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    /// Registered names without the introspection procedures, sorted.
    pub fn public_names(&self) -> Vec<String> {
        self.names()
            .filter(|name| !name.starts_with(INTROSPECTION_PREFIX))
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    /// Result of the `help` procedure.
    ///
    /// Without a command: the sorted public names. With a command: its
    /// signature and docstring, or [`HELP_NOT_FOUND`].
    pub fn help(&self, command: Option<&str>) -> Value {
        match command {
            None => json!(self.public_names()),
            Some(name) => match self.get(name) {
                Some(procedure) => {
                    Value::String(format!("{}\n{}", procedure.display_signature(), procedure.doc))
                }
                None => Value::String(HELP_NOT_FOUND.to_string()),
            },
        }
    }
}

const IS_ALIVE_DOC: &str = "Ping the server to check that it is alive.

Returns:
    bool: always true while the server is serving requests.";

const GET_STATE_DOC: &str = "Get the current state of the PyMOL session in the requested format.

Args:
    - selection (str): atoms to include. Defaults to \"(all)\".
    - state (int): state to include. -1 is the current state, 0 writes every
      state into a multi-state file. Ignored for \"pse\", which always saves
      the complete session.
    - format (str): one of \"pdb\", \"cif\", \"mol\", \"sdf\" (returned as text) or
      \"png\", \"pkl\", \"pse\" (returned as bytes). Defaults to \"pdb\".

Returns:
    str | bytes: the saved file contents.";

const SET_STATE_DOC: &str = "Load a state buffer into the PyMOL session.

Args:
    - buffer (str | bytes): contents of a file in `format`.
    - object (str): object to load into. Defaults to \"\" (picked by PyMOL).
    - state (int): state to load into; 0 appends. Defaults to 0.
    - format (str): file extension of the buffer, any format PyMOL can load
      (e.g. \"mol2\", \"pdb.gz\"). Defaults to \"pse\".";

const HELP_DOC: &str = "Help for the functions served by this PyMOL RPC server.

Args:
    - command (str | None): function to describe. Without it, the list of all
      available functions is returned.";

fn custom_procedures() -> Vec<Procedure> {
    vec![
        Procedure::custom(
            names::IS_ALIVE,
            "is_alive()",
            IS_ALIVE_DOC,
            ArgAdapter::Plain,
            ProcedureKind::IsAlive,
        ),
        Procedure::custom(
            names::GET_STATE,
            "get_state(selection='(all)', state=-1, format='pdb')",
            GET_STATE_DOC,
            ArgAdapter::Keyword,
            ProcedureKind::GetState,
        ),
        Procedure::custom(
            names::SET_STATE,
            "set_state(buffer, object='', state=0, format='pse')",
            SET_STATE_DOC,
            ArgAdapter::Keyword,
            ProcedureKind::SetState,
        ),
        Procedure::custom(
            names::HELP,
            "help(command=None)",
            HELP_DOC,
            ArgAdapter::Keyword,
            ProcedureKind::Help,
        ),
    ]
}

fn introspection_procedures() -> Vec<Procedure> {
    vec![
        Procedure::custom(
            names::LIST_METHODS,
            "system.listMethods()",
            "Return the names of every registered method.",
            ArgAdapter::Plain,
            ProcedureKind::ListMethods,
        ),
        Procedure::custom(
            names::METHOD_HELP,
            "system.methodHelp(method_name)",
            "Return the docstring of a registered method.",
            ArgAdapter::Plain,
            ProcedureKind::MethodHelp,
        ),
        Procedure::custom(
            names::METHOD_SIGNATURE,
            "system.methodSignature(method_name)",
            "Return the call signature of a registered method.",
            ArgAdapter::Plain,
            ProcedureKind::MethodSignature,
        ),
    ]
}
