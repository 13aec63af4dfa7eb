//! pymol-remote - drive a running PyMOL session over JSON-RPC.
//!
//! The server side embeds next to PyMOL's command interpreter (anything that
//! implements [`Interpreter`]), binds the first free port of a small range and
//! serves the native command set plus a few custom procedures: `is_alive`,
//! `get_state`, `set_state`, `help` and the `system.*` introspection calls.
//!
//! The client side is a [`Session`] that forwards named calls to that server.
//!
//! # Example
//!
//! ```rust,ignore
//! use pymol_remote::{CallArgs, ConnectionCache, GetStateRequest, Session, SessionOptions, StateFormat};
//!
//! #[tokio::main]
//! async fn main() -> pymol_remote::Result<()> {
//!     let cache = ConnectionCache::new();
//!     let session = Session::connect(&cache, SessionOptions::new("localhost", 9123)).await?;
//!
//!     session.invoke("fetch", CallArgs::new().arg("1ycr")).await?;
//!     println!("{:?}", session.find_command("fetc").await?);
//!
//!     let pdb = session
//!         .get_state(&GetStateRequest {
//!             format: StateFormat::Pdb,
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("Saved {} bytes", pdb.len());
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod interpreter;
pub mod matching;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;

pub use client::{ConnectionCache, RemoteCommand, Session, SessionOptions};
pub use config::{EnvVars, RpcConfig, ServerConfig};
pub use error::{PymolRemoteError, Result};
pub use interpreter::{CommandSpec, Interpreter, SharedInterpreter};
pub use matching::find_command;
pub use protocol::{CallArgs, CallConvention};
pub use registry::Registry;
pub use server::{launch_server, start_server, ServerHandle};
pub use state::{GetStateRequest, SetStateRequest, StateBlob, StateFormat};
