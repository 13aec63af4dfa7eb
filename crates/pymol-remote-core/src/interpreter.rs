//! The host application's command interpreter, as seen by the server.

use crate::protocol::CallArgs;
use crate::state::StateFormat;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A native command advertised by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    /// Rendered call signature, e.g. `fetch(code, name='', state=0)`.
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub doc: String,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signature: None,
            doc: String::new(),
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }
}

/// Live command interpreter of the host application.
///
/// Every method runs on the server's blocking pool while the server holds the
/// interpreter lock, so implementations may block and need not be reentrant.
pub trait Interpreter: Send {
    /// The native command set, queried once when the server starts.
    fn commands(&mut self) -> Result<Vec<CommandSpec>>;

    /// Run one native command and return its result.
    fn invoke(&mut self, name: &str, args: &CallArgs) -> Result<Value>;

    /// Save `selection` of `state` to `path` in `format`.
    fn save(&mut self, path: &Path, selection: &str, state: i64, format: StateFormat) -> Result<()> {
        let args = CallArgs::new()
            .arg(path.display().to_string())
            .arg(selection)
            .arg(state)
            .arg(format.as_str());
        self.invoke("save", &args).map(|_| ())
    }

    /// Load `path` into `object` at `state`.
    ///
    /// `format` is a file extension such as `pse` or `mol2`; it is not limited
    /// to the [`StateFormat`] list.
    fn load(&mut self, path: &Path, object: &str, state: i64, format: &str) -> Result<()> {
        let args = CallArgs::new()
            .arg(path.display().to_string())
            .arg(object)
            .arg(state)
            .arg(format);
        self.invoke("load", &args).map(|_| ())
    }
}

/// Interpreter behind the lock that serializes every procedure invocation.
pub type SharedInterpreter = Arc<Mutex<Box<dyn Interpreter>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(String, CallArgs)>,
    }

    impl Interpreter for Recorder {
        fn commands(&mut self) -> Result<Vec<CommandSpec>> {
            Ok(vec![CommandSpec::new("save"), CommandSpec::new("load")])
        }

        fn invoke(&mut self, name: &str, args: &CallArgs) -> Result<Value> {
            self.calls.push((name.to_string(), args.clone()));
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_default_save_and_load_go_through_native_commands() {
        let mut host = Recorder::default();
        let path = PathBuf::from("/tmp/pymol-remote-x.cif");

        host.save(&path, "chain A", 1, StateFormat::Cif).unwrap();
        host.load(&path, "copy", 0, "cif").unwrap();

        assert_eq!(host.calls[0].0, "save");
        assert_eq!(
            host.calls[0].1.positional,
            vec![json!("/tmp/pymol-remote-x.cif"), json!("chain A"), json!(1), json!("cif")]
        );
        assert_eq!(host.calls[1].0, "load");
        assert_eq!(host.calls[1].1.positional[1], json!("copy"));
        assert_eq!(host.calls[1].1.positional[3], json!("cif"));
    }
}
