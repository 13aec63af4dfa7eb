//! PyMOL as a child process, driven through its command-line stdin.
//!
//! PyMOL started with `-p` reads command-language lines from stdin, and lines
//! starting with `/` run as Python. A small dispatch function is installed
//! once; every request is then one `/dispatch("<base64 json>")` line, and the
//! reply is the first stdout line carrying [`REPLY_TAG`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pymol_remote::{CallArgs, CommandSpec, Interpreter, PymolRemoteError, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info};

/// Prefix of reply lines written by the dispatch function.
pub const REPLY_TAG: &str = "@@pymol-remote@@";

const DISPATCH_FN: &str = "_pymol_remote_dispatch";

const PRELUDE: &str = r#"
import base64, inspect, json, sys
from pymol import cmd

def _pymol_remote_dispatch(payload):
    try:
        request = json.loads(base64.b64decode(payload).decode("utf-8"))
        if request["op"] == "commands":
            result = []
            for name in dir(cmd):
                func = getattr(cmd, name)
                if name.startswith("_") or not callable(func):
                    continue
                try:
                    signature = name + str(inspect.signature(func))
                except (TypeError, ValueError):
                    signature = None
                result.append({"name": name, "signature": signature, "doc": inspect.getdoc(func) or ""})
        elif request["op"] == "invoke":
            result = getattr(cmd, request["name"])(*request["args"], **request["kwargs"])
        else:
            raise ValueError("unknown op %r" % request["op"])
        line = json.dumps({"ok": result}, default=repr)
    except Exception as e:
        line = json.dumps({"err": "%s: %s" % (type(e).__name__, e)})
    sys.stdout.write("@@pymol-remote@@" + line + "\n")
    sys.stdout.flush()
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Reply {
    Ok(Value),
    Err(String),
}

/// [`Interpreter`] over a PyMOL process's stdin and stdout.
pub struct PipeInterpreter {
    stdin: Box<dyn Write + Send>,
    stdout: Box<dyn BufRead + Send>,
    prelude_installed: bool,
}

impl PipeInterpreter {
    pub fn new(stdin: Box<dyn Write + Send>, stdout: Box<dyn BufRead + Send>) -> Self {
        Self {
            stdin,
            stdout,
            prelude_installed: false,
        }
    }

    /// Start `program -pq HOST_ARGS...` with piped stdin and stdout.
    pub fn spawn(program: &str, host_args: &[String]) -> Result<(Self, Child)> {
        info!("Starting {} -pq {}", program, host_args.join(" "));
        let mut child = Command::new(program)
            .arg("-pq")
            .args(host_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PymolRemoteError::Host {
                command: program.to_string(),
                message: format!("failed to start: {e}"),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PymolRemoteError::Protocol {
                message: "child process has no stdio pipes".to_string(),
            });
        };

        let interpreter = Self::new(Box::new(stdin), Box::new(BufReader::new(stdout)));
        Ok((interpreter, child))
    }

    fn ensure_prelude(&mut self) -> Result<()> {
        if self.prelude_installed {
            return Ok(());
        }
        let line = format!(
            "/import base64; exec(base64.b64decode(\"{}\").decode(\"utf-8\"))\n",
            BASE64.encode(PRELUDE)
        );
        self.stdin.write_all(line.as_bytes())?;
        self.prelude_installed = true;
        Ok(())
    }

    /// Send one request and wait for its reply.
    fn request(&mut self, command: &str, request: &Value) -> Result<Value> {
        self.ensure_prelude()?;
        self.stdin.write_all(render_request(request)?.as_bytes())?;
        self.stdin.flush()?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(PymolRemoteError::Host {
                    command: command.to_string(),
                    message: "PyMOL exited".to_string(),
                });
            }
            let line = line.trim_end();
            match parse_reply(line) {
                Some(reply) => {
                    return reply.map_err(|message| PymolRemoteError::Host {
                        command: command.to_string(),
                        message,
                    })
                }
                None => debug!("pymol: {}", line),
            }
        }
    }
}

impl Interpreter for PipeInterpreter {
    fn commands(&mut self) -> Result<Vec<CommandSpec>> {
        let listed = self.request("<commands>", &json!({"op": "commands"}))?;
        Ok(serde_json::from_value(listed)?)
    }

    fn invoke(&mut self, name: &str, args: &CallArgs) -> Result<Value> {
        let request = json!({
            "op": "invoke",
            "name": name,
            "args": args.positional,
            "kwargs": args.keyword,
        });
        self.request(name, &request)
    }
}

/// The stdin line that runs `request` through the dispatch function.
fn render_request(request: &Value) -> Result<String> {
    let payload = BASE64.encode(serde_json::to_vec(request)?);
    Ok(format!("/{DISPATCH_FN}(\"{payload}\")\n"))
}

/// `None` for ordinary output, otherwise the decoded reply.
fn parse_reply(line: &str) -> Option<std::result::Result<Value, String>> {
    let body = line.strip_prefix(REPLY_TAG)?;
    Some(match serde_json::from_str::<Reply>(body) {
        Ok(Reply::Ok(value)) => Ok(value),
        Ok(Reply::Err(message)) => Err(message),
        Err(e) => Err(format!("unreadable reply {body:?}: {e}")),
    })
}
