//! Shared fixtures: an in-memory stand-in for PyMOL and a server around it.

#![allow(dead_code)]

use pymol_remote::{
    start_server, CallArgs, CommandSpec, Interpreter, PymolRemoteError, Result, ServerConfig,
    ServerHandle, StateFormat,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const SESSION_MAGIC: &[u8] = b"PSE\0";

/// Observable scene state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub objects: Vec<String>,
    pub colors: BTreeMap<String, String>,
    #[serde(skip)]
    pub history: Vec<String>,
    #[serde(skip)]
    pub saves: usize,
    #[serde(skip)]
    pub loads: usize,
    #[serde(skip)]
    pub loaded_formats: Vec<String>,
}

/// Fake interpreter over a shared [`Scene`].
#[derive(Clone, Default)]
pub struct SceneInterpreter {
    scene: Arc<Mutex<Scene>>,
}

impl SceneInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scene(&self) -> Scene {
        self.scene.lock().unwrap().clone()
    }

    fn host_error(command: &str, message: impl Into<String>) -> PymolRemoteError {
        PymolRemoteError::Host {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

impl Interpreter for SceneInterpreter {
    fn commands(&mut self) -> Result<Vec<CommandSpec>> {
        Ok(vec![
            CommandSpec::new("fetch")
                .with_signature("fetch(code, name='', state=0)")
                .with_doc("Retrieve a structure from the PDB."),
            CommandSpec::new("prefetch_all"),
            CommandSpec::new("get_names").with_signature("get_names()"),
            CommandSpec::new("reinitialize"),
            CommandSpec::new("color").with_signature("color(color, selection='(all)')"),
            CommandSpec::new("do"),
            CommandSpec::new("help").with_doc("PyMOL's own help viewer."),
            CommandSpec::new("Color"),
            CommandSpec::new("sleep").with_signature("sleep(ms)"),
        ])
    }

    fn invoke(&mut self, name: &str, args: &CallArgs) -> Result<Value> {
        if name == "sleep" {
            let slots = args.bind(name, &["ms"])?;
            let ms = slots[0].and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis(ms));
            return Ok(Value::Null);
        }
        let mut scene = self.scene.lock().unwrap();
        match name {
            "fetch" => {
                let slots = args.bind(name, &["code", "name", "state"])?;
                let code = slots[0]
                    .and_then(Value::as_str)
                    .ok_or_else(|| Self::host_error(name, "code is required"))?;
                if code.len() != 4 {
                    return Err(Self::host_error(name, format!("no PDB entry {code:?}")));
                }
                let object = match slots[1].and_then(Value::as_str) {
                    Some(object) if !object.is_empty() => object.to_string(),
                    _ => code.to_lowercase(),
                };
                if !scene.objects.contains(&object) {
                    scene.objects.push(object.clone());
                }
                Ok(json!(object))
            }
            "get_names" => {
                args.bind(name, &[])?;
                Ok(json!(scene.objects))
            }
            "reinitialize" => {
                args.bind(name, &[])?;
                scene.objects.clear();
                scene.colors.clear();
                Ok(Value::Null)
            }
            "color" => {
                let slots = args.bind(name, &["color", "selection"])?;
                let color = slots[0]
                    .and_then(Value::as_str)
                    .ok_or_else(|| Self::host_error(name, "color is required"))?
                    .to_string();
                let selection = slots[1].and_then(Value::as_str).unwrap_or("(all)");
                let targets: Vec<String> = scene
                    .objects
                    .iter()
                    .filter(|object| selection == "(all)" || *object == selection)
                    .cloned()
                    .collect();
                for object in targets {
                    scene.colors.insert(object, color.clone());
                }
                Ok(Value::Null)
            }
            "do" => {
                let slots = args.bind(name, &["command"])?;
                let command = slots[0]
                    .and_then(Value::as_str)
                    .ok_or_else(|| Self::host_error(name, "command is required"))?;
                scene.history.push(command.to_string());
                Ok(Value::Null)
            }
            "prefetch_all" | "help" | "Color" => Ok(Value::Null),
            other => Err(Self::host_error(other, "unknown command")),
        }
    }

    fn save(&mut self, path: &Path, selection: &str, _state: i64, format: StateFormat) -> Result<()> {
        let mut scene = self.scene.lock().unwrap();
        scene.saves += 1;

        let bytes = match format {
            StateFormat::Pse => {
                let mut bytes = SESSION_MAGIC.to_vec();
                bytes.extend(serde_json::to_vec(&*scene)?);
                bytes
            }
            StateFormat::Png | StateFormat::Pkl => vec![0x89, b'P', b'N', b'G', 0xff],
            _ => scene
                .objects
                .iter()
                .filter(|object| selection == "(all)" || *object == selection)
                .map(|object| format!("OBJECT {object}\n"))
                .collect::<String>()
                .into_bytes(),
        };
        std::fs::write(path, bytes).map_err(|e| PymolRemoteError::io_with_path(e, path))
    }

    fn load(&mut self, path: &Path, object: &str, _state: i64, format: &str) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| PymolRemoteError::io_with_path(e, path))?;
        let mut scene = self.scene.lock().unwrap();
        scene.loads += 1;

        scene.loaded_formats.push(format.to_string());
        match format {
            "pse" => {
                let body = bytes
                    .strip_prefix(SESSION_MAGIC)
                    .ok_or_else(|| Self::host_error("load", "not a session file"))?;
                let restored: Scene = serde_json::from_slice(body)?;
                scene.objects = restored.objects;
                scene.colors = restored.colors;
            }
            _ => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| Self::host_error("load", "not a text file"))?;
                for line in text.lines() {
                    let Some(name) = line.strip_prefix("OBJECT ") else {
                        continue;
                    };
                    let name = if object.is_empty() { name } else { object };
                    if !scene.objects.iter().any(|o| o == name) {
                        scene.objects.push(name.to_string());
                    }
                }
            }
        }
        Ok(())
    }
}

/// A server on a loopback port around a fresh scene.
pub struct SceneServer {
    pub handle: ServerHandle,
    pub host: SceneInterpreter,
    pub temp_dir: TempDir,
}

impl SceneServer {
    pub fn port(&self) -> u16 {
        self.handle.port()
    }

    pub fn temp_files(&self) -> usize {
        std::fs::read_dir(self.temp_dir.path()).unwrap().count()
    }
}

pub fn loopback_config(port: u16, n_ports_to_try: u16, temp_dir: &TempDir) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        n_ports_to_try,
        temp_dir: Some(temp_dir.path().to_path_buf()),
    }
}

/// Start a scene server on an OS-assigned port.
pub async fn spawn_scene_server() -> SceneServer {
    let temp_dir = TempDir::new().unwrap();
    let host = SceneInterpreter::new();
    let handle = start_server(loopback_config(0, 1, &temp_dir), Box::new(host.clone()))
        .await
        .unwrap();
    SceneServer {
        handle,
        host,
        temp_dir,
    }
}

/// Raw JSON-RPC call, bypassing the session's negotiation.
pub async fn raw_rpc(port: u16, method: &str, params: Option<Value>) -> Value {
    let mut body = json!({"jsonrpc": "2.0", "method": method, "id": 1});
    if let Some(params) = params {
        body["params"] = params;
    }
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap()
        .post(format!("http://127.0.0.1:{port}/rpc"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}
