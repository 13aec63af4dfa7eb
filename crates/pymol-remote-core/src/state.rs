//! Session state transfer through temporary files.
//!
//! PyMOL only saves to and loads from named files, so every transfer goes
//! through a uniquely named temp file carrying the format's extension:
//! create → host save/load → read back (get only) → delete.

use crate::config::RpcConfig;
use crate::interpreter::Interpreter;
use crate::{PymolRemoteError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tempfile::TempPath;
use tracing::debug;

/// File formats accepted by `get_state` and `set_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateFormat {
    Pdb,
    Cif,
    Mol,
    Sdf,
    Png,
    Pkl,
    /// Whole PyMOL session; the host ignores selection and state.
    Pse,
}

impl StateFormat {
    /// Formats transferred as UTF-8 text.
    pub const TEXT: [StateFormat; 4] = [
        StateFormat::Pdb,
        StateFormat::Cif,
        StateFormat::Mol,
        StateFormat::Sdf,
    ];

    /// Formats transferred as raw bytes.
    pub const BINARY: [StateFormat; 3] = [StateFormat::Png, StateFormat::Pkl, StateFormat::Pse];

    pub fn all() -> impl Iterator<Item = StateFormat> {
        Self::TEXT.into_iter().chain(Self::BINARY)
    }

    /// Format name, also used as the file extension.
    pub fn as_str(self) -> &'static str {
        match self {
            StateFormat::Pdb => "pdb",
            StateFormat::Cif => "cif",
            StateFormat::Mol => "mol",
            StateFormat::Sdf => "sdf",
            StateFormat::Png => "png",
            StateFormat::Pkl => "pkl",
            StateFormat::Pse => "pse",
        }
    }

    pub fn is_text(self) -> bool {
        Self::TEXT.contains(&self)
    }

    /// True for the format that captures the complete interpreter session.
    pub fn is_session(self) -> bool {
        self == StateFormat::Pse
    }

    fn allowed_names() -> Vec<&'static str> {
        Self::all().map(StateFormat::as_str).collect()
    }
}

impl fmt::Display for StateFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateFormat {
    type Err = PymolRemoteError;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| PymolRemoteError::UnsupportedFormat {
                format: s.to_string(),
                allowed: Self::allowed_names(),
            })
    }
}

impl Serialize for StateFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StateFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Saved snapshot of (part of) a session.
///
/// On the wire text travels as a JSON string and bytes as
/// `{"base64": "<standard base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBlob {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireBlob {
    Text(String),
    Binary { base64: String },
}

impl StateBlob {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            StateBlob::Text(text) => text.as_bytes(),
            StateBlob::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            StateBlob::Text(text) => text.into_bytes(),
            StateBlob::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateBlob::Text(text) => Some(text),
            StateBlob::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap raw file contents the way `format` is transferred.
    pub fn from_bytes(bytes: Vec<u8>, format: StateFormat) -> Result<Self> {
        if format.is_text() {
            String::from_utf8(bytes)
                .map(StateBlob::Text)
                .map_err(|e| PymolRemoteError::Protocol {
                    message: format!("{format} state is not valid UTF-8: {e}"),
                })
        } else {
            Ok(StateBlob::Binary(bytes))
        }
    }
}

impl Serialize for StateBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            StateBlob::Text(text) => serializer.serialize_str(text),
            StateBlob::Binary(bytes) => WireBlob::Binary {
                base64: BASE64.encode(bytes),
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StateBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match WireBlob::deserialize(deserializer)? {
            WireBlob::Text(text) => Ok(StateBlob::Text(text)),
            WireBlob::Binary { base64 } => BASE64
                .decode(base64.as_bytes())
                .map(StateBlob::Binary)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Parameters of a `get_state` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStateRequest {
    /// Atom selection to save.
    pub selection: String,
    /// `-1` is the current state, `0` writes every state.
    pub state: i64,
    pub format: StateFormat,
}

impl Default for GetStateRequest {
    fn default() -> Self {
        Self {
            selection: "(all)".to_string(),
            state: -1,
            format: StateFormat::Pdb,
        }
    }
}

/// Parameters of a `set_state` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStateRequest {
    /// Object to load into; empty lets the host pick.
    pub object: String,
    /// `0` appends a new state.
    pub state: i64,
    /// Any file extension the host can load, e.g. `pse`, `mol2` or `pdb.gz`.
    pub format: String,
}

impl Default for SetStateRequest {
    fn default() -> Self {
        Self {
            object: String::new(),
            state: 0,
            format: StateFormat::Pse.as_str().to_string(),
        }
    }
}

/// Save `selection` through the host and return the file contents.
///
/// The format is validated before any temp file is created.
pub fn get_state(
    interpreter: &mut dyn Interpreter,
    temp_dir: Option<&Path>,
    selection: &str,
    state: i64,
    format: &str,
) -> Result<StateBlob> {
    let format: StateFormat = format.parse()?;
    let path = temp_path(temp_dir, format.as_str())?;
    debug!("Saving {} state of {} to {}", format, selection, path.display());

    interpreter.save(&path, selection, state, format)?;
    let bytes = std::fs::read(&path).map_err(|e| PymolRemoteError::io_with_path(e, &*path))?;

    let display = path.to_path_buf();
    path.close()
        .map_err(|e| PymolRemoteError::io_with_path(e, display))?;

    StateBlob::from_bytes(bytes, format)
}

/// Check that `format` can be used as a file extension.
///
/// Loading is not limited to the formats `get_state` returns: anything made of
/// ASCII letters, digits and inner dots (`mol2`, `pdb.gz`) is passed to the host.
pub fn load_format(format: &str) -> Result<&str> {
    let valid = !format.is_empty()
        && format.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric())
        });
    if valid {
        Ok(format)
    } else {
        Err(PymolRemoteError::InvalidFormat {
            format: format.to_string(),
        })
    }
}

/// Write `buffer` to a temp file and load it through the host.
pub fn set_state(
    interpreter: &mut dyn Interpreter,
    temp_dir: Option<&Path>,
    buffer: &StateBlob,
    object: &str,
    state: i64,
    format: &str,
) -> Result<()> {
    let format = load_format(format)?;
    let path = temp_path(temp_dir, format)?;
    debug!(
        "Loading {} bytes of {} state from {}",
        buffer.len(),
        format,
        path.display()
    );

    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| PymolRemoteError::io_with_path(e, &*path))?;
        file.write_all(buffer.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| PymolRemoteError::io_with_path(e, &*path))?;
    }

    interpreter.load(&path, object, state, format)?;

    let display = path.to_path_buf();
    path.close()
        .map_err(|e| PymolRemoteError::io_with_path(e, display))
}

/// Create an empty, closed temp file named `pymol-remote-*.{ext}`.
///
/// The returned path deletes the file when dropped.
fn temp_path(temp_dir: Option<&Path>, extension: &str) -> Result<TempPath> {
    let suffix = format!(".{extension}");
    let mut builder = tempfile::Builder::new();
    builder.prefix(RpcConfig::TEMP_FILE_PREFIX).suffix(&suffix);

    let file = match temp_dir {
        Some(dir) => builder
            .tempfile_in(dir)
            .map_err(|e| PymolRemoteError::io_with_path(e, dir))?,
        None => builder.tempfile()?,
    };
    Ok(file.into_temp_path())
}
