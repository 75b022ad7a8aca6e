//! Wire protocol for the request/reply channel.
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! Request:  {"cmd":"REGISTER"|"UNREGISTER"|"LOOKUP"|"LIST"|"PING"|"SHUTDOWN",
//!            "name"?:string, "address"?:string}
//! Response: {"status":"ok"|"error", "address"?:string,
//!            "items"?:{name:address,...}, "error"?:string}
//! ```
//!
//! # Rust Learning Note
//!
//! ## Parse, don't validate
//!
//! The raw frame is decoded exactly once, here, into the closed [`Request`]
//! enum. Everything downstream matches on variants instead of comparing
//! strings, so adding a command means adding a variant, and the compiler
//! points at every `match` that has to handle it.

use hsu_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Error code for unparseable frames and unknown commands.
pub const UNKNOWN_COMMAND: &str = "unknown_command";
/// Error code for a missing or invalid required field.
pub const INVALID_REQUEST: &str = "invalid_request";
/// Error code for lookups and removals of absent names.
pub const NOT_FOUND: &str = "not_found";
/// Error code for anything unexpected inside the server.
pub const INTERNAL_ERROR: &str = "internal_error";

/// Longest request line the server accepts, excluding the newline. A longer
/// line is answered with [`UNKNOWN_COMMAND`] and the connection is closed.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Command kinds understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Register,
    Unregister,
    Lookup,
    List,
    Ping,
    Shutdown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Register => "REGISTER",
            Command::Unregister => "UNREGISTER",
            Command::Lookup => "LOOKUP",
            Command::List => "LIST",
            Command::Ping => "PING",
            Command::Shutdown => "SHUTDOWN",
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REGISTER" => Ok(Command::Register),
            "UNREGISTER" => Ok(Command::Unregister),
            "LOOKUP" => Ok(Command::Lookup),
            "LIST" => Ok(Command::List),
            "PING" => Ok(Command::Ping),
            "SHUTDOWN" => Ok(Command::Shutdown),
            _ => Err(Error::protocol(format!("unknown command '{}'", s))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded, validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { name: String, address: String },
    Unregister { name: String },
    Lookup { name: String },
    List,
    Ping,
    Shutdown,
}

impl Request {
    /// Decodes one frame (without the trailing newline).
    ///
    /// Returns `Error::Protocol` for anything that is not a JSON object with a
    /// known string `cmd`, and `Error::Validation` when a required field is
    /// missing, empty or not a string.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| Error::protocol(format!("malformed request: {}", e)))?;
        if !value.is_object() {
            return Err(Error::protocol("request must be a JSON object"));
        }

        let wire: WireRequest = serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("malformed request: {}", e)))?;
        Self::try_from(wire)
    }

    /// Encodes the request as a single line, including the trailing newline.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_line(&WireRequest::from(self))
    }

    pub fn command(&self) -> Command {
        match self {
            Request::Register { .. } => Command::Register,
            Request::Unregister { .. } => Command::Unregister,
            Request::Lookup { .. } => Command::Lookup,
            Request::List => Command::List,
            Request::Ping => Command::Ping,
            Request::Shutdown => Command::Shutdown,
        }
    }
}

/// Loosely-typed request as it appears on the wire.
///
/// `name` and `address` stay as raw JSON values so that a present-but-wrong
/// type (`"name": 42`) is reported as a validation error, not a parse error.
#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<Value>,
}

impl TryFrom<WireRequest> for Request {
    type Error = Error;

    fn try_from(wire: WireRequest) -> Result<Self> {
        let command: Command = wire.cmd.parse()?;

        let request = match command {
            Command::Register => Request::Register {
                name: required_string("name", wire.name)?,
                address: required_string("address", wire.address)?,
            },
            Command::Unregister => Request::Unregister {
                name: required_string("name", wire.name)?,
            },
            Command::Lookup => Request::Lookup {
                name: required_string("name", wire.name)?,
            },
            Command::List => Request::List,
            Command::Ping => Request::Ping,
            Command::Shutdown => Request::Shutdown,
        };

        Ok(request)
    }
}

impl From<&Request> for WireRequest {
    fn from(request: &Request) -> Self {
        let (name, address) = match request {
            Request::Register { name, address } => (Some(name.as_str()), Some(address.as_str())),
            Request::Unregister { name } | Request::Lookup { name } => (Some(name.as_str()), None),
            Request::List | Request::Ping | Request::Shutdown => (None, None),
        };

        Self {
            cmd: request.command().as_str().to_string(),
            name: name.map(|s| Value::String(s.to_string())),
            address: address.map(|s| Value::String(s.to_string())),
        }
    }
}

fn required_string(field: &str, value: Option<Value>) -> Result<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(Error::validation(format!("'{}' must not be empty", field))),
        Some(_) => Err(Error::validation(format!("'{}' must be a string", field))),
        None => Err(Error::validation(format!("'{}' is required", field))),
    }
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Reply to exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Plain `{"status":"ok"}`.
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            address: None,
            items: None,
            error: None,
        }
    }

    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::ok()
        }
    }

    pub fn with_items(items: BTreeMap<String, String>) -> Self {
        Self {
            items: Some(items),
            ..Self::ok()
        }
    }

    /// `{"status":"error","error":code}`.
    pub fn error(code: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            address: None,
            items: None,
            error: Some(code.into()),
        }
    }

    /// Maps an error to its wire error code.
    pub fn from_error(err: &Error) -> Self {
        let code = match err.root() {
            Error::Protocol(_) => UNKNOWN_COMMAND,
            Error::Validation { .. } => INVALID_REQUEST,
            Error::NotFound { .. } => NOT_FOUND,
            Error::Transport { .. }
            | Error::InvalidAddress { .. }
            | Error::Internal(_)
            | Error::WithContext { .. } => INTERNAL_ERROR,
        };
        Self::error(code)
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Encodes the reply as a single line, including the trailing newline.
    ///
    /// Falls back to a fixed `internal_error` line if serialization fails, so
    /// a reply is always produced.
    pub fn encode(&self) -> Vec<u8> {
        encode_line(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode response");
            let mut line = format!(r#"{{"status":"error","error":"{}"}}"#, INTERNAL_ERROR).into_bytes();
            line.push(b'\n');
            line
        })
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| Error::protocol(format!("malformed response: {}", e)))
    }
}

/// Serializes `value` as compact JSON followed by `\n`.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value).map_err(|e| Error::internal(format!("encode failed: {}", e)))?;
    line.push(b'\n');
    Ok(line)
}
