//! JSON bodies exchanged between [`RemoteStore`](crate::client::RemoteStore)
//! and the coordination service. Node data travels base64-encoded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};
use crate::local::NodeKind;

pub(crate) fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub(crate) fn decode(data: &str) -> CoordResult<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| CoordError::Deserialize(format!("node data: {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetRequest {
    pub path: String,
    pub data: String,
    #[serde(default)]
    pub create_if_absent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRequest {
    pub path: String,
    pub data: String,
    pub kind: NodeKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitRequest {
    pub path: String,
    pub since: u64,
    pub wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataReply {
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsReply {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChildrenReply {
    pub children: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedReply {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZxidReply {
    pub zxid: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitReply {
    pub fired: bool,
    pub zxid: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionReply {
    pub session: u64,
    pub timeout_ms: u64,
}

/// Error body of every non-2xx reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum WireError {
    Unavailable { message: String },
    NotFound { path: String },
    NodeExists { path: String },
    NotEmpty { path: String },
    InvalidPath { path: String, reason: String },
    SessionClosed { session: u64 },
    LockTimeout { path: String },
    Serialize { message: String },
    Deserialize { message: String },
}

impl From<CoordError> for WireError {
    fn from(e: CoordError) -> Self {
        match e {
            CoordError::Connection(message) => Self::Unavailable { message },
            CoordError::NotFound(path) => Self::NotFound { path },
            CoordError::NodeExists(path) => Self::NodeExists { path },
            CoordError::NotEmpty(path) => Self::NotEmpty { path },
            CoordError::InvalidPath { path, reason } => Self::InvalidPath { path, reason },
            CoordError::SessionClosed(session) => Self::SessionClosed { session },
            CoordError::LockTimeout(path) => Self::LockTimeout { path },
            CoordError::Serialize(message) => Self::Serialize { message },
            CoordError::Deserialize(message) => Self::Deserialize { message },
        }
    }
}

impl From<WireError> for CoordError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Unavailable { message } => Self::Connection(message),
            WireError::NotFound { path } => Self::NotFound(path),
            WireError::NodeExists { path } => Self::NodeExists(path),
            WireError::NotEmpty { path } => Self::NotEmpty(path),
            WireError::InvalidPath { path, reason } => Self::InvalidPath { path, reason },
            WireError::SessionClosed { session } => Self::SessionClosed(session),
            WireError::LockTimeout { path } => Self::LockTimeout(path),
            WireError::Serialize { message } => Self::Serialize(message),
            WireError::Deserialize { message } => Self::Deserialize(message),
        }
    }
}
