use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::ClientError;
use crate::ids::RequestId;

/// Wire `type` tag. Unknown tags decode to `Other` so newer daemons
/// never break older clients.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FrameKind {
    AuthRequest,
    AuthResponse,
    SessionCreate,
    SessionList,
    SessionAttach,
    WorkspaceList,
    WorkspaceSet,
    ChatSend,
    ChatMessage,
    ChatComplete,
    ToolCall,
    ToolResult,
    Progress,
    AuthorizationRequest,
    AuthorizationAck,
    AuthorizationResponse,
    QuestionRequest,
    QuestionResponse,
    Ping,
    Pong,
    Close,
    Closed,
    Error,
    Other(String),
}

impl FrameKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthRequest => "auth_request",
            Self::AuthResponse => "auth_response",
            Self::SessionCreate => "session_create",
            Self::SessionList => "session_list",
            Self::SessionAttach => "session_attach",
            Self::WorkspaceList => "workspace_list",
            Self::WorkspaceSet => "workspace_set",
            Self::ChatSend => "chat_send",
            Self::ChatMessage => "chat_message",
            Self::ChatComplete => "chat_complete",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Progress => "progress",
            Self::AuthorizationRequest => "authorization_request",
            Self::AuthorizationAck => "authorization_ack",
            Self::AuthorizationResponse => "authorization_response",
            Self::QuestionRequest => "question_request",
            Self::QuestionResponse => "question_response",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Close => "close",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for FrameKind {
    fn from(s: &str) -> Self {
        match s {
            "auth_request" => Self::AuthRequest,
            "auth_response" => Self::AuthResponse,
            "session_create" => Self::SessionCreate,
            "session_list" => Self::SessionList,
            "session_attach" => Self::SessionAttach,
            "workspace_list" => Self::WorkspaceList,
            "workspace_set" => Self::WorkspaceSet,
            "chat_send" => Self::ChatSend,
            "chat_message" => Self::ChatMessage,
            "chat_complete" => Self::ChatComplete,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "progress" => Self::Progress,
            "authorization_request" => Self::AuthorizationRequest,
            "authorization_ack" => Self::AuthorizationAck,
            "authorization_response" => Self::AuthorizationResponse,
            "question_request" => Self::QuestionRequest,
            "question_response" => Self::QuestionResponse,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "close" => Self::Close,
            "closed" => Self::Closed,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for FrameKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<FrameKind> for String {
    fn from(kind: FrameKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error block embedded in a response frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<FrameError> for ClientError {
    fn from(e: FrameError) -> Self {
        Self::Server {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

/// One newline-delimited JSON message.
///
/// `{ type, request_id?, data, timestamp, error? }`. An absent or empty
/// `request_id` marks an unsolicited frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_id_as_none"
    )]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

fn empty_id_as_none<'de, D>(deserializer: D) -> Result<Option<RequestId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(RequestId::from_raw))
}

impl Frame {
    pub fn new(kind: FrameKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            request_id: None,
            data,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Build a frame from any serializable payload.
    pub fn with_payload<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Self, ClientError> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// A reply carrying the caller's correlation token.
    pub fn response(request_id: RequestId, kind: FrameKind, data: serde_json::Value) -> Self {
        Self::new(kind, data).with_request_id(request_id)
    }

    /// A reply whose only content is an error block.
    pub fn error_response(
        request_id: RequestId,
        kind: FrameKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut frame = Self::response(request_id, kind, serde_json::Value::Null);
        frame.error = Some(FrameError {
            code: code.into(),
            message: message.into(),
            details: None,
        });
        frame
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// The correlation token, if this frame carries a non-empty one.
    pub fn correlation_token(&self) -> Option<&RequestId> {
        self.request_id.as_ref().filter(|id| !id.is_empty())
    }

    /// Decode `data` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            ClientError::Protocol(format!("invalid {} payload: {e}", self.kind))
        })
    }

    /// Turn a response into `Ok(self)` or the embedded server error.
    pub fn into_result(self) -> Result<Self, ClientError> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self),
        }
    }

    /// Serialize to a single line without the trailing newline.
    pub fn encode(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, ClientError> {
        serde_json::from_str(line).map_err(|e| ClientError::Protocol(format!("malformed frame: {e}")))
    }
}
