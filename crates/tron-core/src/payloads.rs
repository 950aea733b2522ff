//! Typed `data` payloads for each frame kind.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AuthorizationId, QuestionId, SessionId};

// --- Handshake ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub client_name: String,
    pub client_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// --- Sessions & workspaces ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionList {
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachSession {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceList {
    #[serde(default)]
    pub workspaces: Vec<WorkspaceInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetWorkspace {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

// --- Chat stream ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSend {
    pub session_id: SessionId,
    pub content: String,
}

/// Daemon acknowledgement of a `chat_send`; the reply itself streams
/// as `chat_message` frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatAccepted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    /// Set on the last frame of a message; its content is the full text.
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub tool_call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub tool_call_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

// --- Authorization ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub authorization_id: AuthorizationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationAck {
    pub authorization_id: AuthorizationId,
}

/// What the frontend decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl AuthorizationDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub authorization_id: AuthorizationId,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthorizationResponse {
    pub fn new(authorization_id: AuthorizationId, decision: AuthorizationDecision) -> Self {
        Self {
            authorization_id,
            approved: decision.approved,
            reason: decision.reason,
        }
    }
}

// --- Questions ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubQuestion {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub question_id: QuestionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    /// Multi-answer mode: answer each entry of `questions` by id.
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub questions: Vec<SubQuestion>,
}

/// Frontend answer to a question.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuestionAnswer {
    Single(String),
    Multi(BTreeMap<String, String>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionResponse {
    pub question_id: QuestionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers: Option<BTreeMap<String, String>>,
}

impl QuestionResponse {
    /// Empty answer shaped for the request's mode.
    pub fn empty(request: &QuestionRequest) -> Self {
        if request.multi {
            Self::multi(request.question_id.clone(), BTreeMap::new())
        } else {
            Self::single(request.question_id.clone(), String::new())
        }
    }

    pub fn single(question_id: QuestionId, answer: String) -> Self {
        Self {
            question_id,
            answer: Some(answer),
            answers: None,
        }
    }

    pub fn multi(question_id: QuestionId, answers: BTreeMap<String, String>) -> Self {
        Self {
            question_id,
            answer: None,
            answers: Some(answers),
        }
    }

    /// Shape an answer for the request's mode. A single answer to a
    /// multi question fills the first sub-question; a multi answer to a
    /// single question is reduced to its first value.
    pub fn from_answer(request: &QuestionRequest, answer: QuestionAnswer) -> Self {
        let id = request.question_id.clone();
        match (request.multi, answer) {
            (false, QuestionAnswer::Single(text)) => Self::single(id, text),
            (true, QuestionAnswer::Multi(map)) => Self::multi(id, map),
            (true, QuestionAnswer::Single(text)) => {
                let mut map = BTreeMap::new();
                if let Some(first) = request.questions.first() {
                    map.insert(first.id.clone(), text);
                }
                Self::multi(id, map)
            }
            (false, QuestionAnswer::Multi(map)) => {
                Self::single(id, map.into_values().next().unwrap_or_default())
            }
        }
    }
}

// --- Lifecycle ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub preserve_session: bool,
}

/// Server-initiated termination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClosedNotice {
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_true")]
    pub reconnect: bool,
}

fn default_true() -> bool {
    true
}
