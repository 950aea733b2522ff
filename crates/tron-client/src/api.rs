//! Typed request helpers over [`DaemonClient::send_request`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use tron_core::ids::SessionId;
use tron_core::payloads::{
    AttachSession, ChatAccepted, ChatSend, CreateSession, SessionInfo, SessionList, SetWorkspace,
    WorkspaceInfo, WorkspaceList,
};
use tron_core::{ClientError, Frame, FrameKind};

use crate::client::DaemonClient;

impl DaemonClient {
    async fn call<Req, Resp>(&self, kind: FrameKind, payload: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let frame = Frame::with_payload(kind, payload)?;
        self.send_request(frame).await?.payload()
    }

    /// Create a session and make it current.
    pub async fn create_session(
        &self,
        workspace: Option<PathBuf>,
    ) -> Result<SessionInfo, ClientError> {
        let info: SessionInfo = self
            .call(FrameKind::SessionCreate, &CreateSession { workspace })
            .await?;
        let mut current = self.inner().session.write();
        current.session_id = Some(info.session_id.clone());
        if info.workspace.is_some() {
            current.workspace = info.workspace.clone();
        }
        info!(session_id = %info.session_id, "session created");
        Ok(info)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        let list: SessionList = self
            .call(FrameKind::SessionList, &serde_json::json!({}))
            .await?;
        Ok(list.sessions)
    }

    /// Attach to an existing session and make it current.
    pub async fn attach_session(&self, session_id: SessionId) -> Result<SessionInfo, ClientError> {
        let frame = Frame::with_payload(
            FrameKind::SessionAttach,
            &AttachSession {
                session_id: session_id.clone(),
            },
        )?;
        let response = self.send_request(frame).await?;
        // Older daemons acknowledge with an empty body.
        let info = if response.data.is_null() {
            SessionInfo {
                session_id: session_id.clone(),
                workspace: None,
                title: None,
                created_at: None,
            }
        } else {
            response.payload()?
        };
        let mut current = self.inner().session.write();
        current.session_id = Some(info.session_id.clone());
        if info.workspace.is_some() {
            current.workspace = info.workspace.clone();
        }
        Ok(info)
    }

    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>, ClientError> {
        let list: WorkspaceList = self
            .call(FrameKind::WorkspaceList, &serde_json::json!({}))
            .await?;
        Ok(list.workspaces)
    }

    /// Point the current session at `path` and remember it for replay.
    pub async fn set_workspace(&self, path: PathBuf) -> Result<(), ClientError> {
        let request = SetWorkspace {
            path: path.clone(),
            session_id: self.current_session().session_id,
        };
        let frame = Frame::with_payload(FrameKind::WorkspaceSet, &request)?;
        self.send_request(frame).await?;
        self.inner().session.write().workspace = Some(path);
        Ok(())
    }

    /// Submit a user message. Streamed output arrives through the
    /// `chat_message` / `chat_complete` callbacks.
    pub async fn chat_send(
        &self,
        session_id: SessionId,
        content: impl Into<String>,
    ) -> Result<ChatAccepted, ClientError> {
        let frame = Frame::with_payload(
            FrameKind::ChatSend,
            &ChatSend {
                session_id,
                content: content.into(),
            },
        )?;
        let response = self.send_request(frame).await?;
        if response.data.is_null() {
            return Ok(ChatAccepted::default());
        }
        response.payload()
    }

    /// Correlated ping; returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.send_request(Frame::new(FrameKind::Ping, serde_json::Value::Null))
            .await?;
        let rtt = started.elapsed();
        self.inner().stats.pong();
        Ok(rtt)
    }
}
