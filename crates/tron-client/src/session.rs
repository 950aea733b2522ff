use std::path::PathBuf;

use serde::Serialize;
use tron_core::ids::SessionId;

/// The engine's notion of "current" session and workspace, restored after
/// a reconnect.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub session_id: Option<SessionId>,
    pub workspace: Option<PathBuf>,
}

impl SessionHandle {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.workspace.is_none()
    }
}
