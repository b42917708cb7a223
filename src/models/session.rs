use serde::{Deserialize, Serialize};

use super::room::ParticipantId;

/// Signed-in viewer, resolved by the auth layer before the driver is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub viewer_id: ParticipantId,
    /// Bearer token for row-level security; the anon key is used when absent.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

impl Session {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: ParticipantId::new(viewer_id),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}
